use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::Error;
use crate::manager::TokenManager;
use crate::oauth::{AuthClient, OAuthConfig};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};
use crate::token::KeyValueTokenStore;

const DEFAULT_BIND_ADDR: SocketAddr = SocketAddr::new(
    IpAddr::V4(Ipv4Addr::LOCALHOST),
    5173,
);
const DEFAULT_TOKEN_FILE: &str = "fitness-explorer-tokens.json";

/// Paths served by the explorer itself; the callback may not reuse them.
const RESERVED_PATHS: &[&str] = &["/", "/login", "/logout", "/status", "/api"];

/// Where tokens outlive the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenPersistence {
    File(PathBuf),
    Memory,
}

/// Explorer server configuration.
///
/// Required field (`oauth`) is a constructor parameter. Use
/// [`from_env()`](ExplorerConfig::from_env) for convention-based setup.
#[derive(Debug, Clone)]
pub struct ExplorerConfig {
    pub(crate) oauth: OAuthConfig,
    pub(crate) bind_addr: SocketAddr,
    pub(crate) persistence: TokenPersistence,
    pub(crate) retry_on_unauthorized: bool,
}

impl ExplorerConfig {
    #[must_use]
    pub fn new(oauth: OAuthConfig) -> Self {
        Self {
            oauth,
            bind_addr: DEFAULT_BIND_ADDR,
            persistence: TokenPersistence::File(DEFAULT_TOKEN_FILE.into()),
            retry_on_unauthorized: true,
        }
    }

    /// Create config from environment variables.
    ///
    /// Reads everything [`OAuthConfig::from_env`] reads, plus:
    /// - `FITNESS_BIND_ADDR`: listen address (default `127.0.0.1:5173`)
    /// - `FITNESS_TOKEN_FILE`: durable token file, or `memory` to keep tokens
    ///   in process only (default `fitness-explorer-tokens.json`)
    /// - `FITNESS_RETRY_ON_401`: `0`/`false` disables the refresh-and-retry on `401`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required vars are missing, values are
    /// invalid, or the redirect URI path collides with an explorer route.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::new(OAuthConfig::from_env()?);

        if let Ok(raw) = std::env::var("FITNESS_BIND_ADDR") {
            let addr = raw
                .parse()
                .map_err(|e| Error::Config(format!("FITNESS_BIND_ADDR: {e}")))?;
            config = config.with_bind_addr(addr);
        }
        if let Ok(raw) = std::env::var("FITNESS_TOKEN_FILE") {
            let persistence = if raw.eq_ignore_ascii_case("memory") {
                TokenPersistence::Memory
            } else {
                TokenPersistence::File(raw.into())
            };
            config = config.with_persistence(persistence);
        }
        if matches!(
            std::env::var("FITNESS_RETRY_ON_401").as_deref(),
            Ok("0") | Ok("false"),
        ) {
            config = config.with_retry_on_unauthorized(false);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the callback route can be mounted next to the explorer routes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the redirect URI has no path or its path is
    /// `/`, `/login`, `/logout`, `/status` or under `/api`.
    pub fn validate(&self) -> Result<(), Error> {
        let path = self.callback_path();
        if RESERVED_PATHS.contains(&path) || path.starts_with("/api/") {
            return Err(Error::Config(format!(
                "FITNESS_REDIRECT_URI path {path:?} collides with an explorer route, use e.g. /callback"
            )));
        }
        Ok(())
    }

    /// Override the listen address.
    #[must_use]
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Override where tokens are kept.
    #[must_use]
    pub fn with_persistence(mut self, persistence: TokenPersistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Whether API calls refresh and retry once on `401` (default: on).
    #[must_use]
    pub fn with_retry_on_unauthorized(mut self, retry: bool) -> Self {
        self.retry_on_unauthorized = retry;
        self
    }

    /// `OAuth2` settings.
    #[must_use]
    pub fn oauth(&self) -> &OAuthConfig {
        &self.oauth
    }

    /// Listen address.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Route path the authorization server redirects back to, taken from the
    /// configured redirect URI.
    #[must_use]
    pub fn callback_path(&self) -> &str {
        match self.oauth.redirect_uri().path() {
            "" => "/",
            path => path,
        }
    }

    /// Host names the explorer answers to: loopback, the bind address and the
    /// redirect URI host.
    #[must_use]
    pub fn allowed_hosts(&self) -> Vec<String> {
        let mut hosts = vec![
            "localhost".to_owned(),
            "127.0.0.1".to_owned(),
            "::1".to_owned(),
        ];
        if !self.bind_addr.ip().is_unspecified() {
            hosts.push(self.bind_addr.ip().to_string());
        }
        if let Some(host) = self.oauth.redirect_uri().host_str() {
            hosts.push(host.trim_start_matches('[').trim_end_matches(']').to_owned());
        }
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Build the token manager with the configured stores.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the token file exists but is unreadable.
    pub fn build_manager(&self) -> Result<TokenManager, Error> {
        let durable: Arc<dyn KeyValueStore> = match &self.persistence {
            TokenPersistence::File(path) => Arc::new(FileStore::open(path)?),
            TokenPersistence::Memory => Arc::new(MemoryStore::new()),
        };
        let tokens = Arc::new(KeyValueTokenStore::new(durable));
        Ok(TokenManager::new(
            AuthClient::new(self.oauth.clone()),
            tokens,
            Arc::new(MemoryStore::new()),
        ))
    }
}
