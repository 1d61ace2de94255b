use std::sync::Arc;

use crate::error::Error;
use crate::storage::KeyValueStore;
use crate::types::{AccessToken, EpochMillis, RefreshToken};

pub const ACCESS_TOKEN_KEY: &str = "tp_access_token";
pub const REFRESH_TOKEN_KEY: &str = "tp_refresh_token";
pub const TOKEN_EXPIRY_KEY: &str = "tp_token_expiry";
pub const CODE_VERIFIER_KEY: &str = "tp_code_verifier";
pub const STATE_KEY: &str = "tp_state";

/// Tokens are refreshed this long before their declared expiry.
pub const REFRESH_SKEW_MILLIS: i64 = 5 * 60 * 1000;

/// Persisted token set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TokenRecord {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
    pub expires_at: EpochMillis,
}

impl TokenRecord {
    #[must_use]
    pub fn new(
        access_token: impl Into<AccessToken>,
        refresh_token: Option<RefreshToken>,
        expires_at: EpochMillis,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    /// Build a record for a token issued at `issued_at` that lives `expires_in_secs`.
    #[must_use]
    pub fn issued_at(
        access_token: impl Into<AccessToken>,
        refresh_token: Option<RefreshToken>,
        issued_at: EpochMillis,
        expires_in_secs: i64,
    ) -> Self {
        let lifetime = expires_in_secs.saturating_mul(1000);
        Self::new(
            access_token,
            refresh_token,
            issued_at.saturating_add_millis(lifetime),
        )
    }

    /// `now < expires_at`.
    #[must_use]
    pub fn is_live(&self, now: EpochMillis) -> bool {
        now < self.expires_at
    }

    /// `now < expires_at - skew`; false means a refresh must happen before use.
    #[must_use]
    pub fn is_usable(&self, now: EpochMillis) -> bool {
        now < self.expires_at.saturating_sub_millis(REFRESH_SKEW_MILLIS)
    }
}

/// Storage for the process-wide [`TokenRecord`].
///
/// Only the token manager writes through this trait.
pub trait TokenStore: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backing store cannot be read.
    fn get(&self) -> Result<Option<TokenRecord>, Error>;

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the record cannot be committed.
    fn set(&self, record: &TokenRecord) -> Result<(), Error>;

    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the record cannot be removed.
    fn clear(&self) -> Result<(), Error>;
}

/// [`TokenStore`] laid out as three string keys in a [`KeyValueStore`].
///
/// Expiry is stored as epoch milliseconds in decimal. A record with a
/// missing or unparsable expiry reads as absent.
#[derive(Clone)]
pub struct KeyValueTokenStore {
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueTokenStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

impl TokenStore for KeyValueTokenStore {
    fn get(&self) -> Result<Option<TokenRecord>, Error> {
        let Some(access_token) = self.store.get(ACCESS_TOKEN_KEY)? else {
            return Ok(None);
        };
        let expires_at = match self.store.get(TOKEN_EXPIRY_KEY)? {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(millis) => EpochMillis(millis),
                Err(_) => {
                    tracing::warn!(value = %raw, "Unparsable token expiry, ignoring stored token");
                    return Ok(None);
                }
            },
            None => return Ok(None),
        };
        let refresh_token = self.store.get(REFRESH_TOKEN_KEY)?.map(RefreshToken);
        Ok(Some(TokenRecord {
            access_token: AccessToken(access_token),
            refresh_token,
            expires_at,
        }))
    }

    fn set(&self, record: &TokenRecord) -> Result<(), Error> {
        self.store
            .set(ACCESS_TOKEN_KEY, record.access_token.as_str())?;
        match &record.refresh_token {
            Some(refresh) => self.store.set(REFRESH_TOKEN_KEY, refresh.as_str())?,
            None => self.store.remove(REFRESH_TOKEN_KEY)?,
        }
        self.store
            .set(TOKEN_EXPIRY_KEY, &record.expires_at.0.to_string())
    }

    fn clear(&self) -> Result<(), Error> {
        self.store.remove(ACCESS_TOKEN_KEY)?;
        self.store.remove(REFRESH_TOKEN_KEY)?;
        self.store.remove(TOKEN_EXPIRY_KEY)
    }
}

/// Transient login round-trip data.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct AuthSession {
    pub state: String,
    pub code_verifier: String,
}

impl AuthSession {
    #[must_use]
    pub fn new(state: impl Into<String>, code_verifier: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            code_verifier: code_verifier.into(),
        }
    }
}

/// Holds the [`AuthSession`] in the session-scoped store between
/// login initiation and callback.
#[derive(Clone)]
pub struct PendingLoginStore {
    store: Arc<dyn KeyValueStore>,
}

impl PendingLoginStore {
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub fn save(&self, session: &AuthSession) -> Result<(), Error> {
        self.store.set(CODE_VERIFIER_KEY, &session.code_verifier)?;
        self.store.set(STATE_KEY, &session.state)
    }

    /// Read the pending session without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub fn peek(&self) -> Result<Option<AuthSession>, Error> {
        let state = self.store.get(STATE_KEY)?;
        let code_verifier = self.store.get(CODE_VERIFIER_KEY)?;
        Ok(state
            .zip(code_verifier)
            .map(|(state, code_verifier)| AuthSession {
                state,
                code_verifier,
            }))
    }

    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub fn clear(&self) -> Result<(), Error> {
        self.store.remove(STATE_KEY)?;
        self.store.remove(CODE_VERIFIER_KEY)
    }

    /// Remove and return the pending session. At most one caller observes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on store failure.
    pub fn take(&self) -> Result<Option<AuthSession>, Error> {
        let session = self.peek()?;
        self.clear()?;
        Ok(session)
    }
}
