//! Access-token lifecycle: login initiation, callback handling, refresh and
//! status.
//!
//! [`TokenManager`] is the only writer of the [`TokenStore`]. Every API
//! caller goes through [`TokenManager::get_valid_access_token`], which never
//! hands out a token within
//! [`REFRESH_SKEW_MILLIS`](crate::token::REFRESH_SKEW_MILLIS) of expiry.
//!
//! Concurrent callers that hit the refresh window are coalesced: the first
//! one refreshes while the others wait on the same lock and then reuse the
//! fresh token.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::error::Error;
use crate::oauth::{AuthClient, TokenResponse};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::token::{AuthSession, PendingLoginStore, TokenRecord, TokenStore};
use crate::types::{AccessToken, AuthState, EpochMillis, RefreshToken};

/// Query parameters of the authorization-server redirect.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Snapshot returned by [`TokenManager::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthStatus {
    pub state: AuthState,
    pub authenticated: bool,
    /// Epoch millis of the stored token's expiry, if any.
    pub expires_at: Option<EpochMillis>,
}

/// Callback registration from [`TokenManager::on_auth_change`].
///
/// The callback stops firing once this is dropped.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct AuthSubscription {
    handle: JoinHandle<()>,
}

impl Drop for AuthSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct TokenManager {
    client: AuthClient,
    tokens: Arc<dyn TokenStore>,
    pending: PendingLoginStore,
    refresh_lock: Mutex<()>,
    state_tx: watch::Sender<AuthState>,
}

impl TokenManager {
    /// Build a manager over an injected token store and session-scoped store.
    pub fn new(
        client: AuthClient,
        tokens: Arc<dyn TokenStore>,
        session_store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Unauthenticated);
        let manager = Self {
            client,
            tokens,
            pending: PendingLoginStore::new(session_store),
            refresh_lock: Mutex::new(()),
            state_tx,
        };
        manager.notify();
        manager
    }

    /// Manager with both stores in memory. Tokens do not survive the process.
    pub fn in_memory(client: AuthClient) -> Self {
        let durable = Arc::new(MemoryStore::new());
        let tokens = Arc::new(crate::token::KeyValueTokenStore::new(durable));
        Self::new(client, tokens, Arc::new(MemoryStore::new()))
    }

    /// Underlying token endpoint client.
    #[must_use]
    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    /// Current lifecycle state, derived from the stores.
    pub fn state(&self) -> AuthState {
        let now = EpochMillis::now();
        match self.tokens.get() {
            Ok(Some(record)) if record.is_usable(now) => return AuthState::Authenticated,
            Ok(Some(_)) => return AuthState::Expired,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Token store read failed"),
        }
        match self.pending.peek() {
            Ok(Some(_)) => AuthState::PendingCallback,
            _ => AuthState::Unauthenticated,
        }
    }

    /// State, liveness and expiry in one snapshot, as served on `/status`.
    pub fn status(&self) -> AuthStatus {
        let expires_at = self.tokens.get().ok().flatten().map(|r| r.expires_at);
        AuthStatus {
            state: self.state(),
            authenticated: self.is_authenticated(),
            expires_at,
        }
    }

    /// Start a login round trip.
    ///
    /// Stores a fresh `state` and code verifier and returns the authorization
    /// URL. The caller performs the full-page redirect to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the pending session cannot be saved.
    pub fn initiate_login(&self) -> Result<Url, Error> {
        let request = self.client.authorization_url();
        self.pending
            .save(&AuthSession::new(request.state, request.code_verifier))?;
        tracing::info!(client_id = %self.client.config().client_id(), "Login initiated");
        self.notify();
        Ok(request.url)
    }

    /// Complete a login from the redirect's query parameters.
    ///
    /// # Errors
    ///
    /// - [`Error::AuthorizationDenied`] if the server returned `error`
    /// - [`Error::MissingCallbackParameters`] if `code` or `state` is absent
    /// - [`Error::StateMismatch`] if `state` differs from the stored one; the
    ///   pending session is discarded and the code is not exchanged
    /// - [`Error::TokenExchangeFailed`] if the token endpoint rejects the code
    pub async fn handle_callback(&self, params: CallbackParams) -> Result<(), Error> {
        if let Some(error) = params.error {
            let detail = params
                .error_description
                .filter(|d| !d.is_empty())
                .unwrap_or(error);
            tracing::warn!(error = %detail, "Authorization denied by server");
            self.pending.clear()?;
            self.notify();
            return Err(Error::AuthorizationDenied(detail));
        }

        let (Some(code), Some(returned_state)) = (params.code, params.state) else {
            return Err(Error::MissingCallbackParameters);
        };

        let session = self.pending.take()?;
        let Some(session) = session.filter(|s| s.state == returned_state) else {
            tracing::warn!("OAuth state mismatch");
            self.notify();
            return Err(Error::StateMismatch);
        };

        let result = self
            .exchange_code_for_tokens(&code, &session.code_verifier)
            .await;
        self.notify();

        match result {
            Ok(_) => {
                tracing::info!("Login successful");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Token exchange failed");
                Err(e)
            }
        }
    }

    pub(crate) async fn exchange_code_for_tokens(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenRecord, Error> {
        let issued_at = EpochMillis::now();
        let response = self.client.exchange_code(code, code_verifier).await?;
        let record = record_from_response(response, None, issued_at);
        self.tokens.set(&record)?;
        Ok(record)
    }

    /// Redeem the stored refresh token.
    ///
    /// # Errors
    ///
    /// - [`Error::NoRefreshToken`] if none is stored
    /// - [`Error::RefreshFailed`] if the token endpoint rejects it; the whole
    ///   token record is cleared first
    /// - [`Error::Http`] if the token endpoint could not be reached; stored
    ///   tokens are kept
    pub async fn refresh_access_token(&self) -> Result<AccessToken, Error> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    /// Return an access token that is outside the refresh window, refreshing
    /// first if needed.
    ///
    /// # Errors
    ///
    /// [`Error::NotAuthenticated`] without a stored token, otherwise whatever
    /// [`refresh_access_token`](Self::refresh_access_token) fails with.
    pub async fn get_valid_access_token(&self) -> Result<AccessToken, Error> {
        let record = self.tokens.get()?.ok_or(Error::NotAuthenticated)?;
        if record.is_usable(EpochMillis::now()) {
            return Ok(record.access_token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        let record = self.tokens.get()?.ok_or(Error::NotAuthenticated)?;
        if record.is_usable(EpochMillis::now()) {
            return Ok(record.access_token);
        }
        tracing::debug!("Access token inside refresh window, refreshing");
        self.refresh_locked().await
    }

    /// Force a refresh after the server rejected `stale`, unless another
    /// caller already replaced it.
    ///
    /// # Errors
    ///
    /// Same as [`refresh_access_token`](Self::refresh_access_token), plus
    /// [`Error::NotAuthenticated`] if the record vanished.
    pub async fn refresh_rejected_token(&self, stale: &AccessToken) -> Result<AccessToken, Error> {
        let _guard = self.refresh_lock.lock().await;
        let record = self.tokens.get()?.ok_or(Error::NotAuthenticated)?;
        if &record.access_token != stale {
            return Ok(record.access_token);
        }
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<AccessToken, Error> {
        let previous = self
            .tokens
            .get()?
            .and_then(|r| r.refresh_token)
            .ok_or(Error::NoRefreshToken)?;

        let issued_at = EpochMillis::now();
        match self.client.refresh(previous.as_str()).await {
            Ok(response) => {
                let record = record_from_response(response, Some(previous), issued_at);
                self.tokens.set(&record)?;
                tracing::info!(expires_at = %record.expires_at, "Access token refreshed");
                self.notify();
                Ok(record.access_token)
            }
            Err(e @ Error::RefreshFailed(_)) => {
                tracing::warn!(error = %e, "Refresh rejected, clearing stored tokens");
                if let Err(clear_err) = self.tokens.clear() {
                    tracing::error!(error = %clear_err, "Failed to clear tokens after refresh failure");
                }
                self.notify();
                Err(e)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Refresh did not complete, keeping stored tokens");
                Err(e)
            }
        }
    }

    /// True iff a token is stored and `now < expires_at`. Never refreshes.
    pub fn is_authenticated(&self) -> bool {
        match self.tokens.get() {
            Ok(Some(record)) => record.is_live(EpochMillis::now()),
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Token store read failed");
                false
            }
        }
    }

    /// Clear tokens and any pending login. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if a store cannot be cleared.
    pub fn logout(&self) -> Result<(), Error> {
        self.tokens.clear()?;
        self.pending.clear()?;
        tracing::info!("Logged out");
        self.notify();
        Ok(())
    }

    /// Receiver of state transitions caused by this manager.
    ///
    /// Passing into the refresh window with time alone is not broadcast.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    /// Invoke `callback` on every state transition until the returned
    /// subscription is dropped. Must be called inside a Tokio runtime.
    pub fn on_auth_change<F>(&self, callback: F) -> AuthSubscription
    where
        F: Fn(AuthState) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                callback(state);
            }
        });
        AuthSubscription { handle }
    }

    fn notify(&self) {
        let current = self.state();
        self.state_tx.send_if_modified(|state| {
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }
}

fn record_from_response(
    response: TokenResponse,
    previous_refresh: Option<RefreshToken>,
    issued_at: EpochMillis,
) -> TokenRecord {
    let expires_in = response.expires_in_or_default();
    let refresh = response.refresh_token.map(RefreshToken).or(previous_refresh);
    TokenRecord::issued_at(response.access_token, refresh, issued_at, expires_in)
}
