/// Errors produced by the OAuth flow, the token store and the API client.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The authorization server redirected back with an `error` parameter.
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Missing authorization code or state")]
    MissingCallbackParameters,

    /// Returned `state` did not match the stored one. The code is never exchanged.
    #[error("State mismatch - possible CSRF attack")]
    StateMismatch,

    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    #[error("No refresh token available")]
    NoRefreshToken,

    /// Refresh was rejected. Persisted tokens have already been cleared.
    #[error("Token refresh failed - please re-authenticate: {0}")]
    RefreshFailed(String),

    #[error("No access token - please log in")]
    NotAuthenticated,

    #[error("Authentication required. Please log in.")]
    AuthenticationRequired,

    /// Non-2xx response from a wrapped API call.
    #[error("HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[cfg(feature = "oauth")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Upstream status code for [`Error::HttpError`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Errors that mean the user has to log in (again).
    #[must_use]
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::NotAuthenticated
                | Self::NoRefreshToken
                | Self::RefreshFailed(_)
                | Self::AuthenticationRequired
        )
    }
}
