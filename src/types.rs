use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Bearer access token issued by the token endpoint.
///
/// `Debug` is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct AccessToken(pub String);

impl AccessToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccessToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// Long-lived refresh token. Same redaction rules as [`AccessToken`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct RefreshToken(pub String);

impl RefreshToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RefreshToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl std::fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RefreshToken(..)")
    }
}

/// Absolute instant in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, From,
    Into,
)]
#[serde(transparent)]
pub struct EpochMillis(pub i64);

impl EpochMillis {
    #[must_use]
    pub fn now() -> Self {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        Self(i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn saturating_add_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    #[must_use]
    pub fn saturating_sub_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_sub(millis))
    }
}

/// Authentication lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[display("unauthenticated")]
    Unauthenticated,
    /// Login initiated, waiting for the authorization server redirect.
    #[display("pending_callback")]
    PendingCallback,
    #[display("authenticated")]
    Authenticated,
    /// Token present but inside the refresh window.
    #[display("expired")]
    Expired,
}
