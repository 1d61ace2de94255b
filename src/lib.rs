#![doc = include_str!("../README.md")]

pub mod error;
pub mod storage;
pub mod token;
pub mod types;

#[cfg(feature = "oauth")]
pub mod api;
#[cfg(feature = "oauth")]
pub mod manager;
#[cfg(feature = "oauth")]
pub mod oauth;
#[cfg(feature = "oauth")]
pub mod pkce;

#[cfg(feature = "middleware")]
pub mod middleware;

// Re-exports for convenient access
pub use error::Error;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use token::{KeyValueTokenStore, PendingLoginStore, TokenRecord, TokenStore};
pub use types::{AccessToken, AuthState, EpochMillis, RefreshToken};

#[cfg(feature = "oauth")]
pub use api::{AccessTokenProvider, ApiClient, ApiResponse};
#[cfg(feature = "oauth")]
pub use manager::{AuthStatus, AuthSubscription, CallbackParams, TokenManager};
#[cfg(feature = "oauth")]
pub use oauth::{AuthClient, AuthorizationRequest, OAuthConfig, TokenResponse};
#[cfg(feature = "oauth")]
pub use pkce::{PkcePair, generate_code_challenge, generate_code_verifier, generate_state};
