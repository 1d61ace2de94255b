//! Loopback explorer server for Axum.
//!
//! Serves the login round trip and an authenticated pass-through to the
//! fitness API, so endpoints can be explored from a browser.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use fitness_explorer::middleware::{ExplorerConfig, run};
//!
//! let config = ExplorerConfig::from_env()?;
//! run(config).await?;
//! ```
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /` | status page, shows `?error=` messages |
//! | `GET /login` | redirect to the authorization server |
//! | `GET /callback` | finish the code exchange (path follows the redirect URI) |
//! | `POST /logout` | clear tokens |
//! | `GET /status` | [`AuthStatus`](crate::manager::AuthStatus) as JSON |
//! | `ANY /api/{*path}` | authenticated call against the API base URL |
//!
//! `/logout` and `/api` only accept requests from the explorer's own origin;
//! see [`SameOrigin`].

mod config;
mod error;
mod extractor;
mod routes;
mod state;

use std::sync::Arc;

pub use config::{ExplorerConfig, TokenPersistence};
pub use error::RouteError;
pub use extractor::{Authenticated, SameOrigin};
pub use routes::explorer_routes;
pub use state::AppState;

use crate::error::Error;

/// Bind the configured address and serve the explorer until the process exits.
///
/// # Errors
///
/// Returns [`Error::Storage`] if the token file cannot be opened, or
/// [`Error::Config`] if the configuration is invalid or the address cannot be
/// bound.
pub async fn run(config: ExplorerConfig) -> Result<(), Error> {
    config.validate()?;
    let manager = Arc::new(config.build_manager()?);
    let initial = manager.state();
    let _log_changes = manager.on_auth_change(|state| {
        tracing::info!(%state, "Auth state changed");
    });

    let app = explorer_routes(manager, &config);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .map_err(|e| Error::Config(format!("bind {}: {e}", config.bind_addr())))?;

    tracing::info!(
        addr = %config.bind_addr(),
        api = %config.oauth().api_base_url(),
        state = %initial,
        "Fitness explorer listening"
    );

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Config(format!("server: {e}")))
}
