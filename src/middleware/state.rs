use std::sync::Arc;

use super::config::ExplorerConfig;
use crate::api::ApiClient;
use crate::manager::TokenManager;

/// Shared state for explorer route handlers.
#[derive(Clone)]
pub struct AppState {
    pub(crate) manager: Arc<TokenManager>,
    pub(crate) api: Arc<ApiClient>,
    allowed_hosts: Arc<[String]>,
}

impl AppState {
    pub(super) fn new(manager: Arc<TokenManager>, config: &ExplorerConfig) -> Self {
        let api = ApiClient::for_manager(manager.clone())
            .with_retry_on_unauthorized(config.retry_on_unauthorized);
        Self {
            manager,
            api: Arc::new(api),
            allowed_hosts: config.allowed_hosts().into(),
        }
    }

    /// Whether a `Host` header value (with or without port) names this server.
    pub(super) fn allows_host(&self, host: &str) -> bool {
        let name = match host.strip_prefix('[') {
            Some(rest) => rest.split(']').next().unwrap_or_default(),
            None => host.split(':').next().unwrap_or_default(),
        };
        self.allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(name))
    }
}
