use axum::extract::FromRequestParts;
use axum::http::header::{AsHeaderName, HOST, ORIGIN};
use axum::http::request::Parts;

use super::error::RouteError;
use super::state::AppState;
use crate::error::Error;
use crate::types::AccessToken;

/// A valid access token, refreshed first if it was inside the refresh window.
///
/// Rejects with `401` and "Authentication required" when no usable token
/// exists.
///
/// ```rust,ignore
/// async fn handler(Authenticated(token): Authenticated) -> impl IntoResponse { ... }
/// ```
#[derive(Debug, Clone)]
pub struct Authenticated(pub AccessToken);

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = RouteError;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        state
            .manager
            .get_valid_access_token()
            .await
            .map(Self)
            .map_err(|e| {
                if e.requires_login() {
                    RouteError::Api(Error::AuthenticationRequired)
                } else {
                    RouteError::Api(e)
                }
            })
    }
}

/// Rejects requests a browser sends on behalf of another site.
///
/// `Host` must name this machine (loopback or the redirect URI host). Browsers
/// must then mark the request same-origin via `Sec-Fetch-Site`, or send an
/// `Origin` equal to the `Host`. Clients sending neither header (curl,
/// scripts) pass on the `Host` check alone.
#[derive(Debug, Clone, Copy)]
pub struct SameOrigin;

impl FromRequestParts<AppState> for SameOrigin {
    type Rejection = RouteError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let host = header_str(parts, HOST)
            .ok_or_else(|| RouteError::Forbidden("missing Host header".into()))?;
        if !state.allows_host(host) {
            tracing::warn!(host, "Rejected request for unexpected host");
            return Err(RouteError::Forbidden(format!("unexpected Host {host}")));
        }

        match header_str(parts, "sec-fetch-site") {
            Some("same-origin" | "none") => return Ok(Self),
            Some(site) => {
                tracing::warn!(site, "Rejected cross-site request");
                return Err(RouteError::Forbidden("cross-site request".into()));
            }
            None => {}
        }

        match header_str(parts, ORIGIN) {
            None => Ok(Self),
            Some(origin)
                if origin == format!("http://{host}") || origin == format!("https://{host}") =>
            {
                Ok(Self)
            }
            Some(origin) => {
                tracing::warn!(origin, "Rejected cross-origin request");
                Err(RouteError::Forbidden("cross-origin request".into()))
            }
        }
    }
}

fn header_str(parts: &Parts, name: impl AsHeaderName) -> Option<&str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}
