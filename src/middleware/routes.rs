use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode, header::CONTENT_TYPE};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use super::config::ExplorerConfig;
use super::error::{RouteError, home_with_error};
use super::extractor::{Authenticated, SameOrigin};
use super::state::AppState;
use crate::manager::{AuthStatus, CallbackParams, TokenManager};

/// Seconds the callback page waits before returning home.
const SUCCESS_REDIRECT_DELAY: u32 = 2;
const FAILURE_REDIRECT_DELAY: u32 = 3;

/// Create the explorer router.
///
/// The callback is mounted at the path of the configured redirect URI.
///
/// # Panics
///
/// If that path collides with an explorer route; check with
/// [`ExplorerConfig::validate`] first.
pub fn explorer_routes(manager: Arc<TokenManager>, config: &ExplorerConfig) -> Router {
    let state = AppState::new(manager, config);

    Router::new()
        .route("/", get(home))
        .route("/login", get(login))
        .route(config.callback_path(), get(callback))
        .route("/logout", post(logout))
        .route("/status", get(status))
        .route("/api/{*path}", any(api_proxy))
        .with_state(state)
}

// ── Home ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HomeParams {
    error: Option<String>,
}

async fn home(State(state): State<AppState>, Query(params): Query<HomeParams>) -> Html<String> {
    let status = state.manager.status();
    let error = params
        .error
        .map(|e| format!(r#"<p class="error">{}</p>"#, escape_html(&e)))
        .unwrap_or_default();
    let expires = status
        .expires_at
        .map(|at| format!("<p>Token expires at {at} (epoch ms)</p>"))
        .unwrap_or_default();
    let action = if status.authenticated {
        r#"<form method="post" action="/logout"><button>Log out</button></form>
<p>Call endpoints with <code>/api/&lt;path&gt;</code>, e.g. <a href="/api/v1/athlete/profile">/api/v1/athlete/profile</a>.</p>"#
    } else {
        r#"<p><a href="/login">Log in</a></p>"#
    };

    Html(format!(
        "<!doctype html>\n<title>Fitness API Explorer</title>\n<h1>Fitness API Explorer</h1>\n\
         {error}<p>Status: <strong>{}</strong></p>\n{expires}{action}\n",
        status.state
    ))
}

// ── Login ──────────────────────────────────────────────────────────

async fn login(State(state): State<AppState>) -> Result<Redirect, RouteError> {
    let url = state.manager.initiate_login().map_err(RouteError::Flow)?;
    Ok(Redirect::to(url.as_str()))
}

// ── Callback ───────────────────────────────────────────────────────

async fn callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    match state.manager.handle_callback(params).await {
        Ok(()) => {
            tracing::info!("OAuth2 login successful");
            redirect_page("Authentication successful. Redirecting...", "/", SUCCESS_REDIRECT_DELAY)
        }
        Err(e) => {
            tracing::warn!(error = %e, "OAuth2 callback failed");
            let message = e.to_string();
            redirect_page(
                &format!("Authentication failed: {message}"),
                &home_with_error(&message),
                FAILURE_REDIRECT_DELAY,
            )
        }
    }
}

// ── Logout ─────────────────────────────────────────────────────────

async fn logout(State(state): State<AppState>, _origin: SameOrigin) -> Redirect {
    if let Err(e) = state.manager.logout() {
        tracing::warn!(error = %e, "Token clearing failed during logout");
    }
    Redirect::to("/")
}

// ── Status ─────────────────────────────────────────────────────────

async fn status(State(state): State<AppState>) -> Json<AuthStatus> {
    Json(state.manager.status())
}

// ── API proxy ──────────────────────────────────────────────────────

async fn api_proxy(
    State(state): State<AppState>,
    _origin: SameOrigin,
    _auth: Authenticated,
    method: Method,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RouteError> {
    let body: Option<Value> = if body.is_empty() {
        None
    } else {
        if !is_json(&headers) {
            return Err(RouteError::UnsupportedMediaType);
        }
        let value = serde_json::from_slice(&body)
            .map_err(|e| RouteError::BadRequest(format!("Invalid JSON in request body: {e}")))?;
        Some(value)
    };

    let endpoint = match query {
        Some(q) if !q.is_empty() => format!("/{path}?{q}"),
        _ => format!("/{path}"),
    };

    let response = state
        .api
        .send_raw(method, &endpoint, body.as_ref())
        .await
        .map_err(RouteError::Api)?;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, Json(response)).into_response())
}

// ── Helpers ────────────────────────────────────────────────────────

fn redirect_page(message: &str, target: &str, delay_secs: u32) -> Html<String> {
    let target = escape_html(target);
    Html(format!(
        "<!doctype html>\n<meta http-equiv=\"refresh\" content=\"{delay_secs};url={target}\">\n\
         <title>Fitness API Explorer</title>\n<p>{}</p>\n<p><a href=\"{target}\">Continue</a></p>\n",
        escape_html(message)
    ))
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{AuthClient, OAuthConfig};
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::token::{KeyValueTokenStore, TokenRecord, TokenStore};
    use crate::types::{AuthState, EpochMillis};
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use url::Url;
    use wiremock::matchers::{body_string_contains, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        server: MockServer,
        manager: Arc<TokenManager>,
        tokens: Arc<KeyValueTokenStore>,
    }

    impl Harness {
        async fn start() -> Self {
            let server = MockServer::start().await;
            let base = Url::parse(&server.uri()).unwrap();
            let config = OAuthConfig::new(
                "brownlee-fitness",
                "secret",
                "http://localhost:5173/callback".parse().unwrap(),
            )
            .with_auth_url(base.join("/OAuth/Authorize").unwrap())
            .with_token_url(base.join("/oauth/token").unwrap())
            .with_api_base_url(base.clone());

            let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
            let tokens = Arc::new(KeyValueTokenStore::new(durable));
            let manager = Arc::new(TokenManager::new(
                AuthClient::new(config),
                tokens.clone(),
                Arc::new(MemoryStore::new()),
            ));
            Self {
                server,
                manager,
                tokens,
            }
        }

        fn router(&self) -> Router {
            let config = ExplorerConfig::new(OAuthConfig::new(
                "brownlee-fitness",
                "secret",
                "http://localhost:5173/callback".parse().unwrap(),
            ));
            explorer_routes(self.manager.clone(), &config)
        }

        fn seed_token(&self, access: &str) {
            let expires_at = EpochMillis::now().saturating_add_millis(3_600_000);
            self.tokens
                .set(&TokenRecord::new(access, Some("refresh-1".into()), expires_at))
                .unwrap();
        }
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Option<String>, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let location = response
            .headers()
            .get(header::LOCATION)
            .map(|v| v.to_str().unwrap().to_owned());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, location, String::from_utf8(bytes.to_vec()).unwrap())
    }

    const HOST: &str = "localhost:5173";

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, HOST)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn status_reports_unauthenticated() {
        let h = Harness::start().await;
        let (status, _, body) = send(h.router(), get_req("/status")).await;

        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["state"], "unauthenticated");
        assert_eq!(json["authenticated"], false);
    }

    #[tokio::test]
    async fn login_redirects_to_authorization_server() {
        let h = Harness::start().await;
        let (status, location, _) = send(h.router(), get_req("/login")).await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        let location = Url::parse(&location.unwrap()).unwrap();
        assert_eq!(location.path(), "/OAuth/Authorize");
        assert!(
            location
                .query_pairs()
                .any(|(k, v)| k == "code_challenge_method" && v == "S256")
        );
        assert_eq!(h.manager.state(), AuthState::PendingCallback);
    }

    #[tokio::test]
    async fn callback_round_trip_authenticates() {
        let h = Harness::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "access-1",
                "refresh_token": "refresh-1",
                "expires_in": 3600,
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&h.server)
            .await;

        let (_, location, _) = send(h.router(), get_req("/login")).await;
        let location = Url::parse(&location.unwrap()).unwrap();
        let state = location
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();

        let uri = format!("/callback?code=auth-code&state={state}");
        let (status, _, body) = send(h.router(), get_req(&uri)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Authentication successful"));
        assert!(body.contains("content=\"2;url=/\""));
        assert!(h.manager.is_authenticated());
    }

    #[tokio::test]
    async fn callback_with_wrong_state_shows_error_and_returns_home() {
        let h = Harness::start().await;
        send(h.router(), get_req("/login")).await;

        let (status, _, body) =
            send(h.router(), get_req("/callback?code=auth-code&state=forged")).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("State mismatch - possible CSRF attack"));
        assert!(body.contains("content=\"3;url=/?error=State%20mismatch"));
        assert!(!h.manager.is_authenticated());
    }

    #[tokio::test]
    async fn callback_with_provider_error_shows_description() {
        let h = Harness::start().await;
        send(h.router(), get_req("/login")).await;

        let (_, _, body) = send(
            h.router(),
            get_req("/callback?error=access_denied&error_description=User%20declined"),
        )
        .await;

        assert!(body.contains("User declined"));
        assert_eq!(h.manager.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn logout_clears_tokens_and_redirects_home() {
        let h = Harness::start().await;
        h.seed_token("access-1");

        let request = Request::builder()
            .method("POST")
            .uri("/logout")
            .header(header::HOST, HOST)
            .header(header::ORIGIN, "http://localhost:5173")
            .header("sec-fetch-site", "same-origin")
            .body(Body::empty())
            .unwrap();
        let (status, location, _) = send(h.router(), request).await;

        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(location.as_deref(), Some("/"));
        assert_eq!(h.manager.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn logout_rejects_get_and_cross_site_posts() {
        let h = Harness::start().await;
        h.seed_token("access-1");

        let (status, _, _) = send(h.router(), get_req("/logout")).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let request = Request::builder()
            .method("POST")
            .uri("/logout")
            .header(header::HOST, HOST)
            .header(header::ORIGIN, "https://evil.example")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(h.router(), request).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(h.manager.is_authenticated());
    }

    #[tokio::test]
    async fn api_proxy_requires_login() {
        let h = Harness::start().await;
        let (status, _, body) = send(h.router(), get_req("/api/v1/athlete/profile")).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["error"], "Authentication required. Please log in.");
    }

    #[tokio::test]
    async fn api_proxy_forwards_method_query_and_body() {
        let h = Harness::start().await;
        h.seed_token("access-1");
        Mock::given(method("POST"))
            .and(path("/v2/workouts"))
            .and(header_eq("authorization", "Bearer access-1"))
            .and(body_string_contains("\"Title\":\"Ride\""))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(serde_json::json!({ "Id": 42 })),
            )
            .expect(1)
            .mount(&h.server)
            .await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/v2/workouts?athleteId=7")
            .header(header::HOST, HOST)
            .header(header::ORIGIN, "http://localhost:5173")
            .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from(r#"{"Title":"Ride"}"#))
            .unwrap();
        let (status, _, body) = send(h.router(), request).await;

        assert_eq!(status, StatusCode::CREATED);
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], 201);
        assert_eq!(json["status_text"], "Created");
        assert!(json["headers"].is_object());
        assert_eq!(json["data"]["Id"], 42);
        assert!(json["url"].as_str().unwrap().ends_with("/v2/workouts?athleteId=7"));
    }

    #[tokio::test]
    async fn api_proxy_rejects_malformed_body() {
        let h = Harness::start().await;
        h.seed_token("access-1");

        let request = Request::builder()
            .method("PUT")
            .uri("/api/v2/workouts/1")
            .header(header::HOST, HOST)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _, body) = send(h.router(), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Invalid JSON in request body"));
    }

    #[tokio::test]
    async fn api_proxy_rejects_foreign_origins_before_calling_upstream() {
        let h = Harness::start().await;
        h.seed_token("access-1");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&h.server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&h.server)
            .await;

        let foreign_origin = Request::builder()
            .method("POST")
            .uri("/api/v2/workouts")
            .header(header::HOST, HOST)
            .header(header::ORIGIN, "https://evil.example")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(r#"{"Title":"pwn"}"#))
            .unwrap();
        let (status, _, _) = send(h.router(), foreign_origin).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let cross_site = Request::builder()
            .method("DELETE")
            .uri("/api/v2/workouts/1")
            .header(header::HOST, HOST)
            .header("sec-fetch-site", "cross-site")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(h.router(), cross_site).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let rebound_host = Request::builder()
            .uri("/api/v1/athlete/profile")
            .header(header::HOST, "evil.example:5173")
            .header("sec-fetch-site", "same-origin")
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(h.router(), rebound_host).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn api_proxy_requires_json_content_type_for_bodies() {
        let h = Harness::start().await;
        h.seed_token("access-1");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&h.server)
            .await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/v2/workouts")
            .header(header::HOST, HOST)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(r#"{"Title":"Ride"}"#))
            .unwrap();
        let (status, _, _) = send(h.router(), request).await;

        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn home_escapes_error_message() {
        let h = Harness::start().await;
        let (status, _, body) =
            send(h.router(), get_req("/?error=%3Cscript%3Ealert(1)%3C%2Fscript%3E")).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>"));
        assert!(body.contains(r#"<a href="/login">"#));
    }
}
