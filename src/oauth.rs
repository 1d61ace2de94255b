use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::pkce;

/// Default request timeout for token-endpoint and API calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_SCOPES: &[&str] = &[
    "athlete:profile",
    "events:read",
    "events:write",
    "file:write",
    "metrics:read",
    "metrics:write",
    "workouts:read",
    "workouts:details",
    "workouts:wod",
    "workouts:plan",
];

/// Fitness-platform `OAuth2` configuration.
///
/// Required fields are constructor parameters, so a config is never half-built.
/// Endpoints default to the TrainingPeaks sandbox.
///
/// ```rust,ignore
/// use fitness_explorer::OAuthConfig;
///
/// let config = OAuthConfig::new("my-client", "my-secret", "http://localhost:5173/callback".parse()?)
///     .with_api_base_url("https://api.trainingpeaks.com".parse()?);
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub struct OAuthConfig {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) auth_url: Url,
    pub(crate) token_url: Url,
    pub(crate) api_base_url: Url,
    pub(crate) redirect_uri: Url,
    pub(crate) scopes: Vec<String>,
    pub(crate) timeout: Duration,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("auth_url", &self.auth_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("api_base_url", &self.api_base_url.as_str())
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("scopes", &self.scopes)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OAuthConfig {
    /// Create a new OAuth2 configuration.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: Url,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri,
            auth_url: "https://oauth.sandbox.trainingpeaks.com/oauth/authorize"
                .parse()
                .expect("valid default URL"),
            token_url: "https://oauth.sandbox.trainingpeaks.com/oauth/token"
                .parse()
                .expect("valid default URL"),
            api_base_url: "https://api.sandbox.trainingpeaks.com"
                .parse()
                .expect("valid default URL"),
            scopes: DEFAULT_SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `FITNESS_CLIENT_ID`
    /// - `FITNESS_CLIENT_SECRET`
    /// - `FITNESS_REDIRECT_URI`: must be a valid URL ending in the callback route
    ///
    /// # Optional env vars
    /// - `FITNESS_AUTH_URL`, `FITNESS_TOKEN_URL`, `FITNESS_API_BASE_URL`
    /// - `FITNESS_SCOPES`: comma- or space-separated scopes
    /// - `FITNESS_TIMEOUT_SECS`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, Error> {
        let client_id = required_env("FITNESS_CLIENT_ID")?;
        let client_secret = required_env("FITNESS_CLIENT_SECRET")?;
        let redirect_uri = parse_url_env("FITNESS_REDIRECT_URI", &required_env("FITNESS_REDIRECT_URI")?)?;

        let mut config = Self::new(client_id, client_secret, redirect_uri);

        if let Ok(raw) = std::env::var("FITNESS_AUTH_URL") {
            config = config.with_auth_url(parse_url_env("FITNESS_AUTH_URL", &raw)?);
        }
        if let Ok(raw) = std::env::var("FITNESS_TOKEN_URL") {
            config = config.with_token_url(parse_url_env("FITNESS_TOKEN_URL", &raw)?);
        }
        if let Ok(raw) = std::env::var("FITNESS_API_BASE_URL") {
            config = config.with_api_base_url(parse_url_env("FITNESS_API_BASE_URL", &raw)?);
        }
        if let Ok(scopes) = std::env::var("FITNESS_SCOPES") {
            config = config.with_scopes(
                scopes
                    .split([',', ' '])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect(),
            );
        }
        if let Ok(raw) = std::env::var("FITNESS_TIMEOUT_SECS") {
            let secs: u64 = raw
                .parse()
                .map_err(|e| Error::Config(format!("FITNESS_TIMEOUT_SECS: {e}")))?;
            config = config.with_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// Override the authorization endpoint.
    #[must_use]
    pub fn with_auth_url(mut self, url: Url) -> Self {
        self.auth_url = url;
        self
    }

    /// Override the token endpoint.
    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    /// Override the REST API base URL used by [`ApiClient`](crate::api::ApiClient).
    #[must_use]
    pub fn with_api_base_url(mut self, url: Url) -> Self {
        self.api_base_url = url;
        self
    }

    /// Override the requested scopes (default: every read and write scope).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Per-request timeout applied to every outbound call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `OAuth2` client ID.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Authorization endpoint URL.
    #[must_use]
    pub fn auth_url(&self) -> &Url {
        &self.auth_url
    }

    /// Token endpoint URL.
    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// REST API base URL.
    #[must_use]
    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }

    /// `OAuth2` redirect URI.
    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Requested `OAuth2` scopes.
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn required_env(name: &str) -> Result<String, Error> {
    std::env::var(name).map_err(|_| Error::Config(format!("{name} is required")))
}

fn parse_url_env(name: &str, raw: &str) -> Result<Url, Error> {
    raw.parse()
        .map_err(|e| Error::Config(format!("{name}: {e}")))
}

/// Authorization URL plus the values that must be kept for the callback.
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
    pub code_verifier: String,
}

/// Successful token-endpoint response.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Lifetime used when the server omits `expires_in`.
    pub const DEFAULT_EXPIRES_IN: i64 = 3600;

    #[must_use]
    pub fn expires_in_or_default(&self) -> i64 {
        self.expires_in.unwrap_or(Self::DEFAULT_EXPIRES_IN)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// `OAuth2` client for the fitness platform's authorization and token endpoints.
///
/// Authenticates to the token endpoint with HTTP Basic
/// (`base64(client_id:client_secret)`).
pub struct AuthClient {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl AuthClient {
    #[must_use]
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Generate an authorization URL with fresh `state` and PKCE parameters.
    #[must_use]
    pub fn authorization_url(&self) -> AuthorizationRequest {
        let state = pkce::generate_state();
        let pair = pkce::generate_pkce();
        let scope = self.config.scopes.join(" ");

        let mut url = self.config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("scope", &scope)
            .append_pair("state", &state)
            .append_pair("code_challenge", &pair.code_challenge)
            .append_pair("code_challenge_method", "S256");

        AuthorizationRequest {
            url,
            state,
            code_verifier: pair.code_verifier,
        }
    }

    /// Exchange an authorization code for tokens using PKCE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TokenExchangeFailed`] carrying the server's
    /// `error_description` (or `error`) on any failure, including transport errors.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ];

        self.token_request(&params)
            .await
            .map_err(|e| match e {
                TokenRequestError::Rejected(detail) => Error::TokenExchangeFailed(detail),
                TokenRequestError::Transport(e) => Error::TokenExchangeFailed(e.to_string()),
            })
    }

    /// Redeem a refresh token.
    ///
    /// # Errors
    ///
    /// - [`Error::RefreshFailed`] if the token endpoint answers with a non-2xx status
    /// - [`Error::Http`] if no usable answer arrived (connect failure, timeout,
    ///   unparsable success body); the refresh token may still be valid
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        self.token_request(&params)
            .await
            .map_err(|e| match e {
                TokenRequestError::Rejected(detail) => Error::RefreshFailed(detail),
                TokenRequestError::Transport(e) => Error::Http(e),
            })
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, TokenRequestError> {
        let response = self
            .http
            .post(self.config.token_url.clone())
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.config.timeout)
            .form(params)
            .send()
            .await
            .map_err(TokenRequestError::Transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            let parsed: TokenErrorBody = serde_json::from_str(&body).unwrap_or_default();
            let detail = parsed
                .error_description
                .filter(|s| !s.is_empty())
                .or(parsed.error.filter(|s| !s.is_empty()))
                .unwrap_or_else(|| format!("token endpoint returned status {status}"));
            tracing::warn!(status, error = %detail, "Token endpoint rejected request");
            return Err(TokenRequestError::Rejected(detail));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(TokenRequestError::Transport)
    }
}

enum TokenRequestError {
    Rejected(String),
    Transport(reqwest::Error),
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_config() -> OAuthConfig {
        OAuthConfig::new(
            "brownlee-fitness",
            "s3cret",
            "https://app.example/callback".parse().unwrap(),
        )
    }

    fn query_value(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_authorization_url_contains_pkce() {
        let client = AuthClient::new(test_config());
        let req = client.authorization_url();

        assert_eq!(query_value(&req.url, "response_type").as_deref(), Some("code"));
        assert_eq!(
            query_value(&req.url, "code_challenge_method").as_deref(),
            Some("S256")
        );
        assert_eq!(
            query_value(&req.url, "client_id").as_deref(),
            Some("brownlee-fitness")
        );
        assert_eq!(
            query_value(&req.url, "redirect_uri").as_deref(),
            Some("https://app.example/callback")
        );
        assert_eq!(
            query_value(&req.url, "code_challenge"),
            Some(pkce::generate_code_challenge(&req.code_verifier))
        );
        let state = query_value(&req.url, "state").unwrap();
        assert_eq!(state.len(), 43);
        assert_eq!(state, req.state);
        assert_eq!(req.code_verifier.len(), 128);
    }

    #[test]
    fn test_authorization_url_unique_per_call() {
        let client = AuthClient::new(test_config());
        let req1 = client.authorization_url();
        let req2 = client.authorization_url();

        assert_ne!(req1.state, req2.state);
        assert_ne!(req1.code_verifier, req2.code_verifier);
    }

    #[test]
    fn test_config_defaults() {
        let config = test_config();
        assert_eq!(config.client_id(), "brownlee-fitness");
        assert_eq!(
            config.auth_url().as_str(),
            "https://oauth.sandbox.trainingpeaks.com/oauth/authorize"
        );
        assert_eq!(config.scopes().len(), 10);
        assert_eq!(config.timeout(), DEFAULT_TIMEOUT);
        assert!(!format!("{config:?}").contains("s3cret"));
    }

    #[test]
    fn test_config_with_overrides() {
        let config = test_config()
            .with_auth_url("https://custom.example.com/authorize".parse().unwrap())
            .with_scopes(vec!["athlete:profile".into()])
            .with_timeout(Duration::from_secs(5));

        assert_eq!(
            config.auth_url().as_str(),
            "https://custom.example.com/authorize"
        );
        assert_eq!(config.scopes(), &["athlete:profile"]);
        assert_eq!(config.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_exchange_code_sends_basic_auth_and_verifier() {
        let server = MockServer::start().await;
        let basic = format!("Basic {}", STANDARD.encode("brownlee-fitness:s3cret"));

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(header("authorization", basic.as_str()))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("code_verifier=the-verifier"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "acc",
                "refresh_token": "ref",
                "expires_in": 600,
                "token_type": "bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = test_config()
            .with_token_url(format!("{}/oauth/token", server.uri()).parse().unwrap());
        let tokens = AuthClient::new(config)
            .exchange_code("the-code", "the-verifier")
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "acc");
        assert_eq!(tokens.refresh_token.as_deref(), Some("ref"));
        assert_eq!(tokens.expires_in_or_default(), 600);
    }

    #[tokio::test]
    async fn test_exchange_code_surfaces_error_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Authorization code expired"
            })))
            .mount(&server)
            .await;

        let config = test_config()
            .with_token_url(format!("{}/oauth/token", server.uri()).parse().unwrap());
        let err = AuthClient::new(config)
            .exchange_code("c", "v")
            .await
            .unwrap_err();

        match err {
            Error::TokenExchangeFailed(detail) => assert_eq!(detail, "Authorization code expired"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_failure_maps_to_refresh_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("nope"))
            .mount(&server)
            .await;

        let config = test_config()
            .with_token_url(format!("{}/oauth/token", server.uri()).parse().unwrap());
        let err = AuthClient::new(config).refresh("r").await.unwrap_err();

        assert!(matches!(err, Error::RefreshFailed(_)));
    }
}
