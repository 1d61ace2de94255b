//! Authenticated request issuer for the fitness-platform REST API.
//!
//! Every call obtains its bearer token from an [`AccessTokenProvider`]
//! (normally the [`TokenManager`]), so callers never see a token inside the
//! refresh window. On a `401` the request is retried once after a forced
//! refresh unless disabled with
//! [`with_retry_on_unauthorized(false)`](ApiClient::with_retry_on_unauthorized).

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::Error;
use crate::manager::TokenManager;
use crate::oauth::DEFAULT_TIMEOUT;
use crate::types::AccessToken;

pub const DEFAULT_USER_AGENT: &str = "TrainingPeaks API Tester/1.0";

/// Non-JSON error bodies are cut to this many characters.
const RAW_ERROR_LIMIT: usize = 200;

/// Source of bearer tokens for [`ApiClient`].
pub trait AccessTokenProvider: Send + Sync + 'static {
    /// A token that is safe to use right now.
    fn access_token(&self) -> impl Future<Output = Result<AccessToken, Error>> + Send;

    /// Called after the API rejected `stale` with `401`.
    fn refresh_rejected(
        &self,
        stale: &AccessToken,
    ) -> impl Future<Output = Result<AccessToken, Error>> + Send;
}

impl AccessTokenProvider for TokenManager {
    async fn access_token(&self) -> Result<AccessToken, Error> {
        self.get_valid_access_token().await
    }

    async fn refresh_rejected(&self, stale: &AccessToken) -> Result<AccessToken, Error> {
        self.refresh_rejected_token(stale).await
    }
}

/// Raw result of an endpoint call, whatever the status.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    /// Canonical reason phrase, e.g. `Not Found`.
    pub status_text: String,
    pub url: String,
    pub content_type: Option<String>,
    /// Response headers by lowercase name; repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, `{"raw": "<text>"}` for non-JSON, `null` when empty.
    pub data: Value,
}

impl ApiResponse {
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct ApiClient<P = TokenManager> {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<P>,
    user_agent: String,
    timeout: Duration,
    retry_on_unauthorized: bool,
}

impl ApiClient<TokenManager> {
    /// Client for the manager's configured API base URL, sharing its
    /// connection pool and timeout.
    #[must_use]
    pub fn for_manager(manager: Arc<TokenManager>) -> Self {
        let config = manager.client().config();
        let base_url = config.api_base_url().clone();
        let timeout = config.timeout();
        let http = manager.client().http().clone();
        Self::new(base_url, manager)
            .with_timeout(timeout)
            .with_http_client(http)
    }
}

impl<P: AccessTokenProvider> ApiClient<P> {
    #[must_use]
    pub fn new(base_url: Url, tokens: Arc<P>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            tokens,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: DEFAULT_TIMEOUT,
            retry_on_unauthorized: true,
        }
    }

    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a `401` triggers one forced refresh and retry (default: on).
    #[must_use]
    pub fn with_retry_on_unauthorized(mut self, retry: bool) -> Self {
        self.retry_on_unauthorized = retry;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an endpoint path (e.g. `/v1/athlete/profile`) against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEndpoint`] for absolute URLs or unparsable paths.
    pub fn endpoint_url(&self, path: &str) -> Result<Url, Error> {
        let path_only = path.split(['?', '#']).next().unwrap_or_default();
        if path_only.contains("://") {
            return Err(Error::InvalidEndpoint(format!(
                "{path}: expected a path relative to the API base URL"
            )));
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let relative = path.trim_start_matches('/');
        let url: Url = format!("{base}/{relative}")
            .parse()
            .map_err(|e| Error::InvalidEndpoint(format!("{path}: {e}")))?;
        if url.origin() != self.base_url.origin() {
            return Err(Error::InvalidEndpoint(format!(
                "{path}: resolves outside the API base URL"
            )));
        }
        Ok(url)
    }

    /// Issue an authenticated request and return the JSON body.
    ///
    /// # Errors
    ///
    /// - [`Error::AuthenticationRequired`] if no usable token can be obtained
    /// - [`Error::HttpError`] for non-2xx responses, with the best message
    ///   extracted from the body
    /// - [`Error::InvalidJson`] if a 2xx body is not JSON
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, Error> {
        let (response, url) = self.execute(method.clone(), path, body).await?;
        let status = response.status();
        let content_type = content_type(&response);
        let text = response.text().await?;

        if !status.is_success() {
            let message = error_message(status, &text);
            tracing::warn!(%method, url = %url, status = status.as_u16(), error = %message, "API request failed");
            return Err(Error::HttpError {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(%method, url = %url, status = status.as_u16(), "API request succeeded");
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            Error::InvalidJson(format!(
                "{url} returned {} that is not JSON: {e}",
                content_type.as_deref().unwrap_or("a body")
            ))
        })
    }

    /// Issue an authenticated request and report status and body without
    /// treating non-2xx as an error. Used by the endpoint tester.
    ///
    /// # Errors
    ///
    /// Authentication and transport failures only.
    pub async fn send_raw(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, Error> {
        let (response, url) = self.execute(method, path, body).await?;
        let status = response.status();
        let content_type = content_type(&response);
        let headers = header_map(&response);
        let text = response.text().await?;

        let data = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or_else(|_| serde_json::json!({ "raw": text }))
        };

        Ok(ApiResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            url: url.into(),
            content_type,
            headers,
            data,
        })
    }

    /// # Errors
    ///
    /// See [`request`](Self::request); also [`Error::InvalidJson`] if the body
    /// does not match `T`.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let value = self.request(Method::GET, path, None).await?;
        decode(value)
    }

    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let body = encode(body)?;
        let value = self.request(Method::POST, path, Some(&body)).await?;
        decode(value)
    }

    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, Error> {
        let body = encode(body)?;
        let value = self.request(Method::PUT, path, Some(&body)).await?;
        decode(value)
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn delete(&self, path: &str) -> Result<Value, Error> {
        self.request(Method::DELETE, path, None).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(reqwest::Response, Url), Error> {
        let url = self.endpoint_url(path)?;
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(authentication_required)?;

        let response = self.send_once(&method, &url, body, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED || !self.retry_on_unauthorized {
            return Ok((response, url));
        }

        tracing::info!(url = %url, "API rejected access token, refreshing and retrying once");
        let token = self
            .tokens
            .refresh_rejected(&token)
            .await
            .map_err(authentication_required)?;
        let response = self.send_once(&method, &url, body, &token).await?;
        Ok((response, url))
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        body: Option<&Value>,
        token: &AccessToken,
    ) -> Result<reqwest::Response, Error> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token.as_str()))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.user_agent)
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }
}

fn authentication_required(e: Error) -> Error {
    if e.requires_login() {
        tracing::debug!(cause = %e, "No usable access token");
        Error::AuthenticationRequired
    } else {
        e
    }
}

fn content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn header_map(response: &reqwest::Response) -> BTreeMap<String, String> {
    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in response.headers() {
        let value = String::from_utf8_lossy(value.as_bytes());
        headers
            .entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    headers
}

fn encode<B: Serialize>(body: &B) -> Result<Value, Error> {
    serde_json::to_value(body).map_err(|e| Error::InvalidJson(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, Error> {
    serde_json::from_value(value).map_err(|e| Error::InvalidJson(e.to_string()))
}

/// Best human-readable message from an error response body.
///
/// Accepts a JSON array of messages, a JSON object with
/// `error_description`/`error`, a JSON string, or raw text.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    let reason = status.canonical_reason().unwrap_or("Request failed");

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Array(items)) if !items.is_empty() => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Ok(Value::Object(map)) => ["error_description", "error", "message", "Message"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()))
            .map_or_else(|| reason.to_owned(), str::to_owned),
        Ok(Value::String(s)) if !s.is_empty() => s,
        Ok(_) => reason.to_owned(),
        Err(_) => {
            let raw = body.trim();
            if raw.is_empty() {
                reason.to_owned()
            } else {
                let truncated: String = raw.chars().take(RAW_ERROR_LIMIT).collect();
                format!("{reason}: {truncated}")
            }
        }
    }
}
