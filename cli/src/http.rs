use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use stride_core::api::{ApiRequest, Requester};
use stride_core::error::RequestError;
use stride_core::models::Method;

pub struct HttpConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Waits before each retry of a 5xx/429 answer. Must not decrease.
    pub retry_delays: Vec<Duration>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ],
        }
    }
}

/// Talks to the stride REST API with the user's bearer token.
pub struct HttpRequester {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    retry_delays: Vec<Duration>,
}

/// Only transport failures count as offline. Builder and redirect errors
/// would fail the same way on every replay.
fn classify(err: &reqwest::Error) -> RequestError {
    if err.is_timeout() {
        RequestError::Timeout
    } else if err.is_decode() {
        RequestError::Decode(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_body() {
        RequestError::Network(err.to_string())
    } else {
        RequestError::Invalid(err.to_string())
    }
}

fn http_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// The server reports failures as `{"error": "..."}`.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string()
        })
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

impl HttpRequester {
    pub fn new(base_url: &str, token: Option<String>, config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("stride-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            retry_delays: config.retry_delays.clone(),
        })
    }

    fn build(&self, req: &ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(http_method(req.method), format!("{}{}", self.base_url, req.path));
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        builder
    }

    /// Whether the server answers at all. Any HTTP status counts.
    pub async fn probe(&self) -> bool {
        self.client.head(&self.base_url).send().await.is_ok()
    }
}

impl Requester for HttpRequester {
    async fn request(&self, req: ApiRequest) -> Result<Value, RequestError> {
        let mut attempt = 0;
        let response = loop {
            let response = self.build(&req).send().await.map_err(|e| classify(&e))?;
            let status = response.status();
            match self.retry_delays.get(attempt) {
                Some(delay) if is_transient(status) => {
                    debug!(%status, path = %req.path, attempt, "Transient failure, retrying");
                    tokio::time::sleep(*delay).await;
                    attempt += 1;
                }
                _ => break response,
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RequestError::SessionExpired);
        }
        let body = response.bytes().await.map_err(|e| classify(&e))?;
        if !status.is_success() {
            return Err(RequestError::Http {
                status: status.as_u16(),
                message: error_message(status, &body),
            });
        }
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|e| RequestError::Decode(e.to_string()))
    }
}
