use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{auth::TokenStore, helpers::join_url, logging::targets, prelude::*, Error};

/// HTTP status codes that indicate transient server errors (retryable)
const RETRYABLE_STATUS_CODES: &[u16] = &[502, 503, 504];

/// Maximum number of retry attempts for transient errors
const MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds (doubles with each retry)
const INITIAL_BACKOFF_MS: u64 = 100;

/// Error body shapes used by the backend.
#[derive(Deserialize, Debug)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> Option<String> {
        self.message.or(self.error).filter(|m| !m.is_empty())
    }
}

pub struct HttpClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
}

async fn parse_response(response: Response) -> Result<Value> {
    let status_code = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| Error::GenericRequest(e.to_string()))?;

    if status_code < 400 {
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&text).map_err(|e| Error::json_parse(e.to_string()));
    }

    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(ErrorBody::into_message);
    if (400..500).contains(&status_code) {
        return Err(match message {
            Some(message) => Error::client_error(status_code, message, None),
            None => Error::client_error(status_code, format!("HTTP {status_code}"), Some(text)),
        });
    }

    Err(Error::server_error(status_code, message.unwrap_or(text)))
}

impl HttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, tokens: Arc<dyn TokenStore>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::GenericRequest(e.to_string()))?;
        Ok(Self::with_client(client, base_url, tokens))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::POST, path, Some(body)).await
    }

    pub async fn put(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        self.send(Method::PUT, path, body).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.send(Method::DELETE, path, None).await
    }

    /// Send a request with automatic retry for transient server errors (502, 503, 504).
    ///
    /// Uses exponential backoff: 100ms, 200ms, 400ms between retries. The
    /// token is re-read from the store on every call.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let full_url = join_url(&self.base_url, path);
        let token = self.tokens.token()?;

        for attempt in 0..=MAX_RETRIES {
            let mut request = self
                .client
                .request(method.clone(), &full_url)
                .header("Content-Type", "application/json");
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.body(body.to_string());
            }
            let request = request
                .build()
                .map_err(|e| Error::GenericRequest(e.to_string()))?;

            let result = self
                .client
                .execute(request)
                .await
                .map_err(|e| Error::GenericRequest(e.to_string()))?;

            let status = result.status().as_u16();

            if RETRYABLE_STATUS_CODES.contains(&status) && attempt < MAX_RETRIES {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    target: targets::REST,
                    status = status,
                    attempt = attempt + 1,
                    max_attempts = MAX_RETRIES + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    url = %path,
                    "Retryable HTTP error, backing off"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            debug!(target: targets::REST, %method, url = %path, status, "Request complete");
            return parse_response(result).await;
        }

        Err(Error::GenericRequest(format!(
            "Max retries ({MAX_RETRIES}) exceeded for {path}"
        )))
    }
}
