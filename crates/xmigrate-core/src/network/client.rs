//! Authenticated HTTP client for one imaging-data server.
//!
//! Wraps reqwest with:
//! - Base URL resolution and query encoding
//! - Basic authentication
//! - Status-code classification into [`MigrateError`] variants, so callers
//!   only ever see the engine's error taxonomy

use crate::config::NetworkConfig;
use crate::{MigrateError, Result};
use reqwest::{Body, Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Which side of the migration a client talks to.
///
/// Transport failures are reported as `SourceUnavailable` or
/// `DestinationUnavailable` depending on the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Source,
    Destination,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Source => write!(f, "source"),
            ServerRole::Destination => write!(f, "destination"),
        }
    }
}

/// HTTP client bound to one server.
pub struct HttpClient {
    client: Client,
    base_url: Url,
    role: ServerRole,
    credentials: Option<(String, String)>,
}

impl HttpClient {
    /// Create a client for `base_url` with the default request timeout.
    pub fn new(
        base_url: &str,
        role: ServerRole,
        credentials: Option<(String, String)>,
    ) -> Result<Self> {
        Self::with_timeout(base_url, role, credentials, NetworkConfig::TRANSFER_TIMEOUT)
    }

    /// Create a client with a custom overall timeout.
    ///
    /// The engine applies its own per-call timeouts; this one is a backstop
    /// for transfers that stall.
    pub fn with_timeout(
        base_url: &str,
        role: ServerRole,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| MigrateError::Config {
            message: format!("Invalid {} URL '{}': {}", role, base_url, e),
        })?;
        // Url::join drops the last segment unless the base ends in a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| MigrateError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self {
            client,
            base_url,
            role,
            credentials,
        })
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a server-relative path (`/data/projects/P1`) plus query pairs.
    pub fn url(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| MigrateError::Config {
                message: format!("Invalid request path '{}': {}", path, e),
            })?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Send a request and classify a non-success status into an error.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<Body>,
    ) -> Result<Response> {
        let url = self.url(path, query)?;
        debug!("{} {} {}", self.role, method, url);

        let mut request = self.client.request(method.clone(), url.clone());
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| self.transport_error(&method, &url, e))?;
        self.check_response_status(response, path).await
    }

    /// GET a path and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T> {
        let response = self.send(Method::GET, path, query, None).await?;
        let text = response.text().await.map_err(|e| MigrateError::Network {
            message: format!("Failed to read body of {}: {}", path, e),
            source: Some(e),
        })?;
        serde_json::from_str(&text).map_err(|e| MigrateError::Json {
            message: format!("Invalid JSON from {} {}: {}", self.role, path, e),
            source: Some(e),
        })
    }

    /// GET a path and return the body as text.
    pub async fn get_text(&self, path: &str) -> Result<String> {
        let response = self.send(Method::GET, path, &[], None).await?;
        response.text().await.map_err(|e| MigrateError::Network {
            message: format!("Failed to read body of {}: {}", path, e),
            source: Some(e),
        })
    }

    /// Check if an HTTP status code indicates a retryable error.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
    }

    /// Map an unsuccessful status to the engine's error taxonomy.
    pub fn classify_status(&self, status: StatusCode, path: &str, body: &str) -> MigrateError {
        let message = if body.is_empty() {
            format!("{} returned {}", path, status)
        } else {
            format!("{} returned {}: {}", path, status, truncate(body, 200))
        };

        if matches!(status.as_u16(), 401 | 403) {
            return MigrateError::Authorization {
                server: self.role.to_string(),
                message,
            };
        }

        if Self::is_retryable_status(status) {
            return self.unavailable(message, Some(status.as_u16()));
        }

        if status == StatusCode::NOT_FOUND && self.role == ServerRole::Source {
            return MigrateError::SourceNotFound {
                source_id: path.to_string(),
            };
        }

        MigrateError::Rejected {
            server: self.role.to_string(),
            message,
            status: status.as_u16(),
        }
    }

    // Internal methods

    fn unavailable(&self, message: String, status: Option<u16>) -> MigrateError {
        match self.role {
            ServerRole::Source => MigrateError::SourceUnavailable { message, status },
            ServerRole::Destination => MigrateError::DestinationUnavailable { message, status },
        }
    }

    fn transport_error(&self, method: &Method, url: &Url, err: reqwest::Error) -> MigrateError {
        if err.is_timeout() {
            return MigrateError::Timeout(Duration::ZERO);
        }
        self.unavailable(format!("{} {} failed: {}", method, url, err), None)
    }

    async fn check_response_status(&self, response: Response, path: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.classify_status(status, path, &body))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
