//! JSON-over-HTTP transport for sync rounds.

use std::fmt;
use std::time::Duration;

use crate::{RemoteError, RemoteExchange, SyncRequest, SyncResponse};

/// Default request timeout for exchanges.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts each [`SyncRequest`] to one endpoint and reads a [`SyncResponse`] back.
///
/// # Thread Safety
///
/// The remote is safe to clone and share across threads. Each clone shares
/// the underlying HTTP connection pool.
#[derive(Clone)]
pub struct HttpRemote {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemote")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    /// Creates a remote for `endpoint`, sending `token` as a bearer token.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is blank or not an `http(s)` URL, or
    /// if the HTTP client fails to build.
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, RemoteError> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            return Err(RemoteError::InvalidEndpoint {
                reason: "endpoint cannot be empty",
            });
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(RemoteError::InvalidEndpoint {
                reason: "endpoint must be an http or https URL",
            });
        }
        let token = token.filter(|token| !token.trim().is_empty());

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RemoteError::ClientBuild)?;

        Ok(Self {
            http,
            endpoint,
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RemoteExchange for HttpRemote {
    async fn exchange(&self, request: SyncRequest) -> Result<SyncResponse, RemoteError> {
        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|err| RemoteError::InvalidResponse(err.to_string()))
    }
}
