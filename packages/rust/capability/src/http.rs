//! HTTP capability backend: one JSON POST per task.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use dnacommit_shared::{DnaCommitError, Result};

use crate::CapabilityBackend;
use crate::protocol::{Task, TaskReply};

/// User-Agent string for capability requests.
const USER_AGENT: &str = concat!("DNA-commit/", env!("CARGO_PKG_VERSION"));

/// Capability backend speaking JSON over HTTP.
pub struct HttpBackend {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpBackend {
    /// Build a backend posting to `endpoint`.
    ///
    /// The bearer token, if any, is read once from `api_key_env`.
    pub fn new(endpoint: &str, api_key_env: Option<&str>, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            DnaCommitError::config(format!("invalid capability endpoint '{endpoint}': {e}"))
        })?;
        let token = api_key_env
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty());
        Self::with_token(endpoint, token, timeout)
    }

    /// Build a backend with an explicit token.
    pub fn with_token(endpoint: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| DnaCommitError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }
}

#[async_trait]
impl CapabilityBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip_all, fields(stage = %task.stage()))]
    async fn invoke(&self, task: Task) -> Result<TaskReply> {
        let stage = task.stage();
        let mut request = self.client.post(self.endpoint.clone()).json(&task);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                DnaCommitError::unavailable(stage, format!("cannot reach {}: {e}", self.endpoint))
            } else {
                DnaCommitError::collaborator(stage, format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        debug!(%status, "capability response");
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DnaCommitError::unavailable(
                stage,
                format!("capability service rejected credentials ({status})"),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DnaCommitError::collaborator(
                stage,
                format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            ));
        }

        response
            .json::<TaskReply>()
            .await
            .map_err(|e| DnaCommitError::collaborator(stage, format!("malformed reply: {e}")))
    }
}
