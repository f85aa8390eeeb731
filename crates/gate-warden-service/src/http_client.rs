//! `reqwest`-backed [`QualityServerClient`].
//!
//! Talks to the quality server's REST API: one endpoint for compute-engine
//! task status, one for the quality-gate outcome of a finished analysis.
//! When an auth token is configured it is sent as the basic-auth username
//! with an empty password, which is how these servers accept tokens.

use async_trait::async_trait;
use gate_warden_core::credentials::SecretValue;
use gate_warden_core::server::{QualityServerClient, ServerError, TaskSnapshot};
use gate_warden_core::{QualityGateOutcome, TaskStatus};
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, instrument};

#[cfg(test)]
#[path = "http_client_tests.rs"]
mod tests;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Wire Schema
// ============================================================================

#[derive(Debug, Deserialize)]
struct CeTaskResponse {
    task: CeTask,
}

#[derive(Debug, Deserialize)]
struct CeTask {
    id: String,
    status: String,
    #[serde(rename = "analysisId")]
    analysis_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectStatusResponse {
    #[serde(rename = "projectStatus")]
    project_status: ProjectStatus,
}

#[derive(Debug, Deserialize)]
struct ProjectStatus {
    status: String,
}

// ============================================================================
// Client
// ============================================================================

/// HTTP implementation of [`QualityServerClient`].
pub struct HttpQualityServerClient {
    http: reqwest::Client,
    token: Option<SecretValue>,
}

impl HttpQualityServerClient {
    /// Create a client without authentication.
    pub fn new() -> Result<Self, ServerError> {
        Self::build(None)
    }

    /// Create a client that authenticates with the given token.
    pub fn with_token(token: SecretValue) -> Result<Self, ServerError> {
        Self::build(Some(token))
    }

    fn build(token: Option<SecretValue>) -> Result<Self, ServerError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ServerError::UnexpectedResponse {
                message: format!("Failed to construct HTTP client: {e}"),
            })?;
        Ok(Self { http, token })
    }

    async fn get(&self, server_url: &str, url: &str) -> Result<reqwest::Response, ServerError> {
        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.basic_auth(token.expose(), Some(""));
        }

        let response = request.send().await.map_err(|e| ServerError::Request {
            server_url: server_url.to_string(),
            message: e.to_string(),
        })?;

        debug!(url, status = %response.status(), "Quality server responded");
        Ok(response)
    }
}

impl std::fmt::Debug for HttpQualityServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQualityServerClient")
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

#[async_trait]
impl QualityServerClient for HttpQualityServerClient {
    #[instrument(skip(self))]
    async fn task_status(
        &self,
        server_url: &str,
        task_id: &str,
    ) -> Result<TaskSnapshot, ServerError> {
        let url = format!(
            "{}/api/ce/task?id={}",
            server_url.trim_end_matches('/'),
            task_id
        );
        let response = self.get(server_url, &url).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ServerError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(ServerError::UnexpectedResponse {
                message: format!("task status endpoint returned {}", response.status()),
            });
        }

        let body: CeTaskResponse =
            response
                .json()
                .await
                .map_err(|e| ServerError::UnexpectedResponse {
                    message: format!("task status body could not be decoded: {e}"),
                })?;

        let status = TaskStatus::from_str(&body.task.status).map_err(|e| {
            ServerError::UnexpectedResponse {
                message: e.to_string(),
            }
        })?;

        Ok(TaskSnapshot {
            task_id: body.task.id,
            status,
            analysis_id: body.task.analysis_id,
        })
    }

    #[instrument(skip(self))]
    async fn quality_gate_status(
        &self,
        server_url: &str,
        analysis_id: &str,
    ) -> Result<QualityGateOutcome, ServerError> {
        let url = format!(
            "{}/api/qualitygates/project_status?analysisId={}",
            server_url.trim_end_matches('/'),
            analysis_id
        );
        let response = self.get(server_url, &url).await?;

        if !response.status().is_success() {
            return Err(ServerError::UnexpectedResponse {
                message: format!("quality gate endpoint returned {}", response.status()),
            });
        }

        let body: ProjectStatusResponse =
            response
                .json()
                .await
                .map_err(|e| ServerError::UnexpectedResponse {
                    message: format!("quality gate body could not be decoded: {e}"),
                })?;

        QualityGateOutcome::from_str(&body.project_status.status).map_err(|e| {
            ServerError::UnexpectedResponse {
                message: e.to_string(),
            }
        })
    }
}
