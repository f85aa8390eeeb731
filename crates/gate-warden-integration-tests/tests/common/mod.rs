//! Common test utilities for gate-warden integration tests
//!
//! This module provides:
//! - Hand-rolled stub collaborators (quality server, credential resolver)
//! - A harness wiring the HTTP router and the wait step around one shared
//!   webhook receiver, with file-backed wait state so a "process restart"
//!   can be simulated by rebuilding everything except the state directory
//! - A log capture for asserting on operator-visible log lines

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use gate_warden_api::{create_router, AppState, ServiceConfig, ServiceMetrics, SIGNATURE_HEADER};
use gate_warden_core::correlation::CorrelationCache;
use gate_warden_core::credentials::{CredentialError, CredentialResolver, SecretValue};
use gate_warden_core::persistence::{FileWaitStateStore, WaitStateStore};
use gate_warden_core::receiver::WebhookReceiver;
use gate_warden_core::server::{QualityServerClient, ServerError, TaskSnapshot};
use gate_warden_core::wait::QualityGateWaitStep;
use gate_warden_core::{AnalysisRecord, QualityGateOutcome, TaskStatus};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

// ============================================================================
// Stub Quality Server
// ============================================================================

/// Scriptable in-memory quality server.
#[derive(Default)]
pub struct ScriptedQualityServer {
    tasks: Mutex<HashMap<String, TaskSnapshot>>,
    gates: Mutex<HashMap<String, QualityGateOutcome>>,
}

#[allow(dead_code)]
impl ScriptedQualityServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_task(&self, task_id: &str, status: TaskStatus, analysis_id: Option<&str>) {
        self.tasks.lock().unwrap().insert(
            task_id.to_string(),
            TaskSnapshot {
                task_id: task_id.to_string(),
                status,
                analysis_id: analysis_id.map(String::from),
            },
        );
    }

    pub fn set_gate(&self, analysis_id: &str, outcome: QualityGateOutcome) {
        self.gates
            .lock()
            .unwrap()
            .insert(analysis_id.to_string(), outcome);
    }
}

#[async_trait]
impl QualityServerClient for ScriptedQualityServer {
    async fn task_status(
        &self,
        _server_url: &str,
        task_id: &str,
    ) -> Result<TaskSnapshot, ServerError> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| ServerError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn quality_gate_status(
        &self,
        _server_url: &str,
        analysis_id: &str,
    ) -> Result<QualityGateOutcome, ServerError> {
        self.gates.lock().unwrap().get(analysis_id).copied().ok_or(
            ServerError::UnexpectedResponse {
                message: format!("no gate scripted for analysis '{analysis_id}'"),
            },
        )
    }
}

// ============================================================================
// Stub Credential Resolver
// ============================================================================

/// Credential resolver backed by a fixed map.
pub struct StaticCredentialResolver {
    entries: HashMap<String, String>,
}

impl StaticCredentialResolver {
    pub fn new(entries: &[(String, String)]) -> Self {
        Self {
            entries: entries.iter().cloned().collect(),
        }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentialResolver {
    async fn webhook_secret(
        &self,
        credential_id: &str,
    ) -> Result<Option<SecretValue>, CredentialError> {
        Ok(self.entries.get(credential_id).map(SecretValue::new))
    }

    async fn auth_token(
        &self,
        credential_id: &str,
    ) -> Result<Option<SecretValue>, CredentialError> {
        Ok(self.entries.get(credential_id).map(SecretValue::new))
    }
}

// ============================================================================
// Harness
// ============================================================================

/// One "process": HTTP router and wait step sharing a webhook receiver.
///
/// The wait-state directory and the scripted quality server live outside
/// the process, so [`Harness::restart`] rebuilds a fresh process against
/// the same external world.
pub struct Harness {
    pub receiver: Arc<WebhookReceiver>,
    pub router: Router,
    pub step: Arc<QualityGateWaitStep>,
    pub store: Arc<FileWaitStateStore>,
    pub server: Arc<ScriptedQualityServer>,
    state_dir: Arc<tempfile::TempDir>,
    secrets: Vec<(String, String)>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new(secrets: &[(&str, &str)]) -> Self {
        let state_dir = Arc::new(tempfile::tempdir().expect("tempdir"));
        let server = Arc::new(ScriptedQualityServer::new());
        let secrets: Vec<(String, String)> = secrets
            .iter()
            .map(|(id, value)| (id.to_string(), value.to_string()))
            .collect();
        Self::build(state_dir, server, secrets)
    }

    /// Simulate a process restart: everything is rebuilt except the
    /// wait-state directory and the quality server.
    pub fn restart(&self) -> Self {
        Self::build(
            Arc::clone(&self.state_dir),
            Arc::clone(&self.server),
            self.secrets.clone(),
        )
    }

    fn build(
        state_dir: Arc<tempfile::TempDir>,
        server: Arc<ScriptedQualityServer>,
        secrets: Vec<(String, String)>,
    ) -> Self {
        let receiver = Arc::new(WebhookReceiver::new(Arc::new(CorrelationCache::new())));
        let store = Arc::new(FileWaitStateStore::new(state_dir.path()));
        let credentials = Arc::new(StaticCredentialResolver::new(&secrets));

        let step = Arc::new(QualityGateWaitStep::new(
            Arc::clone(&receiver),
            Arc::clone(&server) as Arc<dyn QualityServerClient>,
            credentials,
            Arc::clone(&store) as Arc<dyn WaitStateStore>,
        ));

        let metrics = ServiceMetrics::new().expect("metrics");
        let state = AppState::new(ServiceConfig::default(), Arc::clone(&receiver), metrics);
        let router = create_router(state);

        Self {
            receiver,
            router,
            step,
            store,
            server,
            state_dir,
            secrets,
        }
    }

    /// Deliver a webhook through the HTTP endpoint.
    pub async fn deliver(&self, body: String, signature: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/sonarqube-webhook/")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        let request = builder.body(Body::from(body)).unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }
}

// ============================================================================
// Log Capture
// ============================================================================

/// Captures formatted log output emitted inside a future, so tests can
/// assert on operator-visible messages.
///
/// Attach [`LogCapture::subscriber`] to the future under test with
/// `tracing::instrument::WithSubscriber::with_subscriber`.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriber writing formatted events into this capture.
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let buffer = Arc::clone(&self.buffer);
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || LogWriter(Arc::clone(&buffer)))
            .finish()
    }

    /// Everything logged so far, as one string.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

#[allow(dead_code)]
pub struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Test Data Builders
// ============================================================================

#[allow(dead_code)]
pub fn analysis(task_id: &str, webhook_secret_id: Option<&str>) -> AnalysisRecord {
    AnalysisRecord {
        installation_name: "default".to_string(),
        server_url: "https://quality.example.com".to_string(),
        credential_id: Some("server-token".to_string()),
        webhook_secret_id: webhook_secret_id.map(String::from),
        ce_task_id: Some(task_id.to_string()),
        dashboard_url: Some("https://quality.example.com/dashboard?id=demo".to_string()),
    }
}

#[allow(dead_code)]
pub fn webhook_body(task_id: &str, status: &str, gate: Option<&str>) -> String {
    let mut payload = serde_json::json!({
        "taskId": task_id,
        "status": status,
        "project": {
            "name": "demo-project",
            "url": "https://quality.example.com/dashboard?id=demo"
        }
    });
    if let Some(gate) = gate {
        payload["qualityGate"] = serde_json::json!({ "status": gate });
    }
    payload.to_string()
}

#[allow(dead_code)]
pub fn sign(secret: &str, payload: &[u8]) -> String {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
