//! # Gate Warden HTTP Service
//!
//! HTTP layer for receiving quality-server webhooks and exposing service
//! health. The interesting work (payload decoding, correlation, listener
//! dispatch) happens in `gate-warden-core`; this crate owns the axum
//! router, configuration types, and the anti-forgery (crumb) middleware.
//!
//! The webhook endpoint path is exact: the default is
//! `/sonarqube-webhook/` and the variant without the trailing slash is not
//! routed. Crumb enforcement exempts exactly that path, because webhook
//! authenticity is the HMAC signature header's job.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use gate_warden_core::receiver::{NotificationError, WebhookReceiver};
use gate_warden_core::Timestamp;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument, warn};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Header carrying the quality server's HMAC-SHA256 payload signature.
pub const SIGNATURE_HEADER: &str = "x-sonar-webhook-hmac-sha256";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: ServiceConfig,

    /// Webhook receiver shared with the waiting steps
    pub receiver: Arc<WebhookReceiver>,

    /// Metrics collector for observability
    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ServiceConfig,
        receiver: Arc<WebhookReceiver>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            config,
            receiver,
            metrics,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Webhook endpoint settings
    pub webhook: WebhookConfig,

    /// Security settings
    pub security: SecurityConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Credential entries for the literal (development) resolver
    pub credentials: CredentialsConfig,

    /// Wait-state persistence settings
    pub persistence: PersistenceConfig,

    /// Outbound quality-server settings
    pub quality_server: QualityServerConfig,
}

impl ServiceConfig {
    /// Validate the configuration before the server starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                message: "server.port must be non-zero".to_string(),
            });
        }

        if self.server.host.parse::<std::net::IpAddr>().is_err() {
            return Err(ConfigError::Invalid {
                message: format!("'{}' is not a valid bind address", self.server.host),
            });
        }

        if !self.webhook.endpoint_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                message: format!(
                    "webhook.endpoint_path '{}' must start with '/'",
                    self.webhook.endpoint_path
                ),
            });
        }

        if self.security.require_crumb && self.security.crumb_header.is_empty() {
            return Err(ConfigError::Missing {
                key: "security.crumb_header".to_string(),
            });
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::Invalid {
                    message: format!("'{other}' is not a valid logging level"),
                })
            }
        }

        let mut seen = std::collections::HashSet::new();
        for entry in &self.credentials.literal {
            if entry.id.is_empty() {
                return Err(ConfigError::Missing {
                    key: "credentials.literal[].id".to_string(),
                });
            }
            if !seen.insert(entry.id.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("duplicate credential id '{}'", entry.id),
                });
            }
        }

        if self.persistence.state_dir.is_empty() {
            return Err(ConfigError::Missing {
                key: "persistence.state_dir".to_string(),
            });
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,

    /// Enable CORS
    pub enable_cors: bool,

    /// Enable compression
    pub enable_compression: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_seconds: 30,
            enable_cors: true,
            enable_compression: true,
        }
    }
}

/// Webhook endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Webhook endpoint path. The trailing slash is significant: only the
    /// exact path is routed.
    pub endpoint_path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            endpoint_path: "/sonarqube-webhook/".to_string(),
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Require the crumb header on POST requests (webhook path exempt)
    pub require_crumb: bool,

    /// Name of the crumb header
    pub crumb_header: String,

    /// Expected crumb value; when absent any non-empty header passes
    pub crumb_token: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            require_crumb: false,
            crumb_header: "gw-crumb".to_string(),
            crumb_token: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Credential configuration.
///
/// Literal entries embed the secret value in configuration and are meant
/// for development and CI; the service binary warns at startup when any
/// are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Literal credential entries, keyed by id
    pub literal: Vec<LiteralCredentialConfig>,
}

/// One literal credential entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiteralCredentialConfig {
    /// Opaque id referenced by analysis records
    pub id: String,

    /// The raw secret value
    pub secret: String,
}

/// Wait-state persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding one JSON wait-state file per suspended run
    pub state_dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: "var/gate-warden/wait-state".to_string(),
        }
    }
}

/// Outbound quality-server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityServerConfig {
    /// Credential id of the API token for status polls; absent means
    /// unauthenticated polling
    pub auth_credential_id: Option<String>,
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let webhook_routes =
        Router::new().route(&state.config.webhook.endpoint_path, post(handle_webhook));

    let health_routes = Router::new()
        .route("/health", get(handle_health_check))
        .route("/ready", get(handle_readiness_check));

    let observability_routes = Router::new().route("/metrics", get(metrics_endpoint));

    Router::new()
        .merge(webhook_routes)
        .merge(health_routes)
        .merge(observability_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    crumb_middleware,
                ))
                .into_inner(),
        )
        .with_state(state)
}

/// Start HTTP server
pub async fn start_server(
    config: ServiceConfig,
    receiver: Arc<WebhookReceiver>,
) -> Result<(), ServiceError> {
    config.validate()?;

    let metrics = ServiceMetrics::new().map_err(|e| {
        ServiceError::Configuration(ConfigError::Invalid {
            message: format!("Failed to initialize metrics: {e}"),
        })
    })?;

    let state = AppState::new(config.clone(), receiver, metrics);
    let app = create_router(state);

    let host: std::net::IpAddr = config.server.host.parse().map_err(|_| {
        ServiceError::Configuration(ConfigError::Invalid {
            message: format!("'{}' is not a valid bind address", config.server.host),
        })
    })?;
    let addr = SocketAddr::new(host, config.server.port);
    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::BindFailed {
                address: addr.to_string(),
                message: e.to_string(),
            })?;

    info!("Starting HTTP server on {}", addr);

    let shutdown_timeout =
        std::time::Duration::from_secs(config.server.shutdown_timeout_seconds);

    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C signal handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown with {}s timeout", shutdown_timeout.as_secs());
            },
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown with {}s timeout", shutdown_timeout.as_secs());
            },
        }
    };

    // In-flight requests are allowed to complete; new connections are
    // refused as soon as the signal fires.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| ServiceError::ServerFailed {
            message: e.to_string(),
        })?;

    info!("HTTP server shutdown complete");
    Ok(())
}

// ============================================================================
// Webhook Handler
// ============================================================================

/// Handle inbound quality-server webhook deliveries.
///
/// The response is intentionally minimal: `200` with an empty body when the
/// payload parsed, `400` with the literal body `Invalid JSON Payload` when
/// it did not. Signature verification does not happen here; the raw
/// signature header is captured on the notification and checked by the
/// waiting step that knows which secret applies.
#[instrument(skip(state, headers, body))]
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = std::time::Instant::now();
    state.metrics.webhook_received_total.inc();

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state.receiver.receive(body, signature) {
        Ok(notification) => {
            state
                .metrics
                .webhook_duration_seconds
                .observe(start.elapsed().as_secs_f64());
            info!(
                task_id = %notification.task_id,
                status = %notification.task_status,
                "Webhook notification accepted"
            );
            StatusCode::OK.into_response()
        }
        Err(NotificationError::MalformedPayload { message }) => {
            state.metrics.webhook_rejected_total.inc();
            warn!(error = %message, "Rejected webhook delivery with malformed payload");
            (StatusCode::BAD_REQUEST, "Invalid JSON Payload").into_response()
        }
    }
}

// ============================================================================
// Health Check Handlers
// ============================================================================

/// Basic health check endpoint
#[instrument(skip_all)]
async fn handle_health_check(State(_state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Timestamp::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check for load balancers
#[instrument(skip_all)]
async fn handle_readiness_check(State(_state): State<AppState>) -> Json<ReadinessResponse> {
    // The receiver is constructed before the router; if we can respond, we
    // can accept webhooks.
    Json(ReadinessResponse {
        ready: true,
        timestamp: Timestamp::now(),
    })
}

// ============================================================================
// Observability Handlers
// ============================================================================

/// Prometheus metrics endpoint
#[instrument(skip_all)]
async fn metrics_endpoint(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .encode()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// ============================================================================
// Middleware
// ============================================================================

/// Anti-forgery (crumb) enforcement for POST requests.
///
/// When enabled, every POST must carry the configured crumb header, except
/// requests whose path equals the webhook endpoint path exactly, where the
/// HMAC signature header is the authenticity mechanism instead.
async fn crumb_middleware(
    State(state): State<AppState>,
    request: Request,
    next: axum::middleware::Next,
) -> Response {
    let security = &state.config.security;

    if security.require_crumb
        && request.method() == Method::POST
        && request.uri().path() != state.config.webhook.endpoint_path
    {
        let presented = request
            .headers()
            .get(security.crumb_header.as_str())
            .and_then(|v| v.to_str().ok());

        let accepted = match (security.crumb_token.as_deref(), presented) {
            (Some(expected), Some(value)) => value == expected,
            (None, Some(value)) => !value.is_empty(),
            (_, None) => false,
        };

        if !accepted {
            state.metrics.crumb_rejections_total.inc();
            warn!(
                path = %request.uri().path(),
                "POST request rejected: missing or invalid crumb header"
            );
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    next.run(request).await
}

// ============================================================================
// Response Types
// ============================================================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: Timestamp,
    pub version: String,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub timestamp: Timestamp,
}

// ============================================================================
// Error Types
// ============================================================================

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

// ============================================================================
// Metrics
// ============================================================================

/// Service metrics for observability.
///
/// Backed by an owned registry rather than the process-global one so that
/// several router instances (one per test) never collide on registration.
#[derive(Debug)]
pub struct ServiceMetrics {
    registry: Registry,

    /// Webhook deliveries received, accepted or not
    pub webhook_received_total: IntCounter,

    /// Webhook deliveries rejected for a malformed payload
    pub webhook_rejected_total: IntCounter,

    /// POST requests rejected by crumb enforcement
    pub crumb_rejections_total: IntCounter,

    /// Webhook processing time for accepted deliveries
    pub webhook_duration_seconds: Histogram,
}

impl ServiceMetrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let webhook_received_total = IntCounter::new(
            "webhook_notifications_received_total",
            "Total webhook deliveries received",
        )?;
        registry.register(Box::new(webhook_received_total.clone()))?;

        let webhook_rejected_total = IntCounter::new(
            "webhook_notifications_rejected_total",
            "Webhook deliveries rejected for a malformed payload",
        )?;
        registry.register(Box::new(webhook_rejected_total.clone()))?;

        let crumb_rejections_total = IntCounter::new(
            "crumb_rejections_total",
            "POST requests rejected by crumb enforcement",
        )?;
        registry.register(Box::new(crumb_rejections_total.clone()))?;

        let webhook_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "webhook_duration_seconds",
                "Webhook processing time distribution",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(webhook_duration_seconds.clone()))?;

        Ok(Arc::new(Self {
            registry,
            webhook_received_total,
            webhook_rejected_total,
            crumb_rejections_total,
            webhook_duration_seconds,
        }))
    }

    /// Render all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}
