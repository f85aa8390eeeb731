//! # Gate Warden Service
//!
//! Binary entry point for the Gate Warden HTTP service.
//!
//! This executable:
//! - Loads configuration from environment and files
//! - Initializes logging
//! - Wires the webhook receiver, credential resolver, quality-server client,
//!   and wait-state store
//! - Resumes any quality-gate waits left suspended by a previous process
//! - Starts the HTTP server from gate-warden-api

use gate_warden_api::{start_server, ServiceConfig};
use gate_warden_core::correlation::CorrelationCache;
use gate_warden_core::credentials::CredentialResolver;
use gate_warden_core::persistence::{FileWaitStateStore, WaitStateStore};
use gate_warden_core::receiver::WebhookReceiver;
use gate_warden_core::wait::QualityGateWaitStep;
use gate_warden_core::RunContext;
use gate_warden_service::credentials::LiteralCredentialResolver;
use gate_warden_service::http_client::HttpQualityServerClient;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "gate_warden_service=info,gate_warden_api=info,gate_warden_core=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gate Warden Service");

    // -------------------------------------------------------------------------
    // Load configuration
    //
    // Sources (applied in order, later sources override earlier ones):
    //  1. /etc/gate-warden/service.yaml    - system-wide defaults
    //  2. ./config/service.yaml            - deployment-local override
    //  3. Path given by GW_CONFIG_FILE env - operator-specified file
    //  4. Environment variables prefixed GW__ (double-underscore separator)
    //     e.g. GW__SERVER__PORT=9090 sets server.port = 9090
    //
    // All service configuration fields carry serde defaults, so absent files
    // or an entirely unconfigured environment produces a valid service config
    // with built-in defaults.  A malformed file or an environment variable
    // that cannot be coerced to the correct type IS a hard error because it
    // indicates deliberate-but-broken operator configuration.
    // -------------------------------------------------------------------------
    let mut config_builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/gate-warden/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    // Optional explicit path supplied by the operator.
    if let Ok(explicit_path) = std::env::var("GW_CONFIG_FILE") {
        if !explicit_path.is_empty() {
            config_builder = config_builder.add_source(
                config::File::with_name(&explicit_path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
            info!(path = %explicit_path, "Loading configuration from explicit path");
        }
    }

    let config = match config_builder
        .add_source(config::Environment::with_prefix("GW").separator("__"))
        .build()
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "Failed to build configuration; aborting");
            std::process::exit(3);
        }
    };

    let service_config: ServiceConfig = match config.try_deserialize() {
        Ok(sc) => sc,
        Err(e) => {
            error!(
                error = %e,
                "Could not deserialize service configuration; aborting. \
                 Fix the configuration and restart."
            );
            std::process::exit(3);
        }
    };

    if let Err(e) = service_config.validate() {
        error!(error = %e, "Service configuration is invalid; aborting");
        std::process::exit(3);
    }

    // -------------------------------------------------------------------------
    // Wire components
    //
    // The webhook receiver is shared between the HTTP endpoint and every
    // waiting step; it is created here exactly once and injected everywhere.
    // -------------------------------------------------------------------------
    let receiver = Arc::new(WebhookReceiver::new(Arc::new(CorrelationCache::new())));

    let credentials = Arc::new(LiteralCredentialResolver::from_config(
        &service_config.credentials.literal,
    ));

    let server_client = match service_config.quality_server.auth_credential_id.as_deref() {
        Some(credential_id) => match credentials.auth_token(credential_id).await {
            Ok(Some(token)) => HttpQualityServerClient::with_token(token),
            Ok(None) => {
                error!(
                    credential_id,
                    "Configured quality-server auth credential was not found; aborting"
                );
                std::process::exit(3);
            }
            Err(e) => {
                error!(error = %e, "Failed to resolve quality-server auth token; aborting");
                std::process::exit(3);
            }
        },
        None => HttpQualityServerClient::new(),
    };
    let server_client = match server_client {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!(error = %e, "Failed to construct quality-server client; aborting");
            std::process::exit(3);
        }
    };

    let store = Arc::new(FileWaitStateStore::new(
        service_config.persistence.state_dir.clone(),
    ));

    let wait_step = Arc::new(QualityGateWaitStep::new(
        Arc::clone(&receiver),
        server_client,
        credentials,
        Arc::clone(&store) as Arc<dyn WaitStateStore>,
    ));

    // -------------------------------------------------------------------------
    // Resume suspended waits
    //
    // Each wait that a previous process persisted and never resolved is
    // picked back up in the background.  The resume path subscribes before
    // re-polling, so a result that arrived during the outage is caught by
    // the poll and one racing the restart by the subscription.
    // -------------------------------------------------------------------------
    match store.pending_runs().await {
        Ok(runs) => {
            if !runs.is_empty() {
                info!(count = runs.len(), "Resuming suspended quality-gate waits");
            }
            for run_id in runs {
                let step = Arc::clone(&wait_step);
                tokio::spawn(async move {
                    let run = RunContext::new(run_id.clone());
                    match step.resume(&run).await {
                        Ok(outcome) => {
                            info!(run_id, outcome = %outcome, "Resumed wait resolved");
                        }
                        Err(e) => {
                            warn!(run_id, error = %e, "Resumed wait failed");
                        }
                    }
                });
            }
        }
        Err(e) => {
            warn!(error = %e, "Could not enumerate persisted wait state; continuing");
        }
    }

    info!(
        host = %service_config.server.host,
        port = service_config.server.port,
        "Starting HTTP server"
    );

    start_server(service_config, receiver).await?;
    Ok(())
}
