//! `clawd-server`: the master process. Loads configuration, reconciles
//! against the container daemon, then serves the Internal WS Hub (raw
//! `tokio-tungstenite`, agent-facing) and the Client WS Hub (axum,
//! user-facing) side by side. Grounded on the teacher's `bin/ccswarm.rs`
//! CLI/tracing-subscriber bootstrap, generalized from its subcommand
//! dispatch to this binary's single long-running `serve` behavior.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orchestrator_core::config::Config;
use orchestrator_core::container::docker::DockerContainerProvider;
use orchestrator_core::manager::SessionManager;
use orchestrator_core::store::SessionStore;

use orchestrator_server::auth::SessionManagerTokenValidator;
use orchestrator_server::client_hub::{self, ClientHub};
use orchestrator_server::health::{self, Readiness};
use orchestrator_server::internal_hub::InternalHub;
use orchestrator_server::manager_handle::ManagerHandle;
use orchestrator_server::push::LoggingPushNotifier;

#[derive(Parser, Debug)]
#[command(name = "clawd-server", about = "Multi-session AI agent orchestrator")]
struct Cli {
    /// Overrides CLAWD_PORT for the client-facing HTTP/WS listener.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Clone)]
struct AppState {
    client_hub: Arc<ClientHub>,
    readiness: Readiness,
}

impl axum::extract::FromRef<AppState> for Arc<ClientHub> {
    fn from_ref(state: &AppState) -> Self {
        state.client_hub.clone()
    }
}

impl axum::extract::FromRef<AppState> for Readiness {
    fn from_ref(state: &AppState) -> Self {
        state.readiness.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let internal_secret =
        std::env::var("CLAWD_INTERNAL_SECRET").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

    let containers = Arc::new(DockerContainerProvider::connect(config.host_drive_prefix.clone()).await?);
    let store = SessionStore::new(config.session_store_path.clone());

    // SessionManager::new needs its EventSink (the hub) by value, but the
    // hub's manager-token auth path and message dispatch both need the
    // manager back. A ManagerHandle breaks the cycle: the hub is built
    // against the handle first, the manager is built with the hub as its
    // sink, then the handle is filled in.
    let manager_handle = ManagerHandle::new();
    let manager_validator = Arc::new(SessionManagerTokenValidator { manager: manager_handle.clone() });
    let client_hub = ClientHub::new(
        manager_handle.clone(),
        config.jwt_secret.clone(),
        manager_validator,
        Arc::new(LoggingPushNotifier),
    );

    let manager = SessionManager::new(
        config.clone(),
        containers,
        store,
        client_hub.event_sink(),
        internal_secret,
    );
    manager_handle.set(manager.clone());

    manager.restore().await?;

    let readiness = Readiness::new();
    let internal_hub = Arc::new(InternalHub::new(manager.clone()));
    let internal_addr: std::net::SocketAddr = format!("{}:{}", config.host, config.internal_port).parse()?;
    let internal_listener = tokio::net::TcpListener::bind(internal_addr).await?;
    let internal_task = {
        let internal_hub = internal_hub.clone();
        tokio::spawn(async move {
            if let Err(e) = internal_hub.serve(internal_listener).await {
                tracing::error!(error = %e, "internal ws hub exited");
            }
        })
    };

    let state = AppState { client_hub, readiness: readiness.clone() };
    let app = Router::new()
        .route("/ws", get(client_hub::ws_upgrade))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    readiness.mark_ready();

    let client_addr: std::net::SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%client_addr, %internal_addr, "clawd-server listening");
    let listener = tokio::net::TcpListener::bind(client_addr).await?;

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    tokio::select! {
        result = serve => { result?; }
        _ = internal_task => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let _ = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
