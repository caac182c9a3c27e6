use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use relay_ai::RecommendClient;
use relay_core::ids::{TerminalId, TraceId};
use relay_fabric::{
    AiOrchestrator, AuthorizationGate, ConnectionRegistry, FabricConfig, MessageRouter,
    RegistryEvent, SessionManager, TraceRecorder,
};
use relay_store::acl::AclRepo;
use relay_store::sessions::SessionRepo;
use relay_store::service_calls::ServiceCallRepo;
use relay_store::terminals::TerminalRepo;
use relay_store::traces::TraceRepo;
use relay_store::{Database, StoreError};

use crate::push;
use crate::terminal;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    /// Capacity of each terminal's ordered outbound channel.
    pub max_send_queue: usize,
    /// Expected `service_id` header on HIS pushes.
    pub his_service_id: String,
    /// Expected `sceneType` on HIS pushes.
    pub his_scene_type: String,
    pub fabric: FabricConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            max_send_queue: 256,
            his_service_id: "CHKR01".to_string(),
            his_scene_type: "EXAM001".to_string(),
            fabric: FabricConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("bind error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<MessageRouter>,
    pub traces: Arc<TraceRecorder>,
    pub gate: Arc<AuthorizationGate>,
    pub orchestrator: Arc<AiOrchestrator>,
    pub terminals: Arc<TerminalRepo>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/client/{terminal_id}", get(ws_handler))
        .route("/api/CHKR01/rest/", post(push::his_push_handler))
        .route("/health", get(health_handler))
        .route("/api/clients", get(clients_handler))
        .route("/api/traces/{trace_id}", get(trace_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Wire the fabric and start serving. Returns a handle that keeps the
/// background tasks alive.
pub async fn start(
    config: ServerConfig,
    db: Database,
    client: Arc<dyn RecommendClient>,
) -> Result<ServerHandle, ServerError> {
    let fabric = config.fabric.clone();

    let registry = Arc::new(ConnectionRegistry::new(fabric.clone()));
    let traces = Arc::new(TraceRecorder::new(TraceRepo::new(db.clone()), fabric.clone()));
    let router = Arc::new(MessageRouter::new(
        Arc::clone(&registry),
        Arc::clone(&traces),
        fabric.clone(),
    ));
    let gate = Arc::new(AuthorizationGate::new(AclRepo::new(db.clone()))?);
    let sessions = Arc::new(SessionManager::new(
        SessionRepo::new(db.clone()),
        fabric.session_expiry_days,
    ));
    let orchestrator = Arc::new(AiOrchestrator::new(
        Arc::clone(&sessions),
        Arc::clone(&gate),
        client,
        Arc::clone(&traces),
        ServiceCallRepo::new(db.clone()),
        fabric.clone(),
    ));
    let terminals = Arc::new(TerminalRepo::new(db));

    let _sweeper = registry.spawn_sweeper();
    let _router_events = router.spawn_event_loop();
    let _purger = router.spawn_purger();
    let _trace_sweeper = traces.spawn_stale_sweeper();
    let _acl_refresher = gate.spawn_refresher(fabric.acl_refresh_interval);
    let _session_sweeper = sessions.spawn_expiry_sweeper();
    let _lifecycle = spawn_lifecycle_writer(Arc::clone(&registry), Arc::clone(&terminals));

    let app_state = AppState {
        registry,
        router,
        traces,
        gate,
        orchestrator,
        terminals,
        config: Arc::new(config),
    };

    let port = app_state.config.port;
    let router = build_router(app_state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _sweeper,
        _router_events,
        _purger,
        _trace_sweeper,
        _acl_refresher,
        _session_sweeper,
        _lifecycle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _sweeper: tokio::task::JoinHandle<()>,
    _router_events: tokio::task::JoinHandle<()>,
    _purger: tokio::task::JoinHandle<()>,
    _trace_sweeper: tokio::task::JoinHandle<()>,
    _acl_refresher: tokio::task::JoinHandle<()>,
    _session_sweeper: tokio::task::JoinHandle<()>,
    _lifecycle: tokio::task::JoinHandle<()>,
}

/// Persist registry lifecycle transitions the socket task does not see
/// (sweeper-driven disconnects included). Write-through only; failures log.
fn spawn_lifecycle_writer(
    registry: Arc<ConnectionRegistry>,
    terminals: Arc<TerminalRepo>,
) -> tokio::task::JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::Disconnected { terminal, reason }) => {
                    if let Err(e) = terminals.record_disconnected(&terminal, &reason) {
                        tracing::warn!(terminal_id = %terminal, error = %e, "terminal disconnect write failed");
                    }
                }
                Ok(RegistryEvent::Connected(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "lifecycle event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// WebSocket upgrade for a terminal connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(terminal_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        terminal::handle_socket(socket, state, TerminalId::from_raw(terminal_id), addr)
    })
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "connectedTerminals": state.registry.live_terminals().len(),
    }))
}

/// Admin surface: every live terminal.
async fn clients_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "clients": state.registry.live_terminals() }))
}

/// Admin surface: one persisted trace with its reconstructed span tree.
async fn trace_handler(
    Path(trace_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.traces.load(&TraceId::from_raw(trace_id)) {
        Ok((trace, spans)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "trace": trace, "spans": spans })),
        ),
        Err(StoreError::NotFound(detail)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": detail })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
