use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use sonar_store::{ArtifactRepo, Database};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::artifacts;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::websocket::dispatcher::{start_dispatcher, ArtifactNotifier, Dispatcher};
use crate::websocket::handler::{serve_connection, ConnectionSettings};
use crate::websocket::reaper::start_reaper;
use crate::websocket::registry::Registry;

/// Room for the multipart framing and text fields around the audio part.
const FORM_OVERHEAD_BYTES: usize = 1024 * 1024;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub notifier: ArtifactNotifier,
    pub artifacts: Arc<ArtifactRepo>,
    pub config: Arc<ServerConfig>,
    pub start_time: Instant,
    /// Live WebSocket connection tasks, awaited at shutdown.
    pub connections: TaskTracker,
}

impl AppState {
    fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            send_queue_capacity: self.config.send_queue_capacity,
            write_timeout: self.config.write_timeout(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let upload_limit = usize::try_from(state.config.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(FORM_OVERHEAD_BYTES);
    let audios = ServeDir::new(&state.config.upload_dir);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route(
            "/api/audio",
            post(artifacts::upload_audio).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/api/audios", get(artifacts::list_audios))
        .nest_service(sonar_core::artifact::ARTIFACT_URL_PREFIX, audios)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    // `http` stops the listener first; `background` stops the reaper and the
    // dispatcher once no more uploads can arrive.
    let http = CancellationToken::new();
    let background = CancellationToken::new();
    let registry = Arc::new(Registry::new());
    let connections = TaskTracker::new();
    let write_timeout = config.write_timeout();

    let reaper = start_reaper(
        Arc::clone(&registry),
        config.reap_interval(),
        config.idle_timeout(),
        background.child_token(),
    );
    let (notifier, dispatcher) = start_dispatcher(
        Dispatcher::new(Arc::clone(&registry)),
        config.dispatch_queue_capacity,
        background.child_token(),
    );

    let addr = config.bind_addr();
    let state = AppState {
        registry: Arc::clone(&registry),
        notifier: notifier.clone(),
        artifacts: Arc::new(ArtifactRepo::new(db)),
        config: Arc::new(config),
        start_time: Instant::now(),
        connections: connections.clone(),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "sonar server started");

    let server_cancel = http.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(server_cancel.cancelled_owned())
            .await;
        if let Err(e) = result {
            warn!(error = %e, "http server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        addr: local_addr,
        registry,
        notifier,
        connections,
        write_timeout,
        http,
        background,
        server,
        reaper,
        dispatcher,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive until
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    pub port: u16,
    pub addr: SocketAddr,
    registry: Arc<Registry>,
    notifier: ArtifactNotifier,
    connections: TaskTracker,
    write_timeout: std::time::Duration,
    http: CancellationToken,
    background: CancellationToken,
    server: JoinHandle<()>,
    reaper: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl ServerHandle {
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle for announcing artifacts recorded outside the upload route.
    pub fn notifier(&self) -> &ArtifactNotifier {
        &self.notifier
    }

    /// Stop in dependency order:
    /// 1. stop the listener and let in-flight uploads finish;
    /// 2. stop the reaper and drain the dispatch queue into the outboxes;
    /// 3. have every socket flush its outbox, then close.
    pub async fn shutdown(self) {
        self.http.cancel();
        let _ = self.server.await;

        self.background.cancel();
        let _ = self.reaper.await;
        let _ = self.dispatcher.await;

        let closed = self.registry.close_all();
        self.connections.close();
        let flush_deadline = self.write_timeout.saturating_mul(2);
        if tokio::time::timeout(flush_deadline, self.connections.wait()).await.is_err() {
            warn!(
                remaining = self.connections.len(),
                "websocket connections still flushing at shutdown"
            );
        }
        info!(closed, "sonar server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let tracker = state.connections.clone();
    ws.on_upgrade(move |socket| tracker.track_future(handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let settings = state.connection_settings();
    let _ = serve_connection(socket, state.registry, settings).await;
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.registry.len()))
}
