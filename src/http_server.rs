//! HTTP server implementation using Axum.
//!
//! `GET /ws` carries one session per connection; the remaining routes are
//! diagnostics and the template catalogue.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::events::{event_channel, ClientEvent, ServerEvent};
use crate::sandbox::PtyProcessFactory;
use crate::session::SessionController;
use crate::state::{SessionId, SessionInfo};
use crate::templates::{Template, TemplateCatalog};
use crate::toolchain::Language;

const MAX_PARSE_ERRORS: u8 = 3;
const CLOSE_POLICY: u16 = 1008;
const CLOSE_UNSUPPORTED: u16 = 1003;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub controller: SessionController,
    pub templates: Arc<TemplateCatalog>,
    ws_limits: Arc<Semaphore>,
}

impl AppState {
    pub fn new(controller: SessionController, templates: TemplateCatalog) -> Self {
        let max_connections = controller.config().max_connections;
        Self {
            controller,
            templates: Arc::new(templates),
            ws_limits: Arc::new(Semaphore::new(max_connections)),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/templates", get(list_templates))
        .route("/templates/:language/:name", get(get_template))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server until Ctrl-C or SIGTERM, then clean up every session.
pub async fn run_server(config: ServerConfig) -> io::Result<()> {
    let templates = TemplateCatalog::load(&config.templates_dir).unwrap_or_else(|e| {
        warn!(dir = %config.templates_dir.display(), error = %e, "Could not load templates");
        TemplateCatalog::default()
    });
    let bind = config.bind;
    let controller = SessionController::new(config, Arc::new(PtyProcessFactory::new()));
    let state = AppState::new(controller.clone(), templates);

    let listener = TcpListener::bind(bind).await?;
    info!("Starting HTTP server on {}", bind);
    serve(listener, state, shutdown_signal()).await?;

    let reaped = controller.shutdown_all().await;
    info!(sessions = reaped, "Server stopped");
    Ok(())
}

/// Serve `state` on `listener` with the expired-session sweeper running.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = spawn_sweeper(state.controller.clone());
    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    sweeper.abort();
    result
}

fn spawn_sweeper(controller: SessionController) -> tokio::task::JoinHandle<()> {
    let every = controller.config().sweep_interval;
    let max_age = controller.config().max_session_age;
    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            let reaped = controller.reaper().sweep_expired(max_age).await;
            if reaped > 0 {
                info!(reaped, "Swept expired sessions");
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown requested");
}

async fn health() -> &'static str {
    "OK"
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let mut list = Vec::new();
    for (_, record) in state.controller.registry().all().await {
        list.push(record.lock().await.info());
    }
    list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Json(list)
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, StatusCode> {
    let record = state
        .controller
        .registry()
        .get(&SessionId::from(id))
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    let info = record.lock().await.info();
    Ok(Json(info))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    let id = SessionId::from(id);
    if !state.controller.registry().contains(&id).await {
        return StatusCode::NOT_FOUND;
    }
    state.controller.cleanup(&id).await;
    info!(session_id = %id, "Deleted session");
    StatusCode::NO_CONTENT
}

async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.templates.names())
}

async fn get_template(
    State(state): State<AppState>,
    Path((language, name)): Path<(String, String)>,
) -> Result<Json<Template>, StatusCode> {
    let language: Language = language.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    state
        .templates
        .get(language, &name)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let permit = match state.ws_limits.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                "too many websocket connections",
            )
                .into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, permit))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, _permit: OwnedSemaphorePermit) {
    let id = SessionId::generate();
    let (events_tx, mut events_rx) = event_channel(state.controller.config().event_queue);
    let (mut sender, mut receiver) = socket.split();
    info!(session_id = %id, "Client connected");

    let _ = events_tx.try_send(ServerEvent::SessionCreated { id: id.to_string() });
    let mut parse_errors = 0u8;

    loop {
        tokio::select! {
            Some(event) = events_rx.recv() => {
                let payload = match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(session_id = %id, error = %e, "WebSocket receive failed");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                        Ok(event) => {
                            parse_errors = 0;
                            state.controller.handle(&id, event, &events_tx).await;
                        }
                        Err(e) => {
                            parse_errors = parse_errors.saturating_add(1);
                            let event = ServerEvent::error(format!("invalid message: {e}"));
                            let sent = match serde_json::to_string(&event) {
                                Ok(payload) => sender.send(Message::Text(payload)).await.is_ok(),
                                Err(_) => false,
                            };
                            if !sent {
                                break;
                            }
                            if parse_errors >= MAX_PARSE_ERRORS {
                                warn!(session_id = %id, "Closing connection after repeated parse errors");
                                let _ = sender
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CLOSE_POLICY,
                                        reason: "too many parse errors".into(),
                                    })))
                                    .await;
                                break;
                            }
                        }
                    },
                    Message::Binary(_) => {
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_UNSUPPORTED,
                                reason: "binary frames are not supported".into(),
                            })))
                            .await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    // Unblocks a driver waiting for queue space.
    drop(events_rx);
    state.controller.cleanup(&id).await;
    info!(session_id = %id, "Client disconnected");
}
