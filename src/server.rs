use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderValue,
    response::Response,
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{BackendInfo, ModelRegistry},
    session::{ChatMode, ChatSession, OutboundEvent, SessionRegistry, SessionSummary},
    store::ConversationStore,
};

/// Frames read from a socket but not yet consumed by its session.
const INBOUND_BUFFER: usize = 32;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub models: Arc<ModelRegistry>,
    pub store: Arc<dyn ConversationStore>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        models: Arc<ModelRegistry>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            config,
            models,
            store,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }
}

#[derive(Serialize)]
struct UnloadResponse {
    id: String,
    unloaded: bool,
}

#[derive(Serialize)]
struct SessionsResponse {
    active: usize,
    sessions: Vec<SessionSummary>,
}

#[derive(Serialize)]
struct StopResponse {
    session_id: Uuid,
    stopped: bool,
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allow_origin);

    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/models/:id/load", post(load_model))
        .route("/models/:id/unload", post(unload_model))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id/stop", post(stop_session))
        .route("/api/ws/:model_id", get(text_chat))
        .route("/api/ws/vision/:model_id", get(vision_chat))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origin: &str) -> CorsLayer {
    let allow_origin: AllowOrigin = if origin == "*" {
        Any.into()
    } else {
        match origin.parse::<HeaderValue>() {
            Ok(value) => value.into(),
            Err(_) => {
                warn!(origin, "invalid CORS origin, allowing any");
                Any.into()
            }
        }
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<BackendInfo>> {
    Json(state.models.list_backends())
}

async fn load_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BackendInfo>, ServiceError> {
    let backend = state.models.get_or_load(&id).await?;
    Ok(Json(backend.describe()))
}

async fn unload_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<UnloadResponse>, ServiceError> {
    if !state.models.is_configured(&id) {
        return Err(ServiceError::not_found(format!("Model {id} not registered")));
    }
    let unloaded = state.models.unload(&id).await;
    Ok(Json(UnloadResponse { id, unloaded }))
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    let sessions = state.sessions.snapshot();
    Json(SessionsResponse {
        active: sessions.len(),
        sessions,
    })
}

async fn stop_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<StopResponse>, ServiceError> {
    let stopped = state.sessions.request_stop(session_id)?;
    info!(%session_id, stopped, "out-of-band stop requested");
    Ok(Json(StopResponse {
        session_id,
        stopped,
    }))
}

async fn text_chat(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state, model_id, ChatMode::Text))
}

async fn vision_chat(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(model_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state, model_id, ChatMode::Vision))
}

/// Bridges one socket to a [`ChatSession`]: a writer task drains the
/// session's outbound events, a reader task feeds text frames to it.
async fn serve_socket(socket: WebSocket, state: AppState, backend_id: String, mode: ChatMode) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<OutboundEvent>(state.config.outbound_buffer);
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

    let session_id = state.sessions.admit(&backend_id, outbound_tx);
    info!(%session_id, %backend_id, ?mode, "chat socket connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "dropping unserialisable event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    ChatSession::new(state.clone(), session_id, backend_id, mode)
        .run(inbound_rx)
        .await;

    // Dropping the registry entry drops the last outbound sender, which ends
    // the writer once it has flushed.
    state.sessions.remove(session_id);
    reader.abort();
    if let Err(e) = writer.await {
        warn!(%session_id, error = %e, "socket writer task failed");
    }
    info!(%session_id, "chat socket closed");
}
