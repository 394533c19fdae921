use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    agents::{Agent, Session},
    trace::{render_history, render_trace},
};

const MODULAR_PAGE: &str = include_str!("../assets/modular.html");
const REACT_PAGE: &str = include_str!("../assets/react.html");

/// Sessions untouched for this long are dropped the next time one is created.
pub const DEFAULT_IDLE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Plain,
    React,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub message: Option<String>,
    pub success: bool,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        data,
        message: None,
        success: true,
    })
    .into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message.into()),
            success: false,
        }),
    )
        .into_response()
}

/// One `(prompt, rendered reply)` pair of a session's display history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub prompt: String,
    pub reply: String,
    pub at: DateTime<Utc>,
}

struct WebSession {
    variant: Variant,
    session: Session,
    history: Vec<HistoryEntry>,
    last_used: DateTime<Utc>,
}

/// Shared server state: one agent per variant and the live sessions.
pub struct AppState {
    plain: Agent,
    react: Agent,
    idle_ttl: Duration,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<WebSession>>>>,
}

impl AppState {
    pub fn new(plain: Agent, react: Agent) -> Self {
        Self {
            plain,
            react,
            idle_ttl: Duration::minutes(DEFAULT_IDLE_MINUTES),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_idle_ttl(mut self, idle_ttl: Duration) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    async fn session(&self, id: Uuid) -> Option<Arc<Mutex<WebSession>>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Drops idle sessions. A session whose lock is held is mid-turn and stays.
    async fn evict_idle(&self, now: DateTime<Utc>) {
        let idle_ttl = self.idle_ttl;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| match session.try_lock() {
            Ok(session) => now - session.last_used < idle_ttl,
            Err(_) => true,
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::info!(evicted, live = sessions.len(), "evicted idle sessions");
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { Html(MODULAR_PAGE) }))
        .route("/react", get(|| async { Html(REACT_PAGE) }))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/messages", get(get_messages))
        .route("/api/sessions/{id}/turns", post(run_turn))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    variant: Variant,
}

#[derive(Debug, Serialize)]
struct SessionView {
    id: Uuid,
    variant: Variant,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct TurnRequest {
    prompt: String,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let variant = request.variant;
    let agent = match variant {
        Variant::Plain => &state.plain,
        Variant::React => &state.react,
    };

    let now = Utc::now();
    state.evict_idle(now).await;

    let id = Uuid::new_v4();
    let session = WebSession {
        variant,
        session: agent.session(),
        history: Vec::new(),
        last_used: now,
    };
    state
        .sessions
        .write()
        .await
        .insert(id, Arc::new(Mutex::new(session)));
    tracing::info!(%id, ?variant, "session created");

    ok(serde_json::json!({ "id": id, "variant": variant }))
}

async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let Some(session) = state.session(id).await else {
        return failure(StatusCode::NOT_FOUND, "Session not found");
    };

    let mut session = session.lock().await;
    session.last_used = Utc::now();
    ok(SessionView {
        id,
        variant: session.variant,
        history: session.history.clone(),
    })
}

async fn get_messages(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    let Some(session) = state.session(id).await else {
        return failure(StatusCode::NOT_FOUND, "Session not found");
    };

    let mut session = session.lock().await;
    session.last_used = Utc::now();
    ok(render_history(session.session.messages()))
}

async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.sessions.write().await.remove(&id) {
        Some(_) => {
            tracing::info!(%id, "session closed");
            ok(serde_json::json!({ "id": id }))
        }
        None => failure(StatusCode::NOT_FOUND, "Session not found"),
    }
}

async fn run_turn(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<TurnRequest>,
) -> Response {
    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "Prompt must not be empty");
    }

    let Some(session) = state.session(id).await else {
        return failure(StatusCode::NOT_FOUND, "Session not found");
    };

    let mut guard = session.lock().await;
    let web = &mut *guard;
    web.last_used = Utc::now();
    let turn = match web.session.send(prompt.clone()).await {
        Ok(turn) => turn,
        Err(error) => {
            tracing::warn!(%id, error = %error, "turn failed");
            return failure(StatusCode::INTERNAL_SERVER_ERROR, format!("Turn failed: {error}"));
        }
    };

    let reply = match web.variant {
        Variant::Plain => turn.reply,
        Variant::React => render_trace(web.session.state().since(turn.start))
            .collect::<Vec<_>>()
            .join("\n\n"),
    };

    let entry = HistoryEntry {
        prompt,
        reply,
        at: Utc::now(),
    };
    web.history.push(entry.clone());
    web.last_used = entry.at;
    ok(entry)
}
