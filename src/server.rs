use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::brain::Brain;
use crate::cli::KnowledgeBackend;
use crate::config::RuntimeConfig;
use crate::error::OrchestratorError;
use crate::events::WorkflowEvent;
use crate::knowledge::build_knowledge_service;
use crate::message::{Channel, MessageKind, UnifiedMessage};
use crate::model::{GroqGenerateService, ModelPolicy};
use crate::multimodal::DisabledMediaService;
use crate::orchestrator::Orchestrator;
use crate::planner::Planner;
use crate::store::{ConversationStore, InMemoryStore};
use crate::telemetry::{TelemetrySink, unix_ms_now};
use crate::tools::BuiltinToolRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Collaborator graph shared by the server and the one-shot CLI path.
pub struct AgentServices {
    pub orchestrator: Arc<Orchestrator>,
    pub brain: Arc<Brain>,
    pub store: Arc<dyn ConversationStore>,
}

pub fn build_agent_services(cfg: &RuntimeConfig) -> Result<AgentServices> {
    let generate = Arc::new(GroqGenerateService::from_env(
        Some(cfg.generate_endpoint.clone()),
        cfg.generate_timeout_secs,
    )?);
    let policy = ModelPolicy::new(generate, cfg.model_tiers.clone());
    let knowledge = build_knowledge_service(cfg)?;
    let store: Arc<dyn ConversationStore> = Arc::new(InMemoryStore::new());
    let media = Arc::new(DisabledMediaService);
    let tools = Arc::new(BuiltinToolRegistry::new(store.clone()));

    let planner = Planner::new(policy.clone(), tools);
    let orchestrator = Arc::new(
        Orchestrator::new(knowledge.clone(), store.clone(), media.clone(), planner)
            .with_grace_period(cfg.grace_period()),
    );
    let brain = Arc::new(Brain::new(policy, knowledge, store.clone(), media));

    Ok(AgentServices {
        orchestrator,
        brain,
        store,
    })
}

#[derive(Clone)]
pub struct ServerState {
    pub cfg: RuntimeConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub brain: Arc<Brain>,
    pub telemetry: TelemetrySink,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub knowledge_backend: &'static str,
    pub active_workflows: usize,
}

/// Inbound chat payload for both the streaming and non-streaming endpoints.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default = "default_channel")]
    pub channel: Channel,
    pub user_id: String,
    pub message_id: Option<String>,
    #[serde(default = "default_kind")]
    pub message_type: MessageKind,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_channel() -> Channel {
    Channel::Web
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

impl ChatRequest {
    fn into_message(self) -> UnifiedMessage {
        UnifiedMessage {
            channel: self.channel,
            user_id: self.user_id,
            message_id: self
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            message_type: self.message_type,
            content: self.content,
            timestamp: unix_ms_now() as i64,
            metadata: self.metadata,
        }
    }
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn orchestrator_error_status(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::WorkflowNotFound { .. } => StatusCode::NOT_FOUND,
        OrchestratorError::DuplicateWorkflow { .. } | OrchestratorError::WorkflowBusy { .. } => {
            StatusCode::CONFLICT
        }
    }
}

pub fn check_server_auth(
    state: &ServerState,
    headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(()); // no token configured, auth disabled
    };

    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let provided_token = header_value
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.cfg.profile.clone(),
        knowledge_backend: match state.cfg.knowledge_backend {
            KnowledgeBackend::Disabled => "disabled",
            KnowledgeBackend::Local => "local",
        },
        active_workflows: state.orchestrator.active_count(),
    })
}

/// Runs one message through the workflow pipeline and relays its event stream
/// as SSE: `connected` first, the orchestrator's events unmodified, then one
/// `done` frame.
pub async fn handle_chat_stream(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<BoxStream<'static, Result<SseEvent, Infallible>>>, ApiError> {
    check_server_auth(&state, &headers)?;
    if request.content.trim().is_empty() && request.metadata.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "content cannot be empty for /v1/chat/stream",
        ));
    }

    let message = request.into_message();
    let workflow_id = message.message_id.clone();

    state
        .orchestrator
        .initialize(&message)
        .await
        .map_err(|err| api_error(orchestrator_error_status(&err), err.to_string()))?;
    let rx = state
        .orchestrator
        .clone()
        .execute(&workflow_id)
        .map_err(|err| api_error(orchestrator_error_status(&err), err.to_string()))?;

    let telemetry = state.telemetry.clone();
    let id_for_events = workflow_id.clone();
    let pipeline = ReceiverStream::new(rx).map(move |event| {
        match &event {
            WorkflowEvent::Complete {
                confidence,
                tools_used,
                execution_time_ms,
                ..
            } => telemetry.emit(
                "workflow.completed",
                json!({
                    "workflow_id": &id_for_events,
                    "confidence": confidence,
                    "tools_used": tools_used,
                    "execution_time_ms": *execution_time_ms as u64,
                }),
            ),
            WorkflowEvent::Error { message } => telemetry.emit(
                "workflow.failed",
                json!({ "workflow_id": &id_for_events, "error": message }),
            ),
            _ => {}
        }
        Ok(to_sse_event(&event))
    });

    let connected = futures::stream::once(async move {
        Ok(to_sse_event(&WorkflowEvent::Connected { workflow_id }))
    });
    let done = futures::stream::once(async { Ok(to_sse_event(&WorkflowEvent::Done)) });

    let stream: BoxStream<'static, Result<SseEvent, Infallible>> =
        connected.chain(pipeline).chain(done).boxed();
    Ok(Sse::new(stream))
}

fn to_sse_event(event: &WorkflowEvent) -> SseEvent {
    SseEvent::default()
        .event(event.kind())
        .data(event.data().to_string())
}

/// Non-streaming single-response path through the brain.
pub async fn handle_server_ask(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<ChatRequest>,
) -> ApiResult<crate::message::AgentResponse> {
    check_server_auth(&state, &headers)?;
    if request.content.trim().is_empty() && request.metadata.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "content cannot be empty for /v1/ask",
        ));
    }

    let message = request.into_message();
    let response = state.brain.respond(&message).await;
    state.telemetry.emit(
        "server.ask.completed",
        json!({
            "channel": message.channel.label(),
            "confidence": response.confidence,
            "used_retrieval": response.used_retrieval,
        }),
    );
    Ok(Json(response))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/ask", post(handle_server_ask))
        .route("/v1/chat/stream", post(handle_chat_stream))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let services = build_agent_services(&cfg)?;

    let state = Arc::new(ServerState {
        auth_token: cfg
            .server_token
            .as_deref()
            .map(str::trim)
            .map(str::to_string)
            .filter(|v| !v.is_empty()),
        cfg: cfg.clone(),
        orchestrator: services.orchestrator.clone(),
        brain: services.brain,
        telemetry: telemetry.clone(),
    });

    // Terminal workflows are also swept lazily on access; this keeps the map
    // bounded when the server idles.
    let sweeper = services.orchestrator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweeper.sweep_expired();
        }
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "knowledge_backend": format!("{:?}", cfg.knowledge_backend).to_ascii_lowercase(),
        }),
    );

    println!(
        "Server mode listening on http://{} (health: /healthz, ask: /v1/ask, stream: /v1/chat/stream)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
