use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::containers::ContainerCache;
use super::ws::{Keepalive, WsConnection, WsMessage};
use crate::broker_config::BrokerConfig;
use crate::errors::{ProtocolError, RegistryError};
use crate::protocol::{CommandKind, build_command};
use crate::registry::{AgentRegistry, ConnectedAgent};

/// Capacity of the dashboard event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: AgentRegistry<WsConnection>,
    pub containers: ContainerCache,
    pub ws_tx: broadcast::Sender<WsMessage>,
    pub keepalive: Keepalive,
    pub outbound_buffer: usize,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: &BrokerConfig) -> SharedState {
        let (ws_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            registry: AgentRegistry::with_policy(config.registry.superseded),
            containers: ContainerCache::new(),
            ws_tx,
            keepalive: Keepalive::from(&config.keepalive),
            outbound_buffer: config.registry.outbound_buffer,
        })
    }
}

// ── Request / response payload types ──────────────────────────────────

#[derive(Deserialize)]
pub struct ListAgentsQuery {
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub id: String,
    pub organization_id: String,
}

impl<C: ?Sized> From<&ConnectedAgent<C>> for AgentSummary {
    fn from(agent: &ConnectedAgent<C>) -> Self {
        Self {
            id: agent.id.clone(),
            organization_id: agent.organization_id.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct CommandAccepted {
    pub id: uuid::Uuid,
}

#[derive(Serialize)]
pub struct BroadcastAccepted {
    pub id: uuid::Uuid,
    pub delivered: usize,
}

#[derive(Serialize)]
pub struct RegistryStats {
    pub registered: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => ApiError::NotFound(err.to_string()),
            RegistryError::NotAvailable => ApiError::ServiceUnavailable(err.to_string()),
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidCommand => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}/commands", post(send_command))
        .route("/api/agents/{id}/containers", get(agent_containers))
        .route("/api/broadcast", post(broadcast_command))
        .route("/api/stats", get(stats))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_agents(
    State(state): State<SharedState>,
    Query(query): Query<ListAgentsQuery>,
) -> impl IntoResponse {
    let agents = match query.organization_id.as_deref() {
        Some(org) => state.registry.agents_by_organization(org),
        None => state.registry.agents(),
    };
    let mut summaries: Vec<AgentSummary> = agents.iter().map(AgentSummary::from).collect();
    summaries.sort_by(|a, b| a.id.cmp(&b.id));
    Json(summaries)
}

async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state.registry.lookup(&id)?;
    Ok(Json(AgentSummary::from(&agent)))
}

async fn send_command(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(kind): Json<CommandKind>,
) -> Result<impl IntoResponse, ApiError> {
    let command = build_command(kind)?;
    let json = command.to_json()?;
    state.registry.send_to(&id, json).inspect_err(|e| {
        warn!(agent_id = %id, command_id = %command.id(), error = %e, "Command not delivered");
    })?;
    info!(agent_id = %id, command_id = %command.id(), "Command sent");
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { id: command.id() })))
}

async fn broadcast_command(
    State(state): State<SharedState>,
    Json(kind): Json<CommandKind>,
) -> Result<impl IntoResponse, ApiError> {
    let command = build_command(kind)?;
    let json = command.to_json()?;
    let delivered = state.registry.broadcast(json);
    info!(command_id = %command.id(), delivered, "Command broadcast");
    Ok((
        StatusCode::ACCEPTED,
        Json(BroadcastAccepted {
            id: command.id(),
            delivered,
        }),
    ))
}

async fn agent_containers(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(state.containers.containers(&id))
}

async fn stats(State(state): State<SharedState>) -> impl IntoResponse {
    Json(RegistryStats {
        registered: state.registry.size(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────
