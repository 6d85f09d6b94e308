use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::{ApiError, SharedState};
use crate::broker_config::KeepaliveSection;
use crate::errors::{ProtocolError, SendError};
use crate::protocol::{parse_agent_message, welcome_message};
use crate::registry::{AgentConnection, Payload, ReadyState, UNASSIGNED_ORGANIZATION_ID};

/// Ping/pong timing for both agent and dashboard sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// How often to send WebSocket Ping frames.
    pub ping_interval: Duration,
    /// How long to wait for a Pong before considering the connection dead.
    pub pong_timeout: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::from(&KeepaliveSection::default())
    }
}

impl From<&KeepaliveSection> for Keepalive {
    fn from(section: &KeepaliveSection) -> Self {
        Self {
            // tokio::time::interval panics on a zero period
            ping_interval: section.ping_interval().max(Duration::from_secs(1)),
            pong_timeout: section.pong_timeout(),
        }
    }
}

// ── Dashboard event stream ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    AgentConnected {
        agent_id: String,
        organization_id: String,
    },
    AgentDisconnected {
        agent_id: String,
        organization_id: String,
    },
    AgentEvent {
        agent_id: String,
        organization_id: String,
        event: serde_json::Value,
    },
}

impl WsMessage {
    pub fn organization_id(&self) -> &str {
        match self {
            WsMessage::AgentConnected {
                organization_id, ..
            }
            | WsMessage::AgentDisconnected {
                organization_id, ..
            }
            | WsMessage::AgentEvent {
                organization_id, ..
            } => organization_id.as_str(),
        }
    }
}

/// Publish a WsMessage to all dashboard subscribers.
/// Returns silently even if no dashboards are connected.
pub fn broadcast_message(tx: &broadcast::Sender<WsMessage>, msg: WsMessage) {
    let _ = tx.send(msg); // Ignore error if no receivers
}

// ── Agent connection handle ──────────────────────────────────────────

/// Registry handle for one agent socket.
///
/// Payloads are queued on a bounded channel drained by the socket task; a
/// full queue is reported as a failed send.
pub struct WsConnection {
    state: AtomicU8,
    outbound: mpsc::Sender<Payload>,
    close_requested: Notify,
}

impl WsConnection {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let conn = Arc::new(Self {
            state: AtomicU8::new(ReadyState::Open.as_u8()),
            outbound: tx,
            close_requested: Notify::new(),
        });
        (conn, rx)
    }

    fn mark(&self, state: ReadyState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Resolves once [`AgentConnection::close`] has been called.
    pub async fn close_requested(&self) {
        self.close_requested.notified().await;
    }
}

impl AgentConnection for WsConnection {
    fn send(&self, payload: Payload) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => {
                self.mark(ReadyState::Closed);
                SendError::Closed
            }
        })
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn close(&self) {
        let was_open = self
            .state
            .compare_exchange(
                ReadyState::Open.as_u8(),
                ReadyState::Closing.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if was_open {
            // notify_one stores a permit if the socket task is not waiting yet
            self.close_requested.notify_one();
        }
    }
}

// ── Agent socket ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct AgentConnectParams {
    pub id: Option<String>,
    pub organization_id: Option<String>,
}

/// Resolve `(agent_id, organization_id)` from the upgrade query.
pub fn agent_connect_target(params: AgentConnectParams) -> Result<(String, String), ApiError> {
    let agent_id = params
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("agent id is required".to_string()))?;

    let organization_id = params
        .organization_id
        .map(|org| org.trim().to_string())
        .filter(|org| !org.is_empty())
        .unwrap_or_else(|| UNASSIGNED_ORGANIZATION_ID.to_string());

    Ok((agent_id, organization_id))
}

pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<AgentConnectParams>,
    State(state): State<SharedState>,
) -> Response {
    let (agent_id, organization_id) = match agent_connect_target(params) {
        Ok(target) => target,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, agent_id, organization_id))
        .into_response()
}

/// Identity of the agent served by one socket task.
pub struct AgentSession {
    pub agent_id: String,
    pub organization_id: String,
    pub conn: Arc<WsConnection>,
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: SharedState,
    agent_id: String,
    organization_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = WsConnection::new(state.outbound_buffer);

    state
        .registry
        .add_to_organization(&organization_id, &agent_id, Arc::clone(&conn));
    info!(agent_id = %agent_id, organization_id = %organization_id, "Agent connected");
    broadcast_message(
        &state.ws_tx,
        WsMessage::AgentConnected {
            agent_id: agent_id.clone(),
            organization_id: organization_id.clone(),
        },
    );

    let session = AgentSession {
        agent_id,
        organization_id,
        conn,
    };

    match welcome_message(&session.agent_id) {
        Ok(welcome) => {
            if sender.send(Message::Text(welcome.into())).await.is_ok() {
                run_agent_loop(&mut sender, &mut receiver, &mut outbound, &session, &state).await;
            }
        }
        Err(e) => warn!(agent_id = %session.agent_id, error = %e, "Failed to encode welcome"),
    }

    finish_agent_session(&session, &state);
}

/// Unregister a finished socket and tell dashboards the agent left.
///
/// Nothing is unregistered when the agent already reconnected on a newer
/// socket. An agent the registry evicted earlier is still cleaned up here.
pub fn finish_agent_session(session: &AgentSession, state: &SharedState) {
    session.conn.mark(ReadyState::Closed);

    if !state
        .registry
        .release_connection(&session.agent_id, &session.conn)
    {
        debug!(agent_id = %session.agent_id, organization_id = %session.organization_id, "Superseded socket closed");
        return;
    }

    state.containers.forget(&session.agent_id);
    broadcast_message(
        &state.ws_tx,
        WsMessage::AgentDisconnected {
            agent_id: session.agent_id.clone(),
            organization_id: session.organization_id.clone(),
        },
    );
    info!(agent_id = %session.agent_id, organization_id = %session.organization_id, "Agent disconnected");
}

/// Core agent loop: outbound delivery, agent events, ping/pong keepalive.
///
/// Queued payloads are flushed before a requested close is honoured.
pub async fn run_agent_loop<S, R, E>(
    sender: &mut S,
    receiver: &mut R,
    outbound: &mut mpsc::Receiver<Payload>,
    session: &AgentSession,
    state: &SharedState,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let keepalive = state.keepalive;
    let mut ping_interval = tokio::time::interval(keepalive.ping_interval);
    // The first tick completes immediately; consume it so the first real
    // ping fires after the interval has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            biased;

            // ── Registry → agent ────────────────────────────────────
            payload = outbound.recv() => {
                let Some(payload) = payload else { break };
                let msg = match payload {
                    Payload::Text(text) => Message::Text(text.into()),
                    Payload::Binary(bytes) => Message::Binary(bytes.into()),
                };
                if sender.send(msg).await.is_err() {
                    break;
                }
            }

            // ── Close requested (superseded or failed send) ─────────
            _ = session.conn.close_requested() => {
                debug!(agent_id = %session.agent_id, "Closing agent socket on request");
                break;
            }

            // ── Agent → server ──────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_agent_text(text.as_str(), session, state),
                    Some(Ok(Message::Binary(_))) => {
                        warn!(agent_id = %session.agent_id, error = %ProtocolError::UnsupportedMessage, "Invalid agent message");
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) => {
                        // Pong replies are sent by the WebSocket layer
                    }
                    Some(Err(e)) => {
                        debug!(agent_id = %session.agent_id, error = %e, "Agent socket error");
                        break;
                    }
                }
            }

            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > keepalive.pong_timeout {
                    info!(agent_id = %session.agent_id, "Agent missed pong deadline");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
        }
    }

    session.conn.mark(ReadyState::Closing);
    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

fn handle_agent_text(text: &str, session: &AgentSession, state: &SharedState) {
    match parse_agent_message(text) {
        Ok(event) => {
            debug!(agent_id = %session.agent_id, event_type = event.event_type(), "Agent event");
            state.containers.apply(&session.agent_id, &event);
            broadcast_message(
                &state.ws_tx,
                WsMessage::AgentEvent {
                    agent_id: session.agent_id.clone(),
                    organization_id: session.organization_id.clone(),
                    event: event.to_value(),
                },
            );
        }
        Err(e) => {
            warn!(agent_id = %session.agent_id, error = %e, "Invalid agent message");
        }
    }
}

// ── Dashboard socket ─────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DashboardParams {
    pub organization_id: Option<String>,
}

pub async fn dashboard_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<DashboardParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_dashboard_socket(socket, state, params.organization_id))
}

async fn handle_dashboard_socket(
    socket: WebSocket,
    state: SharedState,
    organization_id: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let rx = state.ws_tx.subscribe();
    run_dashboard_loop(
        &mut sender,
        &mut receiver,
        rx,
        organization_id.as_deref(),
        state.keepalive,
    )
    .await;
}

/// Forward broker events to a dashboard, optionally for one organization.
///
/// If no Pong is received within the pong timeout after a Ping is sent,
/// the connection is considered dead and the loop exits.
pub async fn run_dashboard_loop<S, R, E>(
    sender: &mut S,
    receiver: &mut R,
    mut rx: broadcast::Receiver<WsMessage>,
    organization_id: Option<&str>,
    keepalive: Keepalive,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(keepalive.ping_interval);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > keepalive.pong_timeout {
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if organization_id.is_some_and(|org| org != msg.organization_id()) {
                            continue;
                        }
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "Failed to serialize WsMessage");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Dashboard lagged behind broker events");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Dashboards only listen
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::api::AppState;
    use crate::broker_config::BrokerConfig;
    use crate::errors::RegistryError;
    use futures_util::stream;

    type Inbound = Result<Message, axum::Error>;

    fn text(msg: &Message) -> &str {
        match msg {
            Message::Text(t) => t.as_str(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    fn snapshot_json() -> String {
        serde_json::json!({
            "type": "snapshot",
            "ts": "2026-01-01T00:00:00Z",
            "data": {
                "containers": [{
                    "id": "c1",
                    "name": "web",
                    "image": "nginx:latest",
                    "state": "running",
                    "created": 1_700_000_000,
                }],
                "images": [],
            },
        })
        .to_string()
    }

    fn snapshot_frame() -> Inbound {
        Ok(Message::Text(snapshot_json().into()))
    }

    fn apply_snapshot(state: &SharedState, agent_id: &str) {
        let event = parse_agent_message(&snapshot_json()).unwrap();
        state.containers.apply(agent_id, &event);
    }

    fn disconnected(agent_id: &str, org: &str) -> WsMessage {
        WsMessage::AgentDisconnected {
            agent_id: agent_id.into(),
            organization_id: org.into(),
        }
    }

    fn keepalive_config(ping_secs: u64, pong_secs: u64) -> BrokerConfig {
        let mut config = BrokerConfig::default();
        config.keepalive.ping_interval_secs = ping_secs;
        config.keepalive.pong_timeout_secs = pong_secs;
        config
    }

    fn is_ping(msg: &Message) -> bool {
        matches!(msg, Message::Ping(_))
    }

    fn register(state: &SharedState, org: &str, agent_id: &str) -> (AgentSession, mpsc::Receiver<Payload>) {
        let (conn, outbound) = WsConnection::new(state.outbound_buffer);
        state
            .registry
            .add_to_organization(org, agent_id, Arc::clone(&conn));
        (
            AgentSession {
                agent_id: agent_id.to_string(),
                organization_id: org.to_string(),
                conn,
            },
            outbound,
        )
    }

    #[test]
    fn test_connection_send_and_close() {
        let (conn, mut rx) = WsConnection::new(4);
        assert!(conn.is_open());
        conn.send(Payload::from("hello")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Payload::Text("hello".into()));

        conn.close();
        assert_eq!(conn.ready_state(), ReadyState::Closing);
        assert_eq!(conn.send(Payload::from("late")), Err(SendError::Closed));
    }

    #[test]
    fn test_connection_full_queue_is_send_error() {
        let (conn, _rx) = WsConnection::new(1);
        conn.send(Payload::from("one")).unwrap();
        assert_eq!(conn.send(Payload::from("two")), Err(SendError::Full));
        assert!(conn.is_open());
    }

    #[test]
    fn test_connection_zero_buffer_holds_one_payload() {
        let (conn, _rx) = WsConnection::new(0);
        conn.send(Payload::from("one")).unwrap();
        assert_eq!(conn.send(Payload::from("two")), Err(SendError::Full));
    }

    #[test]
    fn test_connection_dropped_receiver_marks_closed() {
        let (conn, rx) = WsConnection::new(1);
        drop(rx);
        assert_eq!(conn.send(Payload::from("x")), Err(SendError::Closed));
        assert_eq!(conn.ready_state(), ReadyState::Closed);
    }

    #[test]
    fn test_agent_connect_target() {
        let (agent, org) = agent_connect_target(AgentConnectParams {
            id: Some("agent-1".into()),
            organization_id: Some("org-1".into()),
        })
        .unwrap();
        assert_eq!(agent, "agent-1");
        assert_eq!(org, "org-1");

        let (_, org) = agent_connect_target(AgentConnectParams {
            id: Some("agent-1".into()),
            organization_id: Some("  ".into()),
        })
        .unwrap();
        assert_eq!(org, UNASSIGNED_ORGANIZATION_ID);

        assert!(agent_connect_target(AgentConnectParams::default()).is_err());
        assert!(
            agent_connect_target(AgentConnectParams {
                id: Some("".into()),
                organization_id: None,
            })
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_agent_loop_applies_events_and_notifies_dashboards() {
        let state = AppState::new(&BrokerConfig::default());
        let mut dashboard = state.ws_tx.subscribe();
        let (session, mut outbound) = register(&state, "org-1", "agent-1");

        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::iter(vec![snapshot_frame()]);
        run_agent_loop(&mut sent, &mut inbound, &mut outbound, &session, &state).await;

        let containers = state.containers.containers("agent-1");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].id, "c1");

        match dashboard.recv().await.unwrap() {
            WsMessage::AgentEvent {
                agent_id,
                organization_id,
                event,
            } => {
                assert_eq!(agent_id, "agent-1");
                assert_eq!(organization_id, "org-1");
                assert_eq!(event["type"], "snapshot");
            }
            other => panic!("Expected AgentEvent, got {:?}", other),
        }
        assert!(matches!(sent.last(), Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_agent_loop_ignores_invalid_messages() {
        let state = AppState::new(&BrokerConfig::default());
        let (session, mut outbound) = register(&state, "org-1", "agent-1");

        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::iter(vec![
            Ok(Message::Text("not json".to_string().into())),
            Ok(Message::Binary(vec![1u8, 2, 3].into())),
            snapshot_frame(),
        ]);
        run_agent_loop(&mut sent, &mut inbound, &mut outbound, &session, &state).await;

        assert_eq!(state.containers.containers("agent-1").len(), 1);
    }

    #[tokio::test]
    async fn test_agent_loop_flushes_queue_then_honours_close() {
        let state = AppState::new(&BrokerConfig::default());
        let (session, mut outbound) = register(&state, "org-1", "agent-1");

        state.registry.send_to("agent-1", "first").unwrap();
        state.registry.send_to("agent-1", vec![9u8]).unwrap();
        session.conn.close();

        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::pending::<Inbound>();
        run_agent_loop(&mut sent, &mut inbound, &mut outbound, &session, &state).await;

        assert_eq!(sent.len(), 3);
        assert_eq!(text(&sent[0]), "first");
        assert!(matches!(&sent[1], Message::Binary(b) if b.to_vec() == vec![9u8]));
        assert!(matches!(sent[2], Message::Close(None)));
    }

    #[tokio::test]
    async fn test_superseded_socket_does_not_unregister_reconnected_agent() {
        let state = AppState::new(&BrokerConfig::default());
        let (old_session, _old_rx) = register(&state, "org-1", "agent-1");
        let (new_session, _new_rx) = register(&state, "org-1", "agent-1");

        // Default policy closes the superseded connection.
        assert_eq!(old_session.conn.ready_state(), ReadyState::Closing);

        apply_snapshot(&state, "agent-1");
        let mut dashboard = state.ws_tx.subscribe();

        finish_agent_session(&old_session, &state);
        let current = state.registry.get("agent-1").unwrap();
        assert!(Arc::ptr_eq(&current, &new_session.conn));
        assert_eq!(state.containers.containers("agent-1").len(), 1);
        assert!(dashboard.try_recv().is_err());

        finish_agent_session(&new_session, &state);
        assert_eq!(state.registry.size(), 0);
    }

    #[tokio::test]
    async fn test_finish_session_forgets_containers_and_notifies() {
        let state = AppState::new(&BrokerConfig::default());
        let mut dashboard = state.ws_tx.subscribe();
        let (session, mut outbound) = register(&state, "org-1", "agent-1");

        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::iter(vec![snapshot_frame()]);
        run_agent_loop(&mut sent, &mut inbound, &mut outbound, &session, &state).await;
        finish_agent_session(&session, &state);

        assert!(state.containers.containers("agent-1").is_empty());
        assert!(state.registry.get("agent-1").is_err());

        let _event = dashboard.recv().await.unwrap();
        assert_eq!(
            dashboard.recv().await.unwrap(),
            WsMessage::AgentDisconnected {
                agent_id: "agent-1".into(),
                organization_id: "org-1".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_finish_session_after_send_failure_eviction() {
        let mut config = BrokerConfig::default();
        config.registry.outbound_buffer = 1;
        let state = AppState::new(&config);
        let (session, _outbound) = register(&state, "org-1", "agent-1");
        apply_snapshot(&state, "agent-1");
        let mut dashboard = state.ws_tx.subscribe();

        state.registry.send_to("agent-1", "first").unwrap();
        assert_eq!(
            state.registry.send_to("agent-1", "second"),
            Err(RegistryError::NotAvailable)
        );
        assert_eq!(state.registry.size(), 0);

        finish_agent_session(&session, &state);

        assert!(state.containers.containers("agent-1").is_empty());
        assert_eq!(dashboard.try_recv().unwrap(), disconnected("agent-1", "org-1"));
    }

    #[tokio::test]
    async fn test_finish_session_after_lookup_eviction() {
        let state = AppState::new(&BrokerConfig::default());
        let (session, _outbound) = register(&state, "org-1", "agent-1");
        apply_snapshot(&state, "agent-1");
        let mut dashboard = state.ws_tx.subscribe();

        // The socket loop has exited but cleanup has not run yet.
        session.conn.mark(ReadyState::Closing);
        assert!(state.registry.agents().is_empty());
        assert_eq!(state.registry.size(), 0);

        finish_agent_session(&session, &state);

        assert!(state.containers.containers("agent-1").is_empty());
        assert_eq!(dashboard.try_recv().unwrap(), disconnected("agent-1", "org-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_loop_exits_when_pong_deadline_missed() {
        let state = AppState::new(&keepalive_config(1, 2));
        let (session, mut outbound) = register(&state, "org-1", "agent-1");

        let start = Instant::now();
        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::pending::<Inbound>();
        run_agent_loop(&mut sent, &mut inbound, &mut outbound, &session, &state).await;

        assert!(start.elapsed() > Duration::from_secs(2));
        assert!(sent.len() >= 2);
        assert!(sent[..sent.len() - 1].iter().all(is_ping));
        assert!(matches!(sent.last(), Some(Message::Close(None))));
        assert_eq!(session.conn.ready_state(), ReadyState::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dashboard_loop_exits_when_pong_deadline_missed() {
        let (tx, rx) = broadcast::channel::<WsMessage>(16);
        let keepalive = Keepalive::from(&keepalive_config(1, 2).keepalive);

        let start = Instant::now();
        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::pending::<Inbound>();
        run_dashboard_loop(&mut sent, &mut inbound, rx, None, keepalive).await;

        assert!(start.elapsed() > Duration::from_secs(2));
        assert!(sent.len() >= 2);
        assert!(sent[..sent.len() - 1].iter().all(is_ping));
        assert!(matches!(sent.last(), Some(Message::Close(None))));
        drop(tx);
    }

    #[tokio::test]
    async fn test_dashboard_loop_filters_by_organization() {
        let (tx, rx) = broadcast::channel(16);
        broadcast_message(
            &tx,
            WsMessage::AgentConnected {
                agent_id: "a".into(),
                organization_id: "org-1".into(),
            },
        );
        broadcast_message(
            &tx,
            WsMessage::AgentConnected {
                agent_id: "b".into(),
                organization_id: "org-2".into(),
            },
        );
        drop(tx);

        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::pending::<Inbound>();
        run_dashboard_loop(&mut sent, &mut inbound, rx, Some("org-1"), Keepalive::default()).await;

        assert_eq!(sent.len(), 2);
        let value: serde_json::Value = serde_json::from_str(text(&sent[0])).unwrap();
        assert_eq!(value["type"], "AgentConnected");
        assert_eq!(value["data"]["agent_id"], "a");
        assert!(matches!(sent[1], Message::Close(None)));
    }

    #[tokio::test]
    async fn test_dashboard_loop_without_filter_receives_all() {
        let (tx, rx) = broadcast::channel(16);
        for org in ["org-1", "org-2"] {
            broadcast_message(
                &tx,
                WsMessage::AgentDisconnected {
                    agent_id: "a".into(),
                    organization_id: org.into(),
                },
            );
        }
        drop(tx);

        let mut sent: Vec<Message> = Vec::new();
        let mut inbound = stream::pending::<Inbound>();
        run_dashboard_loop(&mut sent, &mut inbound, rx, None, Keepalive::default()).await;

        assert_eq!(sent.len(), 3);
    }

    #[test]
    fn test_ws_message_serialization() {
        let msg = WsMessage::AgentEvent {
            agent_id: "agent-1".into(),
            organization_id: "org-1".into(),
            event: serde_json::json!({"type": "container.start"}),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "AgentEvent");
        assert_eq!(parsed["data"]["organization_id"], "org-1");
        assert_eq!(parsed["data"]["event"]["type"], "container.start");
        assert_eq!(msg.organization_id(), "org-1");
    }

    #[test]
    fn test_keepalive_defaults() {
        let keepalive = Keepalive::default();
        assert!(keepalive.pong_timeout > keepalive.ping_interval);
        assert_eq!(keepalive.ping_interval, Duration::from_secs(30));
        assert_eq!(keepalive.pong_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_keepalive_zero_interval_is_clamped() {
        let section = KeepaliveSection {
            ping_interval_secs: 0,
            pong_timeout_secs: 5,
        };
        assert_eq!(Keepalive::from(&section).ping_interval, Duration::from_secs(1));
    }
}
