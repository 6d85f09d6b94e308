//! Agent broker — WebSocket front-end for the agent registry.
//!
//! ## Overview
//!
//! Host agents dial in over a WebSocket, identify themselves with an agent
//! id and an organization id, and are registered in an
//! [`AgentRegistry`](crate::registry::AgentRegistry). Operators reach them
//! through the HTTP API, which turns requests into command envelopes and
//! routes them through the registry. Events the agents report are folded
//! into a per-agent container view and fanned out to dashboards.
//!
//! ## Module Map
//!
//! ```text
//! ┌───────────┐  /ws/agent  ┌───────────────────────────────────────────────┐
//! │   Agent   │ <─────────> │  ws.rs  (WsConnection, run_agent_loop)        │
//! └───────────┘             │    │ add_to_organization / remove_connection  │
//!                           │    v                                          │
//!                           │  registry  (AgentRegistry<WsConnection>)      │
//!                           │    ^                                          │
//! ┌───────────┐    HTTP     │    │ send_to / broadcast / agents             │
//! │ Operator  │ ──────────> │  api.rs  (route handlers, AppState)           │
//! └───────────┘             │                                               │
//! ┌───────────┐     /ws     │  ws.rs  (WsMessage, run_dashboard_loop)       │
//! │ Dashboard │ <────────── │    ^ agent events + connect/disconnect        │
//! └───────────┘             │  containers.rs  (ContainerCache)              │
//!                           └───────────────────────────────────────────────┘
//! ```
//!
//! `server.rs` assembles the router and owns the listener lifecycle.
//!
//! ## Typical Request Flow (stop a container)
//!
//! 1. `POST /api/agents/{id}/commands` with `{"name":"container.stop", ...}`
//! 2. `api::send_command` builds a command envelope with a fresh id.
//! 3. `AgentRegistry::send_to` hands it to the agent's `WsConnection`, which
//!    queues it for the socket task.
//! 4. A closed or full connection is evicted and the caller gets `503`.

pub mod api;
pub mod containers;
pub mod server;
pub mod ws;
