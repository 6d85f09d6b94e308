//! Agent wire protocol.
//!
//! Three envelopes travel over an agent socket:
//! - `welcome` (server → agent) right after the handshake
//! - `command` (server → agent) built with [`build_command`]
//! - events (agent → server) parsed with [`parse_agent_message`]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ProtocolError;

/// Event types that remove a container from the agent's view.
const CONTAINER_REMOVAL_EVENTS: &[&str] = &["container.remove", "container.destroy", "container.delete"];

// ── Shared resource types ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Paused,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    pub created: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageContainers {
    pub running: u64,
    pub paused: u64,
    pub exited: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub created: i64,
    pub size: i64,
    pub shared_size: i64,
    pub virtual_size: i64,
    pub containers: ImageContainers,
}

// ── Server → agent ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome { id: String },
}

/// Named operation an agent can be asked to perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload")]
pub enum CommandKind {
    #[serde(rename = "container.stop")]
    ContainerStop {
        #[serde(rename = "containerId")]
        container_id: String,
    },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::ContainerStop { .. } => "container.stop",
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            CommandKind::ContainerStop { container_id } => !container_id.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: CommandKind,
}

/// `{"type":"command","ts":…,"data":{"id":…,"name":…,"payload":{…}}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "command")]
pub struct AgentCommand {
    pub ts: DateTime<Utc>,
    pub data: CommandData,
}

impl AgentCommand {
    pub fn id(&self) -> Uuid {
        self.data.id
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Build a command envelope with a fresh id and the current timestamp.
pub fn build_command(kind: CommandKind) -> Result<AgentCommand, ProtocolError> {
    build_command_with(kind, Uuid::new_v4(), Utc::now())
}

pub fn build_command_with(
    kind: CommandKind,
    id: Uuid,
    ts: DateTime<Utc>,
) -> Result<AgentCommand, ProtocolError> {
    if !kind.is_valid() {
        return Err(ProtocolError::InvalidCommand);
    }
    Ok(AgentCommand {
        ts,
        data: CommandData { id, kind },
    })
}

pub fn welcome_message(agent_id: &str) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(&ServerMessage::Welcome {
        id: agent_id.to_string(),
    })?)
}

// ── Agent → server ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub containers: Vec<Container>,
    pub images: Vec<Image>,
}

/// An event reported by an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// `container.*` event carrying the container's current state
    Container {
        event_type: String,
        ts: String,
        container: Container,
    },
    /// `image.*` event
    Image {
        event_type: String,
        ts: String,
        image: Image,
    },
    /// Full inventory, replacing whatever the server knew before
    Snapshot { ts: String, snapshot: Snapshot },
}

impl AgentEvent {
    pub fn event_type(&self) -> &str {
        match self {
            AgentEvent::Container { event_type, .. } | AgentEvent::Image { event_type, .. } => {
                event_type.as_str()
            }
            AgentEvent::Snapshot { .. } => "snapshot",
        }
    }

    pub fn ts(&self) -> &str {
        match self {
            AgentEvent::Container { ts, .. }
            | AgentEvent::Image { ts, .. }
            | AgentEvent::Snapshot { ts, .. } => ts.as_str(),
        }
    }

    pub fn is_container_removal(&self) -> bool {
        matches!(self, AgentEvent::Container { event_type, .. } if is_container_removal_event(event_type))
    }

    /// Re-encode as the `{type, ts, data}` envelope the agent sent.
    pub fn to_value(&self) -> serde_json::Value {
        let data = match self {
            AgentEvent::Container { container, .. } => serde_json::to_value(container),
            AgentEvent::Image { image, .. } => serde_json::to_value(image),
            AgentEvent::Snapshot { snapshot, .. } => serde_json::to_value(snapshot),
        }
        .unwrap_or(serde_json::Value::Null);

        serde_json::json!({
            "type": self.event_type(),
            "ts": self.ts(),
            "data": data,
        })
    }
}

pub fn is_container_removal_event(event_type: &str) -> bool {
    CONTAINER_REMOVAL_EVENTS.contains(&event_type)
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    ts: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Parse a text frame sent by an agent.
pub fn parse_agent_message(text: &str) -> Result<AgentEvent, ProtocolError> {
    let raw: RawEvent = serde_json::from_str(text)?;

    if raw.event_type.is_empty() || raw.ts.is_empty() {
        return Err(ProtocolError::Malformed("type and ts are required".into()));
    }

    if raw.event_type == "snapshot" {
        let snapshot = serde_json::from_value(raw.data)?;
        return Ok(AgentEvent::Snapshot {
            ts: raw.ts,
            snapshot,
        });
    }

    if raw.event_type.starts_with("container.") {
        let container = serde_json::from_value(raw.data)?;
        return Ok(AgentEvent::Container {
            event_type: raw.event_type,
            ts: raw.ts,
            container,
        });
    }

    if raw.event_type.starts_with("image.") {
        let image = serde_json::from_value(raw.data)?;
        return Ok(AgentEvent::Image {
            event_type: raw.event_type,
            ts: raw.ts,
            image,
        });
    }

    Err(ProtocolError::Malformed(format!(
        "unknown event type '{}'",
        raw.event_type
    )))
}
