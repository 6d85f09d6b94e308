//! In-memory directory of live agent connections.
//!
//! ## Overview
//!
//! The registry maps each agent id to the connection handle it is currently
//! reachable on, partitioned by organization (tenant). It is the only shared
//! mutable state between the agent socket tasks and the HTTP handlers.
//!
//! ```text
//!  /ws/agent upgrade ──add_to_organization──┐
//!  socket close/error ──release_connection──┤
//!                                           v
//!                  ┌────────────────────────────────────────┐
//!                  │ Mutex<Directory>                       │
//!                  │   clients_by_organization: org → id → C│
//!                  │   organization_by_agent:   id → org    │
//!                  └────────────────────────────────────────┘
//!                                           ^
//!  HTTP handlers ── get / agents / send_to / broadcast / size
//! ```
//!
//! Both maps live behind one mutex and every operation, including the
//! reading ones that evict stale entries, holds it for its full duration.
//! Handles that are no longer open are evicted lazily whenever a lookup or
//! enumeration meets them; there is no background sweep.

pub mod connection;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::RegistryError;
pub use connection::{AgentConnection, Payload, ReadyState};

/// Organization id used for agents that connect without tenant context.
pub const UNASSIGNED_ORGANIZATION_ID: &str = "__unassigned__";

/// What happens to the previous handle when an agent re-registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupersededPolicy {
    /// Close the superseded handle after the new one is registered (default)
    #[default]
    Close,
    /// Drop the registry's reference and leave the old socket to the transport
    Retain,
}

impl std::fmt::Display for SupersededPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupersededPolicy::Close => write!(f, "close"),
            SupersededPolicy::Retain => write!(f, "retain"),
        }
    }
}

impl std::str::FromStr for SupersededPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "close" => Ok(SupersededPolicy::Close),
            "retain" => Ok(SupersededPolicy::Retain),
            _ => anyhow::bail!(
                "Invalid superseded policy '{}'. Valid values: close, retain",
                s
            ),
        }
    }
}

/// A registered agent whose connection was open when it was listed.
pub struct ConnectedAgent<C: ?Sized> {
    pub id: String,
    pub organization_id: String,
    pub client: Arc<C>,
}

impl<C: ?Sized> Clone for ConnectedAgent<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            organization_id: self.organization_id.clone(),
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: ?Sized> std::fmt::Debug for ConnectedAgent<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedAgent")
            .field("id", &self.id)
            .field("organization_id", &self.organization_id)
            .finish_non_exhaustive()
    }
}

// ── Directory (lock-protected state) ─────────────────────────────────

struct Directory<C: ?Sized> {
    clients_by_organization: HashMap<String, HashMap<String, Arc<C>>>,
    organization_by_agent: HashMap<String, String>,
}

impl<C: ?Sized + AgentConnection> Directory<C> {
    fn new() -> Self {
        Self {
            clients_by_organization: HashMap::new(),
            organization_by_agent: HashMap::new(),
        }
    }

    /// Insert `client` for `agent_id`, returning the handle it replaced.
    fn insert(&mut self, organization_id: &str, agent_id: &str, client: Arc<C>) -> Option<Arc<C>> {
        let previous = self.detach(agent_id);

        self.clients_by_organization
            .entry(organization_id.to_string())
            .or_default()
            .insert(agent_id.to_string(), client);
        self.organization_by_agent
            .insert(agent_id.to_string(), organization_id.to_string());

        previous
    }

    /// Remove `agent_id` from both maps, dropping its tenant bucket once empty.
    fn detach(&mut self, agent_id: &str) -> Option<Arc<C>> {
        let organization_id = self.organization_by_agent.remove(agent_id)?;
        let clients = self.clients_by_organization.get_mut(&organization_id)?;
        let client = clients.remove(agent_id);

        if clients.is_empty() {
            self.clients_by_organization.remove(&organization_id);
        }

        client
    }

    fn current(&self, agent_id: &str) -> Option<&Arc<C>> {
        let organization_id = self.organization_by_agent.get(agent_id)?;
        self.clients_by_organization
            .get(organization_id)?
            .get(agent_id)
    }

    /// Look up an agent whose handle is open, evicting it otherwise.
    fn live_entry(&mut self, agent_id: &str) -> Option<ConnectedAgent<C>> {
        let organization_id = self.organization_by_agent.get(agent_id)?.clone();

        let Some(client) = self.current(agent_id).map(Arc::clone) else {
            // Index entry without a client: repair the index.
            self.detach(agent_id);
            return None;
        };

        if !client.is_open() {
            self.detach(agent_id);
            debug!(agent_id, organization_id = %organization_id, state = %client.ready_state(), "Evicted stale agent");
            return None;
        }

        Some(ConnectedAgent {
            id: agent_id.to_string(),
            organization_id,
            client,
        })
    }

    /// Collect open agents (optionally for one tenant) and evict the rest.
    fn collect_live(&mut self, organization_id: Option<&str>) -> Vec<ConnectedAgent<C>> {
        let mut agents = Vec::new();
        let mut stale = Vec::new();

        match organization_id {
            Some(org) => {
                if let Some(clients) = self.clients_by_organization.get(org) {
                    partition_bucket(org, clients, &mut agents, &mut stale);
                }
            }
            None => {
                for (org, clients) in &self.clients_by_organization {
                    partition_bucket(org, clients, &mut agents, &mut stale);
                }
            }
        }

        for agent_id in stale {
            self.detach(&agent_id);
            debug!(agent_id = %agent_id, "Evicted stale agent");
        }

        agents
    }
}

fn partition_bucket<C: ?Sized + AgentConnection>(
    organization_id: &str,
    clients: &HashMap<String, Arc<C>>,
    agents: &mut Vec<ConnectedAgent<C>>,
    stale: &mut Vec<String>,
) {
    for (id, client) in clients {
        if client.is_open() {
            agents.push(ConnectedAgent {
                id: id.clone(),
                organization_id: organization_id.to_string(),
                client: Arc::clone(client),
            });
        } else {
            stale.push(id.clone());
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Tenant-scoped registry of agent connections.
///
/// At most one handle is registered per agent id. Every method is total:
/// failures come back as [`RegistryError`] values, never panics.
pub struct AgentRegistry<C: ?Sized> {
    directory: Mutex<Directory<C>>,
    superseded: SupersededPolicy,
}

impl<C: ?Sized + AgentConnection> AgentRegistry<C> {
    pub fn new() -> Self {
        Self::with_policy(SupersededPolicy::default())
    }

    pub fn with_policy(superseded: SupersededPolicy) -> Self {
        Self {
            directory: Mutex::new(Directory::new()),
            superseded,
        }
    }

    pub fn superseded_policy(&self) -> SupersededPolicy {
        self.superseded
    }

    // Every critical section leaves both maps consistent, so a poisoned lock
    // still guards valid state.
    fn lock(&self) -> MutexGuard<'_, Directory<C>> {
        self.directory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `client` for `agent_id` under the unassigned organization.
    pub fn add(&self, agent_id: &str, client: Arc<C>) {
        self.add_to_organization(UNASSIGNED_ORGANIZATION_ID, agent_id, client);
    }

    /// Register or replace the connection for `agent_id` under `organization_id`.
    pub fn add_to_organization(&self, organization_id: &str, agent_id: &str, client: Arc<C>) {
        let incoming = Arc::clone(&client);
        let previous = self.lock().insert(organization_id, agent_id, client);

        let Some(previous) = previous else {
            debug!(agent_id, organization_id, "Registered agent");
            return;
        };

        debug!(agent_id, organization_id, policy = %self.superseded, "Replaced agent connection");
        if self.superseded == SupersededPolicy::Close && !Arc::ptr_eq(&previous, &incoming) {
            previous.close();
        }
    }

    /// Unregister `agent_id`. Unknown ids are ignored.
    pub fn remove(&self, agent_id: &str) {
        if self.lock().detach(agent_id).is_some() {
            debug!(agent_id, "Removed agent");
        }
    }

    /// Unregister `agent_id` only while `client` is still its registered handle.
    ///
    /// Returns whether an entry was removed. A superseded socket that closes
    /// after its agent reconnected leaves the newer registration in place.
    pub fn remove_connection(&self, agent_id: &str, client: &Arc<C>) -> bool {
        let mut directory = self.lock();
        let is_current = directory
            .current(agent_id)
            .is_some_and(|current| Arc::ptr_eq(current, client));

        if is_current {
            directory.detach(agent_id);
            debug!(agent_id, "Removed agent connection");
        }
        is_current
    }

    /// Release `client` when its socket has finished.
    ///
    /// Unregisters `agent_id` if `client` is still its handle. Returns `false`
    /// only when the agent is registered under a different handle; an agent
    /// that was already evicted counts as released.
    pub fn release_connection(&self, agent_id: &str, client: &Arc<C>) -> bool {
        let mut directory = self.lock();
        match directory.current(agent_id) {
            Some(current) if !Arc::ptr_eq(current, client) => false,
            Some(_) => {
                directory.detach(agent_id);
                debug!(agent_id, "Released agent connection");
                true
            }
            None => true,
        }
    }

    /// Handle for `agent_id`, provided its connection is still open.
    pub fn get(&self, agent_id: &str) -> Result<Arc<C>, RegistryError> {
        self.lookup(agent_id).map(|agent| agent.client)
    }

    /// Like [`get`](Self::get), also reporting the agent's organization.
    pub fn lookup(&self, agent_id: &str) -> Result<ConnectedAgent<C>, RegistryError> {
        self.lock()
            .live_entry(agent_id)
            .ok_or(RegistryError::NotFound)
    }

    /// All agents with an open connection, across every organization.
    pub fn agents(&self) -> Vec<ConnectedAgent<C>> {
        self.lock().collect_live(None)
    }

    /// Agents with an open connection in `organization_id`.
    pub fn agents_by_organization(&self, organization_id: &str) -> Vec<ConnectedAgent<C>> {
        self.lock().collect_live(Some(organization_id))
    }

    /// Deliver `payload` to one agent.
    ///
    /// A missing agent, a stale handle and a failed send all yield
    /// [`RegistryError::NotAvailable`]; a failed send also evicts the agent.
    pub fn send_to(&self, agent_id: &str, payload: impl Into<Payload>) -> Result<(), RegistryError> {
        let mut directory = self.lock();
        let Some(agent) = directory.live_entry(agent_id) else {
            return Err(RegistryError::NotAvailable);
        };

        match agent.client.send(payload.into()) {
            Ok(()) => Ok(()),
            Err(e) => {
                directory.detach(agent_id);
                drop(directory);
                warn!(agent_id, error = %e, "Send failed, evicting agent");
                agent.client.close();
                Err(RegistryError::NotAvailable)
            }
        }
    }

    /// Deliver `payload` to every open connection, best effort.
    ///
    /// Agents whose send fails are evicted; delivery to the rest continues.
    /// Returns the number of agents the payload was handed to.
    pub fn broadcast(&self, payload: impl Into<Payload>) -> usize {
        let payload = payload.into();
        let mut failed = Vec::new();
        let mut delivered = 0;

        {
            let mut directory = self.lock();
            for agent in directory.collect_live(None) {
                match agent.client.send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        directory.detach(&agent.id);
                        warn!(agent_id = %agent.id, error = %e, "Broadcast send failed, evicting agent");
                        failed.push(agent.client);
                    }
                }
            }
        }

        for client in failed {
            client.close();
        }
        delivered
    }

    /// Number of registered agent ids, open or not yet evicted.
    pub fn size(&self) -> usize {
        self.lock().organization_by_agent.len()
    }
}

impl<C: ?Sized + AgentConnection> Default for AgentRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
