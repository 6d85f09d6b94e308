use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::protocol::{AgentEvent, Container};

/// Latest known containers per agent, fed by agent events.
///
/// Snapshots replace an agent's view wholesale; container events upsert or,
/// for removal event types, delete a single entry. Image events carry no
/// container state and are ignored here.
#[derive(Default)]
pub struct ContainerCache {
    by_agent: RwLock<HashMap<String, HashMap<String, Container>>>,
}

impl ContainerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, agent_id: &str, event: &AgentEvent) {
        let mut by_agent = self.by_agent.write().unwrap_or_else(PoisonError::into_inner);

        match event {
            AgentEvent::Snapshot { snapshot, .. } => {
                let containers = snapshot
                    .containers
                    .iter()
                    .map(|c| (c.id.clone(), c.clone()))
                    .collect();
                by_agent.insert(agent_id.to_string(), containers);
            }
            AgentEvent::Container { container, .. } if event.is_container_removal() => {
                if let Some(containers) = by_agent.get_mut(agent_id) {
                    containers.remove(&container.id);
                }
            }
            AgentEvent::Container { container, .. } => {
                by_agent
                    .entry(agent_id.to_string())
                    .or_default()
                    .insert(container.id.clone(), container.clone());
            }
            AgentEvent::Image { .. } => {}
        }
    }

    /// Containers reported by `agent_id`, sorted by name.
    pub fn containers(&self, agent_id: &str) -> Vec<Container> {
        let by_agent = self.by_agent.read().unwrap_or_else(PoisonError::into_inner);
        let mut containers: Vec<Container> = by_agent
            .get(agent_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        containers
    }

    /// Forget everything reported by `agent_id`.
    pub fn forget(&self, agent_id: &str) {
        self.by_agent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ContainerState, Snapshot};

    fn container(id: &str, state: ContainerState) -> Container {
        Container {
            id: id.to_string(),
            name: format!("container-{}", id),
            image: "nginx:latest".to_string(),
            state,
            ports: None,
            created: 1_700_000_000,
        }
    }

    fn container_event(event_type: &str, c: Container) -> AgentEvent {
        AgentEvent::Container {
            event_type: event_type.to_string(),
            ts: "2026-01-01T00:00:00Z".to_string(),
            container: c,
        }
    }

    fn snapshot(containers: Vec<Container>) -> AgentEvent {
        AgentEvent::Snapshot {
            ts: "2026-01-01T00:00:00Z".to_string(),
            snapshot: Snapshot {
                containers,
                images: vec![],
            },
        }
    }

    #[test]
    fn test_snapshot_replaces_view() {
        let cache = ContainerCache::new();
        cache.apply("agent-1", &snapshot(vec![container("a", ContainerState::Running)]));
        cache.apply(
            "agent-1",
            &snapshot(vec![
                container("b", ContainerState::Running),
                container("c", ContainerState::Exited),
            ]),
        );

        let ids: Vec<String> = cache.containers("agent-1").into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_empty_snapshot_clears_view() {
        let cache = ContainerCache::new();
        cache.apply("agent-1", &snapshot(vec![container("a", ContainerState::Running)]));
        cache.apply("agent-1", &snapshot(vec![]));
        assert!(cache.containers("agent-1").is_empty());
    }

    #[test]
    fn test_container_event_upserts() {
        let cache = ContainerCache::new();
        cache.apply(
            "agent-1",
            &container_event("container.start", container("a", ContainerState::Running)),
        );
        cache.apply(
            "agent-1",
            &container_event("container.pause", container("a", ContainerState::Paused)),
        );

        let containers = cache.containers("agent-1");
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].state, ContainerState::Paused);
    }

    #[test]
    fn test_removal_event_deletes() {
        let cache = ContainerCache::new();
        cache.apply("agent-1", &snapshot(vec![container("a", ContainerState::Running)]));
        cache.apply(
            "agent-1",
            &container_event("container.destroy", container("a", ContainerState::Exited)),
        );
        assert!(cache.containers("agent-1").is_empty());
    }

    #[test]
    fn test_views_are_per_agent_and_forgettable() {
        let cache = ContainerCache::new();
        cache.apply("agent-1", &snapshot(vec![container("a", ContainerState::Running)]));
        cache.apply("agent-2", &snapshot(vec![container("b", ContainerState::Running)]));

        cache.forget("agent-1");
        assert!(cache.containers("agent-1").is_empty());
        assert_eq!(cache.containers("agent-2").len(), 1);
    }
}
