//! In-memory scheduler used by tests and local runs.

use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Job, Node, NodeState, NodeUpdate, SlurmClient, SlurmError, SlurmResult, UpdateState};

/// Applies updates the way slurmctld would for the states the controller
/// issues, and records every update for assertions.
#[derive(Default)]
pub struct FakeClient {
    nodes: DashMap<String, Node>,
    jobs: Mutex<Vec<Job>>,
    updates: Mutex<Vec<(String, NodeUpdate)>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let client = Self::new();
        for node in nodes {
            client.put_node(node);
        }
        client
    }

    pub fn put_node(&self, node: Node) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn remove_node(&self, name: &str) {
        self.nodes.remove(name);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.get(name).map(|n| n.value().clone())
    }

    pub fn set_state(&self, name: &str, state: &[NodeState]) {
        if let Some(mut node) = self.nodes.get_mut(name) {
            node.state = state.to_vec();
        }
    }

    pub fn set_jobs(&self, jobs: Vec<Job>) {
        if let Ok(mut current) = self.jobs.lock() {
            *current = jobs;
        }
    }

    pub fn updates(&self) -> Vec<(String, NodeUpdate)> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

fn set_base(node: &mut Node, base: NodeState) {
    const BASE: [NodeState; 7] = [
        NodeState::Idle,
        NodeState::Allocated,
        NodeState::Mixed,
        NodeState::Down,
        NodeState::Error,
        NodeState::Future,
        NodeState::Unknown,
    ];
    node.state.retain(|s| !BASE.contains(s));
    node.state.insert(0, base);
}

#[async_trait]
impl SlurmClient for FakeClient {
    async fn list_nodes(&self, _refresh: bool) -> SlurmResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn get_node(&self, name: &str) -> SlurmResult<Node> {
        self.node(name)
            .ok_or_else(|| SlurmError::NotFound(name.to_string()))
    }

    async fn update_node(&self, name: &str, update: &NodeUpdate) -> SlurmResult<()> {
        let mut node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| SlurmError::NotFound(name.to_string()))?;

        for state in &update.state {
            match state {
                UpdateState::Drain => {
                    node.state.retain(|s| *s != NodeState::Undrain);
                    if !node.has(NodeState::Drain) {
                        node.state.push(NodeState::Drain);
                    }
                }
                UpdateState::Undrain => node.state.retain(|s| *s != NodeState::Drain),
                UpdateState::Idle => set_base(&mut node, NodeState::Idle),
            }
        }
        if let Some(reason) = &update.reason {
            node.reason = reason.clone();
        }
        if let Some(comment) = &update.comment {
            node.comment = comment.clone();
        }
        drop(node);

        if let Ok(mut updates) = self.updates.lock() {
            updates.push((name.to_string(), update.clone()));
        }
        Ok(())
    }

    async fn list_jobs(&self) -> SlurmResult<Vec<Job>> {
        Ok(self.jobs.lock().map(|j| j.clone()).unwrap_or_default())
    }
}
