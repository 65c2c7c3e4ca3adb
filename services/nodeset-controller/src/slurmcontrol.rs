//! Bridge between NodeSet pods and their Slurm nodes.
//!
//! Every operation looks up the scheduler client for the NodeSet's
//! controller. A NodeSet whose controller has no client yet is treated as
//! having nothing registered: mutations are no-ops and drain checks report
//! true so that pod deletion is never blocked on an unreachable scheduler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slinky_reconcile::{Reduce, TimeStore};
use tracing::{debug, info};

use crate::api::keys::CONDITION_SLURM_STATE_PREFIX;
use crate::api::{ConditionStatus, NodeSet, Pod, PodCondition};
use crate::nodeset::utils::slurm_node_name;
use crate::slurm::{
    hostlist, tolerate, ClientMap, Node, NodeState, NodeUpdate, SlurmClient, SlurmResult,
    UpdateState,
};

/// Prefix marking reasons this controller set.
pub const NODE_REASON_PREFIX: &str = "slurm-operator:";

/// Pod identity stored in the Slurm node comment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub namespace: String,
    pub pod_name: String,
    pub node: String,
}

impl PodInfo {
    pub fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone(),
            pod_name: pod.metadata.name.clone(),
            node: pod.spec.node_name.clone(),
        }
    }

    pub fn parse(comment: &str) -> Self {
        serde_json::from_str(comment).unwrap_or_default()
    }

    pub fn to_comment(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Counts of Slurm node states across a NodeSet's pods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlurmNodeStatus {
    pub total: i32,

    pub allocated: i32,
    pub down: i32,
    pub error: i32,
    pub future: i32,
    pub idle: i32,
    pub mixed: i32,
    pub unknown: i32,

    pub completing: i32,
    pub drain: i32,
    pub fail: i32,
    pub invalid: i32,
    pub invalid_reg: i32,
    pub maintenance: i32,
    pub not_responding: i32,
    pub undrain: i32,

    /// Pod conditions per Slurm node name.
    pub node_states: HashMap<String, Vec<PodCondition>>,
}

const BASE_STATES: [(NodeState, &str); 7] = [
    (NodeState::Allocated, "Allocated"),
    (NodeState::Down, "Down"),
    (NodeState::Error, "Error"),
    (NodeState::Future, "Future"),
    (NodeState::Idle, "Idle"),
    (NodeState::Mixed, "Mixed"),
    (NodeState::Unknown, "Unknown"),
];

const FLAG_STATES: [(NodeState, &str); 8] = [
    (NodeState::Completing, "Completing"),
    (NodeState::Drain, "Drain"),
    (NodeState::Fail, "Fail"),
    (NodeState::Invalid, "Invalid"),
    (NodeState::InvalidReg, "InvalidReg"),
    (NodeState::Maintenance, "Maintenance"),
    (NodeState::NotResponding, "NotResponding"),
    (NodeState::Undrain, "Undrain"),
];

impl SlurmNodeStatus {
    fn counter(&mut self, state: NodeState) -> Option<&mut i32> {
        Some(match state {
            NodeState::Allocated => &mut self.allocated,
            NodeState::Down => &mut self.down,
            NodeState::Error => &mut self.error,
            NodeState::Future => &mut self.future,
            NodeState::Idle => &mut self.idle,
            NodeState::Mixed => &mut self.mixed,
            NodeState::Unknown => &mut self.unknown,
            NodeState::Completing => &mut self.completing,
            NodeState::Drain => &mut self.drain,
            NodeState::Fail => &mut self.fail,
            NodeState::Invalid => &mut self.invalid,
            NodeState::InvalidReg => &mut self.invalid_reg,
            NodeState::Maintenance => &mut self.maintenance,
            NodeState::NotResponding => &mut self.not_responding,
            NodeState::Undrain => &mut self.undrain,
            NodeState::Other => return None,
        })
    }

    fn observe(&mut self, node: &Node, state: NodeState, suffix: &str) {
        if let Some(count) = self.counter(state) {
            *count += 1;
        }
        self.node_states
            .entry(node.name.clone())
            .or_default()
            .push(PodCondition {
                condition_type: format!("{CONDITION_SLURM_STATE_PREFIX}{suffix}"),
                status: ConditionStatus::True,
                message: (!node.reason.is_empty()).then(|| node.reason.clone()),
                ..Default::default()
            });
    }

    fn add_node(&mut self, node: &Node) {
        self.total += 1;
        // one base state, first match wins
        if let Some((state, suffix)) = BASE_STATES.iter().find(|(s, _)| node.has(*s)) {
            self.observe(node, *state, suffix);
        }
        for (state, suffix) in FLAG_STATES {
            if node.has(state) {
                self.observe(node, state, suffix);
            }
        }
    }
}

/// Scheduler operations the sync loop needs, keyed by NodeSet and pod.
#[async_trait]
pub trait SlurmControl: Send + Sync {
    /// Force the node cache to be refreshed.
    async fn refresh_node_cache(&self, nodeset: &NodeSet) -> SlurmResult<()>;

    /// Record the pod identity in the node comment.
    async fn update_node_with_pod_info(&self, nodeset: &NodeSet, pod: &Pod) -> SlurmResult<()>;

    async fn make_node_drain(&self, nodeset: &NodeSet, pod: &Pod, reason: &str) -> SlurmResult<()>;

    async fn make_node_undrain(&self, nodeset: &NodeSet, pod: &Pod, reason: &str)
        -> SlurmResult<()>;

    async fn is_node_drain(&self, nodeset: &NodeSet, pod: &Pod) -> SlurmResult<bool>;

    /// Drain set and no running or completing work.
    async fn is_node_drained(&self, nodeset: &NodeSet, pod: &Pod) -> SlurmResult<bool>;

    async fn calculate_node_status(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
    ) -> SlurmResult<SlurmNodeStatus>;

    /// Latest end time of running jobs per Slurm node.
    async fn get_node_deadlines(&self, nodeset: &NodeSet, pods: &[Arc<Pod>])
        -> SlurmResult<TimeStore>;
}

/// [`SlurmControl`] backed by a [`ClientMap`].
pub struct RealSlurmControl {
    clients: Arc<ClientMap>,
}

impl RealSlurmControl {
    pub fn new(clients: Arc<ClientMap>) -> Self {
        Self { clients }
    }

    fn lookup(&self, nodeset: &NodeSet, op: &str) -> Option<Arc<dyn SlurmClient>> {
        let client = self.clients.get(&nodeset.spec.controller_ref.key());
        if client.is_none() {
            debug!(
                nodeset = %nodeset.metadata.key(),
                controller = %nodeset.spec.controller_ref.key(),
                op,
                "No slurm client for nodeset"
            );
        }
        client
    }

    async fn node_for(&self, client: &dyn SlurmClient, pod: &Pod) -> SlurmResult<Option<Node>> {
        tolerate(client.get_node(slurm_node_name(pod)).await.map(Some), None)
    }
}

fn pod_node_names(pods: &[Arc<Pod>]) -> HashSet<String> {
    pods.iter().map(|p| slurm_node_name(p).to_string()).collect()
}

#[async_trait]
impl SlurmControl for RealSlurmControl {
    async fn refresh_node_cache(&self, nodeset: &NodeSet) -> SlurmResult<()> {
        let Some(client) = self.lookup(nodeset, "refresh_node_cache") else {
            return Ok(());
        };
        client.list_nodes(true).await?;
        Ok(())
    }

    async fn update_node_with_pod_info(&self, nodeset: &NodeSet, pod: &Pod) -> SlurmResult<()> {
        let Some(client) = self.lookup(nodeset, "update_node_with_pod_info") else {
            return Ok(());
        };
        let Some(node) = self.node_for(client.as_ref(), pod).await? else {
            return Ok(());
        };

        let info = PodInfo::from_pod(pod);
        let old = PodInfo::parse(&node.comment);
        if old == info {
            debug!(node = %node.name, "Slurm node already carries pod info");
            return Ok(());
        }

        info!(node = %node.name, pod = %pod.metadata.name, host = %info.node, "Updating slurm node with pod info");
        let update = NodeUpdate {
            comment: Some(info.to_comment()),
            ..Default::default()
        };
        tolerate(client.update_node(&node.name, &update).await, ())?;

        if !old.node.is_empty() {
            // the pod moved hosts; clear any state left by the old one
            info!(node = %node.name, "Resetting slurm node state after host migration");
            let update = NodeUpdate {
                state: vec![UpdateState::Idle],
                ..Default::default()
            };
            tolerate(client.update_node(&node.name, &update).await, ())?;
        }
        Ok(())
    }

    async fn make_node_drain(&self, nodeset: &NodeSet, pod: &Pod, reason: &str) -> SlurmResult<()> {
        let Some(client) = self.lookup(nodeset, "make_node_drain") else {
            return Ok(());
        };
        let Some(node) = self.node_for(client.as_ref(), pod).await? else {
            return Ok(());
        };

        debug!(node = %node.name, pod = %pod.metadata.name, "Draining slurm node");
        let update = NodeUpdate {
            state: vec![UpdateState::Drain],
            reason: Some(format!("{NODE_REASON_PREFIX} {reason}")),
            ..Default::default()
        };
        tolerate(client.update_node(&node.name, &update).await, ())
    }

    async fn make_node_undrain(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        reason: &str,
    ) -> SlurmResult<()> {
        let Some(client) = self.lookup(nodeset, "make_node_undrain") else {
            return Ok(());
        };
        let Some(node) = self.node_for(client.as_ref(), pod).await? else {
            return Ok(());
        };

        if !node.has(NodeState::Drain) || node.has(NodeState::Undrain) {
            debug!(node = %node.name, "Slurm node already undrained");
            return Ok(());
        }
        if !node.reason.is_empty() && !node.reason.contains(NODE_REASON_PREFIX) {
            info!(node = %node.name, reason = %node.reason, "Slurm node drained by someone else, leaving it");
            return Ok(());
        }

        debug!(node = %node.name, pod = %pod.metadata.name, "Undraining slurm node");
        let update = NodeUpdate {
            state: vec![UpdateState::Undrain],
            reason: Some(format!("{NODE_REASON_PREFIX} {reason}")),
            ..Default::default()
        };
        tolerate(client.update_node(&node.name, &update).await, ())
    }

    async fn is_node_drain(&self, nodeset: &NodeSet, pod: &Pod) -> SlurmResult<bool> {
        let Some(client) = self.lookup(nodeset, "is_node_drain") else {
            return Ok(true);
        };
        Ok(self
            .node_for(client.as_ref(), pod)
            .await?
            .is_none_or(|node| node.has(NodeState::Drain)))
    }

    async fn is_node_drained(&self, nodeset: &NodeSet, pod: &Pod) -> SlurmResult<bool> {
        let Some(client) = self.lookup(nodeset, "is_node_drained") else {
            return Ok(true);
        };
        Ok(self
            .node_for(client.as_ref(), pod)
            .await?
            .is_none_or(|node| node.is_drained()))
    }

    async fn calculate_node_status(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
    ) -> SlurmResult<SlurmNodeStatus> {
        let mut status = SlurmNodeStatus::default();
        let Some(client) = self.lookup(nodeset, "calculate_node_status") else {
            return Ok(status);
        };
        let nodes = tolerate(client.list_nodes(false).await, Vec::new())?;

        let names = pod_node_names(pods);
        for node in nodes.iter().filter(|n| names.contains(&n.name)) {
            status.add_node(node);
        }
        Ok(status)
    }

    async fn get_node_deadlines(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
    ) -> SlurmResult<TimeStore> {
        let deadlines = TimeStore::new(Reduce::Greater);
        let Some(client) = self.lookup(nodeset, "get_node_deadlines") else {
            return Ok(deadlines);
        };

        let names = pod_node_names(pods);
        for job in client.list_jobs().await? {
            if !job.is_running() {
                continue;
            }
            let hosts = hostlist::expand(&job.nodes)?;
            if !hosts.iter().any(|h| names.contains(h)) {
                continue;
            }
            let deadline = job.deadline();
            for host in &hosts {
                deadlines.push(host, deadline);
            }
        }
        Ok(deadlines)
    }
}
