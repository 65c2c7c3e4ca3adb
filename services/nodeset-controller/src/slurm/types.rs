//! slurmrestd data types (v0.0.43 subset).

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Base states and flags reported for a Slurm node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Idle,
    Allocated,
    Mixed,
    Down,
    Error,
    Future,
    Unknown,
    Completing,
    Drain,
    Undrain,
    Fail,
    Invalid,
    InvalidReg,
    Maintenance,
    NotResponding,
    #[serde(other)]
    Other,
}

/// A Slurm node as returned by slurmrestd.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub state: Vec<NodeState>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub comment: String,
}

impl Node {
    pub fn new(name: impl Into<String>, state: &[NodeState]) -> Self {
        Self {
            name: name.into(),
            state: state.to_vec(),
            ..Default::default()
        }
    }

    pub fn states(&self) -> BTreeSet<NodeState> {
        self.state.iter().copied().collect()
    }

    pub fn has(&self, state: NodeState) -> bool {
        self.state.contains(&state)
    }

    pub fn has_any(&self, states: &[NodeState]) -> bool {
        states.iter().any(|s| self.has(*s))
    }

    /// DRAIN set and not being lifted.
    pub fn is_drain(&self) -> bool {
        self.has(NodeState::Drain) && !self.has(NodeState::Undrain)
    }

    /// Running or finishing work.
    pub fn is_busy(&self) -> bool {
        self.has_any(&[
            NodeState::Allocated,
            NodeState::Mixed,
            NodeState::Completing,
        ])
    }

    pub fn is_drained(&self) -> bool {
        self.is_drain() && !self.is_busy()
    }
}

/// State change accepted by `POST /node/{name}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateState {
    Drain,
    Undrain,
    Idle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<UpdateState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Optional numeric field as slurmrestd encodes it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoVal {
    #[serde(default)]
    pub set: bool,
    #[serde(default)]
    pub infinite: bool,
    #[serde(default)]
    pub number: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failed,
    Timeout,
    NodeFail,
    Preempted,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub job_id: u64,
    #[serde(default)]
    pub job_state: Vec<JobState>,
    /// Compressed hostlist, e.g. `node-[0-3]`.
    #[serde(default)]
    pub nodes: String,
    #[serde(default)]
    pub start_time: NoVal,
    /// Wall clock limit in minutes.
    #[serde(default)]
    pub time_limit: NoVal,
}

impl Job {
    pub fn is_running(&self) -> bool {
        self.job_state.contains(&JobState::Running)
    }

    /// When the job hits its time limit. Unlimited jobs never end.
    pub fn deadline(&self) -> DateTime<Utc> {
        if self.time_limit.infinite {
            return DateTime::<Utc>::MAX_UTC;
        }
        let start = DateTime::from_timestamp(self.start_time.number, 0).unwrap_or_default();
        start
            .checked_add_signed(Duration::minutes(self.time_limit.number))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_decoding() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "name": "compute-0",
            "state": ["IDLE", "DRAIN", "POWERED_DOWN"],
            "reason": "slurm-operator: scale in"
        }))
        .unwrap();

        assert!(node.has(NodeState::Idle));
        assert!(node.has(NodeState::Other));
        assert!(node.is_drain());
        assert!(node.is_drained());
    }

    #[test]
    fn test_busy_drain_is_not_drained() {
        let node = Node::new("compute-0", &[NodeState::Mixed, NodeState::Drain]);
        assert!(node.is_drain());
        assert!(!node.is_drained());

        let lifting = Node::new("compute-1", &[NodeState::Idle, NodeState::Drain, NodeState::Undrain]);
        assert!(!lifting.is_drain());
    }

    #[test]
    fn test_job_deadline() {
        let job = Job {
            job_id: 1,
            job_state: vec![JobState::Running],
            nodes: "compute-0".into(),
            start_time: NoVal {
                set: true,
                number: 1_700_000_000,
                ..Default::default()
            },
            time_limit: NoVal {
                set: true,
                number: 60,
                ..Default::default()
            },
        };
        assert_eq!(job.deadline().timestamp(), 1_700_000_000 + 3600);

        let unlimited = Job {
            time_limit: NoVal {
                infinite: true,
                ..Default::default()
            },
            ..job
        };
        assert_eq!(unlimited.deadline(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_update_encoding() {
        let update = NodeUpdate {
            state: vec![UpdateState::Drain],
            reason: Some("slurm-operator: scale in".into()),
            comment: None,
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"state": ["DRAIN"], "reason": "slurm-operator: scale in"})
        );
    }
}
