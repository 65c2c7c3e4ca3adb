//! The NodeSet custom resource.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slinky_reconcile::IntOrPercent;

use super::meta::{resource, LabelSelector, ObjectMeta, ObjectReference};
use super::workload::{PersistentVolumeClaim, PodTemplateSpec};

pub const DEFAULT_REVISION_HISTORY_LIMIT: i32 = 10;

/// A fleet of Slurm worker pods, one per cluster node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: NodeSetSpec,
    #[serde(default)]
    pub status: NodeSetStatus,
}

resource!(NodeSet, "slinky.slurm.net/v1alpha1", "NodeSet", "nodesets");

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// The Slurm controller whose nodes these pods register as.
    #[serde(default)]
    pub controller_ref: ObjectReference,

    /// Desired pod count. Unset means one pod per eligible node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default)]
    pub selector: LabelSelector,

    #[serde(default)]
    pub template: PodTemplateSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,

    #[serde(default)]
    pub update_strategy: NodeSetUpdateStrategy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_retention_policy: Option<RetentionPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i32>,

    #[serde(default)]
    pub min_ready_seconds: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStrategyType {
    #[default]
    RollingUpdate,
    OnDelete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetUpdateStrategy {
    #[serde(rename = "type", default)]
    pub strategy_type: UpdateStrategyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
    /// Pods with an ordinal at or above `replicas - partition` keep their revision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionPolicyType {
    #[default]
    Retain,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default)]
    pub when_deleted: RetentionPolicyType,
    #[serde(default)]
    pub when_scaled: RetentionPolicyType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub updated_replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub unavailable_replicas: i32,

    #[serde(default)]
    pub slurm_idle: i32,
    #[serde(default)]
    pub slurm_allocated: i32,
    #[serde(default)]
    pub slurm_down: i32,
    #[serde(default)]
    pub slurm_drain: i32,

    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_set_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl NodeSet {
    pub fn revision_history_limit(&self) -> i32 {
        self.spec
            .revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
            .max(0)
    }

    pub fn rolling_update(&self) -> Option<&RollingUpdate> {
        match self.spec.update_strategy.strategy_type {
            UpdateStrategyType::RollingUpdate => self.spec.update_strategy.rolling_update.as_ref(),
            UpdateStrategyType::OnDelete => None,
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.spec
            .persistent_volume_claim_retention_policy
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodeset_deserialize_defaults() {
        let raw = serde_json::json!({
            "metadata": {"name": "compute", "namespace": "slurm"},
            "spec": {
                "controllerRef": {"namespace": "slurm", "name": "slurm"},
                "replicas": 2,
                "selector": {"matchLabels": {"app": "slurmd"}},
                "template": {"spec": {"containers": [{"name": "slurmd"}]}},
                "updateStrategy": {"rollingUpdate": {"maxUnavailable": "25%"}}
            }
        });
        let nodeset: NodeSet = serde_json::from_value(raw).unwrap();

        assert_eq!(nodeset.spec.replicas, Some(2));
        assert_eq!(
            nodeset.spec.update_strategy.strategy_type,
            UpdateStrategyType::RollingUpdate
        );
        assert_eq!(
            nodeset.rolling_update().and_then(|r| r.max_unavailable.clone()),
            Some(IntOrPercent::Percent("25%".into()))
        );
        assert_eq!(nodeset.revision_history_limit(), DEFAULT_REVISION_HISTORY_LIMIT);
        assert_eq!(nodeset.retention_policy(), RetentionPolicy::default());
    }

    #[test]
    fn test_on_delete_has_no_rolling_update() {
        let mut nodeset = NodeSet::default();
        nodeset.spec.update_strategy = NodeSetUpdateStrategy {
            strategy_type: UpdateStrategyType::OnDelete,
            rolling_update: Some(RollingUpdate::default()),
        };
        assert!(nodeset.rolling_update().is_none());
    }
}
