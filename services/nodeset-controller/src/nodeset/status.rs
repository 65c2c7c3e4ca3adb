//! Status aggregation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slinky_reconcile::{clamp, slow_start_batch, SLOW_START_INITIAL_BATCH_SIZE};
use tracing::{debug, trace};

use super::controller::{NodeSetReconciler, SyncError, SyncResult};
use super::revision::RevisionSet;
use super::utils::{nodeset_key, revision_hash, slurm_node_name};
use crate::api::keys::CONDITION_SLURM_STATE_PREFIX;
use crate::api::{NodeSet, NodeSetStatus, Pod, PodCondition, Resource};
use crate::history::revision_label;
use crate::slurmcontrol::SlurmNodeStatus;
use crate::store::retry_on_conflict;

/// Requeue delay while Slurm has not registered every pod yet.
pub const SLURM_SETTLE_REQUEUE: Duration = Duration::from_secs(10);

/// Pod-derived replica counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub replicas: i32,
    pub ready: i32,
    pub available: i32,
    pub unavailable: i32,
    pub current: i32,
    pub updated: i32,
}

pub fn calculate_replica_status(
    nodeset: &NodeSet,
    pods: &[Arc<Pod>],
    revisions: &RevisionSet,
) -> ReplicaStatus {
    let now = Utc::now();
    let current_hash = revision_label(&revisions.current);
    let update_hash = revision_label(&revisions.update);

    let mut status = ReplicaStatus::default();
    for pod in pods {
        // every claimed pod exists in the store
        status.replicas += 1;
        if pod.is_running_and_ready() {
            status.ready += 1;
            if pod.is_available(nodeset.spec.min_ready_seconds, now) {
                status.available += 1;
            }
        }
        if !pod.is_terminating() {
            let hash = revision_hash(pod).unwrap_or_default();
            if hash == current_hash {
                status.current += 1;
            }
            if hash == update_hash {
                status.updated += 1;
            }
        }
    }
    status.unavailable = clamp(status.replicas - status.available, 0, status.replicas);
    status
}

fn slurm_conditions(pod: &Pod) -> Vec<&PodCondition> {
    pod.status
        .conditions
        .iter()
        .filter(|c| c.condition_type.starts_with(CONDITION_SLURM_STATE_PREFIX))
        .collect()
}

fn same_conditions(have: &[&PodCondition], want: &[PodCondition]) -> bool {
    have.len() == want.len()
        && want.iter().all(|w| {
            have.iter().any(|h| {
                h.condition_type == w.condition_type
                    && h.status == w.status
                    && h.message == w.message
            })
        })
}

impl NodeSetReconciler {
    /// Refresh Slurm node comments, mirror node states onto pods and
    /// write the NodeSet status.
    pub(crate) async fn sync_status(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
        revisions: &RevisionSet,
    ) -> SyncResult<()> {
        let mut errors = Vec::new();
        if let Err(err) = self.sync_slurm_status(nodeset, pods).await {
            errors.push(err);
        }
        if let Err(err) = self.sync_nodeset_status(nodeset, pods, revisions).await {
            errors.push(err);
        }
        SyncError::collect(errors)
    }

    async fn sync_slurm_status(&self, nodeset: &NodeSet, pods: &[Arc<Pod>]) -> SyncResult<()> {
        slow_start_batch(pods.len(), SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = &pods[i];
            async move {
                if !pod.is_healthy() {
                    return Ok(());
                }
                self.slurm
                    .update_node_with_pod_info(nodeset, pod)
                    .await
                    .map_err(SyncError::from)
            }
        })
        .await
        .into_result()
        .map(|_| ())
    }

    async fn sync_nodeset_status(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
        revisions: &RevisionSet,
    ) -> SyncResult<()> {
        let replicas = calculate_replica_status(nodeset, pods, revisions);
        let slurm = self.slurm.calculate_node_status(nodeset, pods).await?;
        self.sync_pod_conditions(pods, &slurm).await?;

        let status = NodeSetStatus {
            replicas: replicas.replicas,
            updated_replicas: replicas.updated,
            ready_replicas: replicas.ready,
            available_replicas: replicas.available,
            unavailable_replicas: replicas.unavailable,
            slurm_idle: slurm.idle,
            slurm_allocated: slurm.allocated + slurm.mixed,
            slurm_down: slurm.down,
            slurm_drain: slurm.drain,
            observed_generation: nodeset.metadata.generation,
            node_set_hash: revision_label(&revisions.update).to_string(),
            collision_count: Some(revisions.collision_count),
            selector: nodeset.spec.selector.to_string(),
            conditions: nodeset.status.conditions.clone(),
        };

        if nodeset.status == status {
            trace!("NodeSet status has not changed, skipping update");
        } else {
            debug!(
                replicas = status.replicas,
                ready = status.ready_replicas,
                available = status.available_replicas,
                updated = status.updated_replicas,
                "Updating NodeSet status"
            );
            let result = retry_on_conflict(self.store.nodesets(), &nodeset.key(), true, |n| {
                n.status = status.clone();
                true
            })
            .await;
            match result {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
        }

        let key = nodeset_key(nodeset);
        if nodeset.spec.min_ready_seconds >= 0 && status.ready_replicas != status.available_replicas {
            let wait = u64::try_from(nodeset.spec.min_ready_seconds).unwrap_or(0);
            self.requeue
                .push(&key, Duration::from_secs(wait) + Duration::from_secs(1));
        } else if slurm.total != status.replicas {
            self.requeue.push(&key, SLURM_SETTLE_REQUEUE);
        }
        Ok(())
    }

    /// Replace each pod's Slurm state conditions with what Slurm reports.
    async fn sync_pod_conditions(
        &self,
        pods: &[Arc<Pod>],
        slurm: &SlurmNodeStatus,
    ) -> SyncResult<()> {
        let stale: Vec<&Arc<Pod>> = pods
            .iter()
            .filter(|pod| {
                let want = slurm
                    .node_states
                    .get(slurm_node_name(pod))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                !same_conditions(&slurm_conditions(pod), want)
            })
            .collect();

        slow_start_batch(stale.len(), SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = stale[i];
            async move {
                let want = slurm
                    .node_states
                    .get(slurm_node_name(pod))
                    .cloned()
                    .unwrap_or_default();
                let result = retry_on_conflict(self.store.pods(), &pod.key(), true, |p| {
                    if same_conditions(&slurm_conditions(p), &want) {
                        return false;
                    }
                    p.status
                        .conditions
                        .retain(|c| !c.condition_type.starts_with(CONDITION_SLURM_STATE_PREFIX));
                    p.status.conditions.extend(want.iter().cloned());
                    true
                })
                .await;
                match result {
                    Err(err) if !err.is_not_found() => Err(SyncError::from(err)),
                    _ => Ok(()),
                }
            }
        })
        .await
        .into_result()
        .map(|_| ())
    }
}
