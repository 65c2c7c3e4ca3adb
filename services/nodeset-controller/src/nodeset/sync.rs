//! Fleet mutation: scheduler propagation, scale out, scale in and the
//! steady-state pass.
//!
//! Ordering constraints:
//! - kept pods are uncordoned before anything is created
//! - a condemned pod is cordoned, then its Slurm node drained, and only
//!   deleted once the node reports drained or is unknown to Slurm
//! - expectations are armed before the first API call of a batch and
//!   lowered for every pod whose removal will never be observed

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use slinky_reconcile::{clamp, slow_start_batch, BURST_REPLICAS, SLOW_START_INITIAL_BATCH_SIZE};
use tracing::{debug, info, warn};

use super::controller::{NodeSetReconciler, SyncError, SyncResult};
use super::update::{max_unavailable, split_update_pods};
use super::utils::{
    cordon_patch, deadline_patch, is_node_eligible, is_pod_cordon, is_progressive_create,
    new_nodeset_pod, nodeset_key, ordinal, slurm_node_name,
};
use super::sort::split_active_pods;
use crate::api::keys::ANNOTATION_POD_DEADLINE;
use crate::api::{NodeSet, Pod, PodPhase, Resource};
use crate::events::{Event, EventType, REASON_FAILED_NODESET_POD, REASON_FAILED_PLACEMENT};

/// Requeue delay while a condemned pod's node drains.
pub const DRAIN_REQUEUE: Duration = Duration::from_secs(30);

/// What happened to one condemned pod.
#[derive(Debug)]
pub enum DeleteOutcome {
    Deleted,
    /// Cordoned and draining; look again after the delay.
    PendingDrain(Duration),
    Failed(SyncError),
}

fn failed_pod_backoff_key(nodeset: &NodeSet, pod: &Pod) -> String {
    let node = if pod.spec.node_name.is_empty() {
        &pod.metadata.name
    } else {
        &pod.spec.node_name
    };
    format!(
        "{}/{}/{}",
        nodeset.metadata.uid, nodeset.status.observed_generation, node
    )
}

impl NodeSetReconciler {
    /// Everything that mutates the fleet, in order.
    pub(crate) async fn sync_pods(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
        hash: &str,
    ) -> SyncResult<()> {
        self.slurm.refresh_node_cache(nodeset).await?;
        self.sync_service(nodeset).await?;
        self.sync_slurm(nodeset, pods).await?;
        self.sync_nodeset(nodeset, pods, hash).await
    }

    /// Desired replica count: the explicit value, or one per eligible
    /// cluster node.
    pub(crate) async fn replicas_wanted(&self, nodeset: &NodeSet) -> SyncResult<i32> {
        if let Some(replicas) = nodeset.spec.replicas {
            return Ok(replicas.max(0));
        }
        let nodes = self.store.nodes().list("").await?;
        let eligible = nodes.iter().filter(|n| is_node_eligible(nodeset, n)).count();
        Ok(i32::try_from(eligible).unwrap_or(i32::MAX))
    }

    /// Mirror job deadlines onto pods and cordon state onto Slurm nodes.
    pub(crate) async fn sync_slurm(&self, nodeset: &NodeSet, pods: &[Arc<Pod>]) -> SyncResult<()> {
        let deadlines = self.slurm.get_node_deadlines(nodeset, pods).await?;

        slow_start_batch(pods.len(), SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = &pods[i];
            let deadline = deadlines.get(slurm_node_name(pod));
            async move { self.sync_pod_slurm(nodeset, pod, deadline).await }
        })
        .await
        .into_result()?;
        Ok(())
    }

    async fn sync_pod_slurm(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        deadline: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        let want = deadline.map(|t| t.to_rfc3339());
        if pod.metadata.annotations.get(ANNOTATION_POD_DEADLINE) != want.as_ref() {
            debug!(pod = %pod.metadata.name, deadline = ?want, "Updating pod deadline");
            match self
                .store
                .pods()
                .patch(&pod.key(), &deadline_patch(deadline))
                .await
            {
                Err(err) if !err.is_not_found() => return Err(err.into()),
                _ => {}
            }
        }

        if is_pod_cordon(pod) {
            let reason = format!("Pod ({}) is cordoned", pod.key());
            self.slurm.make_node_drain(nodeset, pod, &reason).await?;
        } else {
            let reason = format!("Pod ({}) is uncordoned", pod.key());
            self.slurm.make_node_undrain(nodeset, pod, &reason).await?;
        }
        Ok(())
    }

    /// Compare pod count against the desired replicas and act.
    pub(crate) async fn sync_nodeset(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
        hash: &str,
    ) -> SyncResult<()> {
        let replicas = self.replicas_wanted(nodeset).await?;
        if nodeset.spec.replicas.is_none() && replicas == 0 {
            self.recorder
                .record(Event::new(
                    nodeset,
                    EventType::Warning,
                    REASON_FAILED_PLACEMENT,
                    "No eligible nodes for NodeSet pods",
                ))
                .await;
        }

        let diff = pods.len() as i64 - i64::from(replicas);
        if diff < 0 {
            debug!(need = replicas, creating = -diff, "Too few NodeSet pods");
            self.scale_out(nodeset, pods, (-diff) as usize, replicas, hash)
                .await
        } else if diff > 0 {
            debug!(need = replicas, deleting = diff, "Too many NodeSet pods");
            let (condemned, kept) = split_active_pods(pods.to_vec(), diff);
            self.scale_in(nodeset, &condemned, &kept).await
        } else {
            debug!(replicas, "Processing NodeSet pods");
            self.process_pods(nodeset, pods, replicas, hash).await
        }
    }

    /// Uncordon everything, then create pods on the lowest free ordinals.
    pub(crate) async fn scale_out(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
        count: usize,
        replicas: i32,
        hash: &str,
    ) -> SyncResult<()> {
        let key = nodeset_key(nodeset);
        self.uncordon_all(nodeset, pods).await?;

        let mut count = clamp(count, 0, BURST_REPLICAS);
        if is_progressive_create(nodeset) {
            let cap = max_unavailable(nodeset, replicas).max(0) as usize;
            count = count.min(cap);
        }

        let mut used: HashSet<i32> = pods.iter().map(|p| ordinal(p)).collect();
        let mut next = 0;
        let to_create: Vec<Pod> = (0..count)
            .map(|_| {
                while used.contains(&next) {
                    next += 1;
                }
                used.insert(next);
                new_nodeset_pod(nodeset, next, hash)
            })
            .collect();

        self.expectations.expect_creations(&key, count);
        let result = slow_start_batch(count, SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = &to_create[i];
            async move {
                match self.pod_control.create_nodeset_pod(nodeset, pod).await {
                    // nothing can be created there any more
                    Err(err) if err.is_namespace_terminating() => Ok(()),
                    other => other.map_err(SyncError::from),
                }
            }
        })
        .await;

        let skipped = count - result.successes;
        if skipped > 0 {
            info!(skipped, "Slow-start failure, skipping creation of pods");
            for _ in 0..skipped {
                self.expectations.creation_observed(&key);
            }
        }
        result.into_result().map(|_| ())
    }

    /// Uncordon the kept pods and gracefully remove the condemned ones.
    pub(crate) async fn scale_in(
        &self,
        nodeset: &NodeSet,
        condemned: &[Arc<Pod>],
        kept: &[Arc<Pod>],
    ) -> SyncResult<()> {
        let key = nodeset_key(nodeset);
        self.uncordon_all(nodeset, kept).await?;

        slow_start_batch(condemned.len(), SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = &condemned[i];
            async move {
                let control = &self.pod_control;
                if !control
                    .pod_pvcs_match_retention_policy(nodeset, pod, true)
                    .await?
                {
                    control
                        .update_pod_pvcs_for_retention_policy(nodeset, pod, true)
                        .await?;
                }
                Ok::<(), SyncError>(())
            }
        })
        .await
        .into_result()?;

        let count = clamp(condemned.len(), 0, BURST_REPLICAS);
        let condemned = &condemned[..count];
        let pod_keys: Vec<String> = condemned.iter().map(|p| p.key().to_string()).collect();
        self.expectations.expect_deletions(&key, &pod_keys);

        slow_start_batch(count, SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = &condemned[i];
            let pod_key = &pod_keys[i];
            let key = &key;
            async move {
                match self.process_condemned(nodeset, pod).await {
                    DeleteOutcome::Deleted => Ok(()),
                    DeleteOutcome::PendingDrain(after) => {
                        // no delete was issued, nothing to observe
                        self.expectations.deletion_observed(key, pod_key);
                        self.requeue.push(key, after);
                        Ok(())
                    }
                    DeleteOutcome::Failed(err) => {
                        self.expectations.deletion_observed(key, pod_key);
                        if err.is_not_found() {
                            return Ok(());
                        }
                        debug!(pod = %pod_key, error = %err, "Failed to delete pod, lowered expectations");
                        Err(err)
                    }
                }
            }
        })
        .await
        .into_result()
        .map(|_| ())
    }

    /// Delete the pod once its node is drained, otherwise start draining.
    pub(crate) async fn process_condemned(&self, nodeset: &NodeSet, pod: &Pod) -> DeleteOutcome {
        if pod.is_terminating() {
            debug!(pod = %pod.metadata.name, "Condemned pod already terminating");
            return DeleteOutcome::Deleted;
        }

        // never started, so no slurmd ever registered for it
        let unscheduled = !pod.is_scheduled() && pod.status.phase == PodPhase::Pending;
        if !unscheduled {
            let drained = match self.slurm.is_node_drained(nodeset, pod).await {
                Ok(drained) => drained,
                Err(err) => return DeleteOutcome::Failed(err.into()),
            };
            if !drained {
                debug!(pod = %pod.metadata.name, "Condemned pod is draining, pending termination");
                if let Err(err) = self.cordon_and_drain(nodeset, pod).await {
                    return DeleteOutcome::Failed(err);
                }
                return DeleteOutcome::PendingDrain(DRAIN_REQUEUE);
            }
        }

        info!(pod = %pod.metadata.name, "Terminating condemned pod");
        match self.pod_control.delete_nodeset_pod(nodeset, pod).await {
            Ok(()) => DeleteOutcome::Deleted,
            Err(err) if err.is_not_found() => DeleteOutcome::Deleted,
            Err(err) => DeleteOutcome::Failed(err.into()),
        }
    }

    /// Steady state: the count is right, keep each pod consistent.
    pub(crate) async fn process_pods(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
        replicas: i32,
        hash: &str,
    ) -> SyncResult<()> {
        let key = nodeset_key(nodeset);

        // pods picked by the rolling planner stay cordoned
        let (_, kept) = split_update_pods(nodeset, pods, hash, replicas);
        self.uncordon_all(nodeset, &kept).await?;

        self.expectations.set(&key, 0, 0);

        slow_start_batch(pods.len(), SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = &pods[i];
            async move { self.process_replica(nodeset, pod).await }
        })
        .await
        .into_result()
        .map(|_| ())
    }

    /// Replace a finished pod, or bring a live one in line.
    pub(crate) async fn process_replica(&self, nodeset: &NodeSet, pod: &Pod) -> SyncResult<()> {
        if !(pod.is_failed() || pod.is_succeeded()) {
            return self
                .pod_control
                .update_nodeset_pod(nodeset, pod, is_pod_cordon(pod))
                .await
                .map_err(SyncError::from);
        }
        if pod.is_terminating() {
            return Ok(());
        }

        let backoff_key = failed_pod_backoff_key(nodeset, pod);
        let now = Instant::now();
        if self
            .failed_pods_backoff
            .is_in_backoff_since_update(&backoff_key, now)
        {
            let delay = self.failed_pods_backoff.remaining(&backoff_key, now);
            debug!(pod = %pod.metadata.name, delay_ms = delay.as_millis() as u64, "Failed pod in backoff");
            self.requeue.push(&nodeset_key(nodeset), delay);
            return Ok(());
        }
        self.failed_pods_backoff.next(&backoff_key, now);

        warn!(pod = %pod.metadata.name, node = %pod.spec.node_name, phase = ?pod.status.phase, "Found finished NodeSet pod, deleting");
        self.recorder
            .record(Event::new(
                nodeset,
                EventType::Warning,
                REASON_FAILED_NODESET_POD,
                format!(
                    "Found failed NodeSet pod {} on node {}, will try to kill it",
                    pod.metadata.name, pod.spec.node_name
                ),
            ))
            .await;

        match self.pod_control.delete_nodeset_pod(nodeset, pod).await {
            Err(err) if !err.is_not_found() => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn uncordon_all(&self, nodeset: &NodeSet, pods: &[Arc<Pod>]) -> SyncResult<()> {
        slow_start_batch(pods.len(), SLOW_START_INITIAL_BATCH_SIZE, |i| {
            let pod = &pods[i];
            async move { self.uncordon_and_undrain(nodeset, pod).await }
        })
        .await
        .into_result()
        .map(|_| ())
    }

    pub(crate) async fn cordon_and_drain(&self, nodeset: &NodeSet, pod: &Pod) -> SyncResult<()> {
        if !is_pod_cordon(pod) {
            info!(pod = %pod.metadata.name, "Cordoning pod, pending deletion");
            self.store.pods().patch(&pod.key(), &cordon_patch(true)).await?;
        }
        let reason = format!("Pod ({}) has been cordoned", pod.key());
        self.slurm.make_node_drain(nodeset, pod, &reason).await?;
        Ok(())
    }

    pub(crate) async fn uncordon_and_undrain(&self, nodeset: &NodeSet, pod: &Pod) -> SyncResult<()> {
        if is_pod_cordon(pod) {
            info!(pod = %pod.metadata.name, "Uncordoning pod");
            self.store
                .pods()
                .patch(&pod.key(), &cordon_patch(false))
                .await?;
        }
        let reason = format!("Pod ({}) has been uncordoned", pod.key());
        self.slurm.make_node_undrain(nodeset, pod, &reason).await?;
        Ok(())
    }
}
