//! Rolling update planner.

use std::sync::Arc;

use chrono::Utc;
use slinky_reconcile::clamp;
use slinky_reconcile::intstr::scaled_value_or;
use tracing::info;

use super::controller::{NodeSetReconciler, SyncResult};
use super::sort::split_active_pods;
use super::utils::{is_pod_delete, ordinal, revision_hash};
use crate::api::{NodeSet, Pod, UpdateStrategyType};

/// How many pods may be unavailable at once during a rollout.
pub fn max_unavailable(nodeset: &NodeSet, replicas: i32) -> i32 {
    let value = scaled_value_or(
        nodeset
            .rolling_update()
            .and_then(|r| r.max_unavailable.as_ref()),
        replicas,
        true,
        1,
    );
    if replicas > 0 {
        value.max(1)
    } else {
        value.max(0)
    }
}

fn is_paused(nodeset: &NodeSet) -> bool {
    nodeset.rolling_update().is_some_and(|r| r.paused)
}

/// Split pods into rollout victims and the pods to keep.
///
/// Under OnDelete nothing is planned and nothing is kept. A paused rollout
/// keeps everything. Otherwise old pods that are unavailable or marked for
/// deletion always go, and available old pods go while the unavailable
/// budget lasts. Old pods inside the partition are never picked.
pub fn split_update_pods(
    nodeset: &NodeSet,
    pods: &[Arc<Pod>],
    hash: &str,
    replicas: i32,
) -> (Vec<Arc<Pod>>, Vec<Arc<Pod>>) {
    if nodeset.spec.update_strategy.strategy_type == UpdateStrategyType::OnDelete {
        return (Vec::new(), Vec::new());
    }

    let now = Utc::now();
    let min_ready = nodeset.spec.min_ready_seconds;
    let partition = nodeset
        .rolling_update()
        .and_then(|r| r.partition)
        .unwrap_or(0)
        .max(0);
    let reserved_from = replicas - partition;

    let mut keep = Vec::new();
    let mut forced = Vec::new();
    let mut available_old = Vec::new();
    let mut unavailable_new = 0;

    for pod in pods.iter().filter(|p| !p.is_terminating()) {
        let available = pod.is_available(min_ready, now);
        if revision_hash(pod) == Some(hash) {
            if !available {
                unavailable_new += 1;
            }
            keep.push(Arc::clone(pod));
        } else if partition > 0 && ordinal(pod) >= reserved_from {
            keep.push(Arc::clone(pod));
        } else if !available || is_pod_delete(pod) {
            forced.push(Arc::clone(pod));
        } else {
            available_old.push(Arc::clone(pod));
        }
    }

    if is_paused(nodeset) {
        keep.extend(forced);
        keep.extend(available_old);
        return (Vec::new(), keep);
    }

    let budget = clamp(
        max_unavailable(nodeset, replicas) - unavailable_new,
        0,
        available_old.len() as i32,
    );
    let (mut victims, rest) = split_active_pods(available_old, i64::from(budget));
    keep.extend(rest);
    forced.append(&mut victims);
    (forced, keep)
}

impl NodeSetReconciler {
    /// Replace old-revision pods within the unavailability budget.
    pub(crate) async fn sync_update(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<Pod>],
        hash: &str,
    ) -> SyncResult<()> {
        if nodeset.spec.update_strategy.strategy_type != UpdateStrategyType::RollingUpdate
            || is_paused(nodeset)
        {
            return Ok(());
        }

        let replicas = self.replicas_wanted(nodeset).await?;
        let (victims, _) = split_update_pods(nodeset, pods, hash, replicas);
        if victims.is_empty() {
            return Ok(());
        }
        info!(delete = victims.len(), "Scale-in pods for rolling update");
        self.scale_in(nodeset, &victims, &[]).await
    }
}
