//! NodeSet reconciler.
//!
//! One call to [`NodeSetReconciler::sync`] moves a single NodeSet one step
//! closer to its desired state:
//! - adopt and reconcile revision history
//! - claim the pods that belong to the set
//! - when no earlier mutation is still in flight, propagate scheduler
//!   state, scale the fleet and roll out template changes
//! - always write status, even after failures

use std::sync::Arc;
use std::time::{Duration, Instant};

use slinky_reconcile::{Backoff, DurationStore, Expectations, Reduce};
use tracing::{debug, info, instrument, warn};

use super::revision::RevisionSet;
use super::utils::nodeset_key;
use crate::api::{NodeSet, ObjectKey};
use crate::events::{Event, EventRecorder, EventType, REASON_SELECTING_ALL};
use crate::history::{revision_label, HistoryControl, RealHistory};
use crate::podcontrol::{PodControl, RealPodControl};
use crate::slurm::SlurmError;
use crate::slurmcontrol::SlurmControl;
use crate::store::{ObjectStore, StoreError};

/// Result type for reconcile steps.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised while syncing a NodeSet.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Slurm(#[from] SlurmError),

    #[error("cannot adopt {kind} for NodeSet {nodeset}: {reason}")]
    CannotAdopt {
        kind: &'static str,
        nodeset: String,
        reason: String,
    },

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<SyncError>),
}

fn join_errors(errors: &[SyncError]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

impl SyncError {
    /// Fold collected step errors into one result.
    pub fn collect(mut errors: Vec<SyncError>) -> SyncResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SyncError::Aggregate(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Store(err) => err.is_not_found(),
            SyncError::Slurm(err) => err.is_tolerated(),
            _ => false,
        }
    }
}

/// Statistics from one reconcile, for logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncStats {
    pub requeue_after: Option<Duration>,
    pub elapsed: Duration,
}

/// Reconciles NodeSets against the object store and the Slurm cluster.
pub struct NodeSetReconciler {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) history: Arc<dyn HistoryControl>,
    pub(crate) pod_control: Arc<dyn PodControl>,
    pub(crate) slurm: Arc<dyn SlurmControl>,
    pub(crate) recorder: Arc<dyn EventRecorder>,
    pub(crate) expectations: Arc<Expectations>,
    pub(crate) requeue: Arc<DurationStore>,
    pub(crate) failed_pods_backoff: Arc<Backoff>,
}

impl NodeSetReconciler {
    /// Build a reconciler with the store-backed history and pod control.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        slurm: Arc<dyn SlurmControl>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            history: Arc::new(RealHistory::new(Arc::clone(&store))),
            pod_control: Arc::new(RealPodControl::new(
                Arc::clone(&store),
                Arc::clone(&recorder),
            )),
            store,
            slurm,
            recorder,
            expectations: Arc::new(Expectations::default()),
            requeue: Arc::new(DurationStore::new(Reduce::Greater)),
            failed_pods_backoff: Arc::new(Backoff::default()),
        }
    }

    pub fn with_expectations(mut self, expectations: Arc<Expectations>) -> Self {
        self.expectations = expectations;
        self
    }

    pub fn with_backoff(mut self, backoff: Arc<Backoff>) -> Self {
        self.failed_pods_backoff = backoff;
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryControl>) -> Self {
        self.history = history;
        self
    }

    pub fn with_pod_control(mut self, pod_control: Arc<dyn PodControl>) -> Self {
        self.pod_control = pod_control;
        self
    }

    /// Shared with the informer handlers, which lower it as pods appear
    /// and disappear.
    pub fn expectations(&self) -> Arc<Expectations> {
        Arc::clone(&self.expectations)
    }

    /// The failed-pod backoff, for periodic GC.
    pub fn backoff(&self) -> Arc<Backoff> {
        Arc::clone(&self.failed_pods_backoff)
    }

    /// Run one sync and return when the key should be revisited.
    pub async fn reconcile(&self, key: &ObjectKey) -> SyncResult<SyncStats> {
        let started = Instant::now();
        let hint_key = key.to_string();
        let _ = self.requeue.pop(&hint_key);

        let result = self.sync(key).await;

        let requeue = self.requeue.pop(&hint_key);
        let stats = SyncStats {
            requeue_after: (!requeue.is_zero()).then_some(requeue),
            elapsed: started.elapsed(),
        };
        match &result {
            Ok(()) => info!(
                nodeset = %key,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                requeue_after_ms = stats.requeue_after.map(|d| d.as_millis() as u64),
                "Finished syncing NodeSet"
            ),
            Err(err) => warn!(
                nodeset = %key,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                error = %err,
                "Finished syncing NodeSet with errors"
            ),
        }
        result.map(|()| stats)
    }

    /// Sync the NodeSet stored under `key`.
    #[instrument(skip(self), fields(nodeset = %key))]
    pub async fn sync(&self, key: &ObjectKey) -> SyncResult<()> {
        let nodeset = match self.store.nodesets().get(key).await {
            Ok(nodeset) => nodeset,
            Err(err) if err.is_not_found() => {
                debug!("NodeSet has been deleted");
                self.expectations.delete(&key.to_string());
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let nodeset: &NodeSet = &nodeset;
        let set_key = nodeset_key(nodeset);

        if nodeset.spec.selector.is_empty() {
            self.recorder
                .record(Event::new(
                    nodeset,
                    EventType::Warning,
                    REASON_SELECTING_ALL,
                    "This NodeSet is selecting all pods. A non-empty selector is required.",
                ))
                .await;
            return Ok(());
        }

        self.adopt_orphan_revisions(nodeset).await?;
        let revisions = self.history.list_revisions(nodeset).await?;
        let revisions = self.get_revisions(nodeset, revisions).await?;
        let hash = revision_label(&revisions.update).to_string();
        let pods = self.claim_pods(nodeset).await?;

        let mut errors = Vec::new();
        if self.expectations.satisfied(&set_key) && !nodeset.metadata.is_terminating() {
            self.sync_steps(nodeset, &pods, &hash, &revisions, &mut errors)
                .await;
        } else {
            debug!(
                terminating = nodeset.metadata.is_terminating(),
                "Skipping mutations, refreshing status only"
            );
        }

        if let Err(err) = self.sync_status(nodeset, &pods, &revisions).await {
            errors.push(err);
        }
        SyncError::collect(errors)
    }

    async fn sync_steps(
        &self,
        nodeset: &NodeSet,
        pods: &[Arc<crate::api::Pod>],
        hash: &str,
        revisions: &RevisionSet,
        errors: &mut Vec<SyncError>,
    ) {
        if let Err(err) = self.sync_pods(nodeset, pods, hash).await {
            errors.push(err);
            return;
        }
        if !self.expectations.satisfied(&nodeset_key(nodeset)) {
            return;
        }
        if let Err(err) = self.sync_update(nodeset, pods, hash).await {
            errors.push(err);
            return;
        }
        if let Err(err) = self.truncate_history(nodeset, revisions, pods).await {
            warn!(error = %err, "Failed to clean up revisions");
            errors.push(err);
        }
    }
}
