//! Informer event handling.
//!
//! Turns store watch events into queue keys and lowers expectations as the
//! pods a sync asked for show up or go away.

use std::sync::Arc;
use std::time::Duration;

use slinky_reconcile::Expectations;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::utils::{is_pod_from_nodeset, nodeset_key};
use crate::api::{ControllerRevision, Node, NodeSet, ObjectKey, OwnerReference, Pod, Resource};
use crate::store::{ObjectStore, WatchEvent};
use crate::worker::WorkQueue;

/// Routes watch events for pods, revisions, nodes and NodeSets to the queue.
pub struct EventHandler {
    store: Arc<dyn ObjectStore>,
    expectations: Arc<Expectations>,
    queue: Arc<WorkQueue>,
}

impl EventHandler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        expectations: Arc<Expectations>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            store,
            expectations,
            queue,
        }
    }

    fn enqueue(&self, nodeset: &NodeSet) {
        trace!(nodeset = %nodeset.key(), "Enqueue NodeSet");
        self.queue.add(nodeset.key());
    }

    /// Enqueue every known NodeSet.
    pub async fn resync_all(&self) {
        match self.store.nodesets().list("").await {
            Ok(nodesets) => nodesets.iter().for_each(|n| self.enqueue(n)),
            Err(err) => warn!(error = %err, "Failed to list NodeSets for resync"),
        }
    }

    /// The NodeSet an owner reference points at, if it still is that object.
    async fn resolve_controller_ref(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Option<Arc<NodeSet>> {
        if owner.kind != NodeSet::KIND || owner.api_version != NodeSet::API_VERSION {
            return None;
        }
        let nodeset = self
            .store
            .nodesets()
            .get(&ObjectKey::new(namespace, &owner.name))
            .await
            .ok()?;
        (nodeset.metadata.uid == owner.uid).then_some(nodeset)
    }

    async fn owning_nodeset(&self, pod: &Pod) -> Option<Arc<NodeSet>> {
        let owner = pod.metadata.controller_ref()?;
        self.resolve_controller_ref(&pod.metadata.namespace, owner)
            .await
    }

    /// NodeSets whose selector matches the labels, filtered further by
    /// `accept`.
    async fn matching_nodesets<F>(
        &self,
        namespace: &str,
        labels: &std::collections::BTreeMap<String, String>,
        accept: F,
    ) -> Vec<Arc<NodeSet>>
    where
        F: Fn(&NodeSet) -> bool,
    {
        match self.store.nodesets().list(namespace).await {
            Ok(nodesets) => nodesets
                .into_iter()
                .filter(|n| !n.spec.selector.is_empty() && n.spec.selector.matches(labels))
                .filter(|n| accept(n))
                .collect(),
            Err(err) => {
                warn!(error = %err, namespace, "Failed to list NodeSets");
                Vec::new()
            }
        }
    }

    async fn enqueue_orphan(&self, pod: &Pod) {
        let nodesets = self
            .matching_nodesets(&pod.metadata.namespace, &pod.metadata.labels, |n| {
                is_pod_from_nodeset(n, pod)
            })
            .await;
        for nodeset in nodesets {
            self.enqueue(&nodeset);
        }
    }

    pub async fn on_pod(&self, event: WatchEvent<Pod>) {
        match event {
            WatchEvent::Added(pod) => self.add_pod(&pod).await,
            WatchEvent::Modified { old, new } => self.update_pod(&old, &new).await,
            WatchEvent::Deleted(pod) => self.delete_pod(&pod).await,
        }
    }

    async fn add_pod(&self, pod: &Pod) {
        if pod.is_terminating() {
            // restarted informer saw a pod already on its way out
            self.delete_pod(pod).await;
            return;
        }

        if pod.metadata.controller_ref().is_some() {
            if let Some(nodeset) = self.owning_nodeset(pod).await {
                debug!(pod = %pod.key(), nodeset = %nodeset.key(), "Pod created");
                self.expectations.creation_observed(&nodeset_key(&nodeset));
                self.enqueue(&nodeset);
            }
            return;
        }

        self.enqueue_orphan(pod).await;
    }

    async fn update_pod(&self, old: &Pod, new: &Pod) {
        if old.metadata.resource_version == new.metadata.resource_version {
            return;
        }

        let labels_changed = old.metadata.labels != new.metadata.labels;
        let old_ref = old.metadata.controller_ref();
        let new_ref = new.metadata.controller_ref();
        let controller_changed = old_ref.map(|r| &r.uid) != new_ref.map(|r| &r.uid);

        if new.is_terminating() {
            self.delete_pod(new).await;
            if controller_changed {
                if let Some(owner) = old_ref {
                    if let Some(nodeset) = self
                        .resolve_controller_ref(&old.metadata.namespace, owner)
                        .await
                    {
                        self.delete_pod_for(&nodeset, old);
                    }
                }
            }
            return;
        }

        if controller_changed {
            if let Some(owner) = old_ref {
                if let Some(nodeset) = self
                    .resolve_controller_ref(&old.metadata.namespace, owner)
                    .await
                {
                    self.enqueue(&nodeset);
                }
            }
        }

        if new_ref.is_some() {
            let Some(nodeset) = self.owning_nodeset(new).await else {
                return;
            };
            trace!(pod = %new.key(), nodeset = %nodeset.key(), "Pod updated");
            self.enqueue(&nodeset);

            let min_ready = nodeset.spec.min_ready_seconds;
            if !old.is_ready() && new.is_ready() && min_ready > 0 {
                // availability flips without another pod event
                let delay = Duration::from_secs(min_ready as u64) + Duration::from_secs(1);
                self.queue.add_after(nodeset.key(), delay);
            }
            return;
        }

        if labels_changed || controller_changed {
            self.enqueue_orphan(new).await;
        }
    }

    fn delete_pod_for(&self, nodeset: &NodeSet, pod: &Pod) {
        self.expectations
            .deletion_observed(&nodeset_key(nodeset), &pod.key().to_string());
        self.enqueue(nodeset);
    }

    async fn delete_pod(&self, pod: &Pod) {
        if let Some(nodeset) = self.owning_nodeset(pod).await {
            debug!(pod = %pod.key(), nodeset = %nodeset.key(), "Pod deleted");
            self.delete_pod_for(&nodeset, pod);
        }
    }

    pub async fn on_revision(&self, event: WatchEvent<ControllerRevision>) {
        let (revision, removed) = match event {
            WatchEvent::Added(r) => (r, false),
            WatchEvent::Modified { new, .. } => (new, false),
            WatchEvent::Deleted(r) => (r, true),
        };

        if let Some(owner) = revision.metadata.controller_ref() {
            if let Some(nodeset) = self
                .resolve_controller_ref(&revision.metadata.namespace, owner)
                .await
            {
                self.enqueue(&nodeset);
            }
            return;
        }
        if removed {
            return;
        }
        let nodesets = self
            .matching_nodesets(
                &revision.metadata.namespace,
                &revision.metadata.labels,
                |_| true,
            )
            .await;
        for nodeset in nodesets {
            self.enqueue(&nodeset);
        }
    }

    /// Cluster nodes only matter to NodeSets sized by node eligibility.
    pub async fn on_node(&self, event: WatchEvent<Node>) {
        if let WatchEvent::Modified { old, new } = &event {
            if old.metadata.labels == new.metadata.labels && old.spec == new.spec {
                return;
            }
        }
        match self.store.nodesets().list("").await {
            Ok(nodesets) => nodesets
                .iter()
                .filter(|n| n.spec.replicas.is_none())
                .for_each(|n| self.enqueue(n)),
            Err(err) => warn!(error = %err, "Failed to list NodeSets for node event"),
        }
    }

    pub async fn on_nodeset(&self, event: WatchEvent<NodeSet>) {
        match event {
            WatchEvent::Added(nodeset) | WatchEvent::Modified { new: nodeset, .. } => {
                self.enqueue(&nodeset)
            }
            WatchEvent::Deleted(nodeset) => {
                self.expectations.delete(&nodeset_key(&nodeset));
                self.enqueue(&nodeset);
            }
        }
    }

    /// Feed every watch stream into the handler until shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            pump("nodesets", self.store.nodesets().watch(), Arc::clone(&self), shutdown.clone(), |h, e| {
                Box::pin(async move { h.on_nodeset(e).await })
            }),
            pump("pods", self.store.pods().watch(), Arc::clone(&self), shutdown.clone(), |h, e| {
                Box::pin(async move { h.on_pod(e).await })
            }),
            pump("revisions", self.store.revisions().watch(), Arc::clone(&self), shutdown.clone(), |h, e| {
                Box::pin(async move { h.on_revision(e).await })
            }),
            pump("nodes", self.store.nodes().watch(), self, shutdown, |h, e| {
                Box::pin(async move { h.on_node(e).await })
            }),
        ]
    }
}

type HandlerFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

fn pump<T, F>(
    stream: &'static str,
    mut events: broadcast::Receiver<WatchEvent<T>>,
    handler: Arc<EventHandler>,
    mut shutdown: watch::Receiver<bool>,
    dispatch: F,
) -> JoinHandle<()>
where
    T: Resource,
    F: Fn(Arc<EventHandler>, WatchEvent<T>) -> HandlerFuture + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => dispatch(Arc::clone(&handler), event).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(stream, missed, "Watch stream lagged, resyncing all NodeSets");
                        handler.resync_all().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(stream, "Watch pump stopped");
    })
}
