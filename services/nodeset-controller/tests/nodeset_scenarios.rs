//! End-to-end NodeSet scenarios against the in-memory store and the fake
//! Slurm scheduler.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use slinky_nodeset_controller::api::keys::ANNOTATION_POD_CORDON;
use slinky_nodeset_controller::api::workload::POD_READY;
use slinky_nodeset_controller::api::{
    ConditionStatus, Container, LabelSelector, Node, NodeSet, ObjectKey, ObjectReference, Pod,
    PodCondition, PodPhase, RollingUpdate,
};
use slinky_nodeset_controller::events::MemoryRecorder;
use slinky_nodeset_controller::nodeset::{EventHandler, NodeSetReconciler};
use slinky_nodeset_controller::slurm::fake::FakeClient;
use slinky_nodeset_controller::slurm::{ClientMap, Node as SlurmNode, NodeState};
use slinky_nodeset_controller::slurmcontrol::RealSlurmControl;
use slinky_nodeset_controller::store::memory::MemoryStore;
use slinky_nodeset_controller::store::{ObjectStore, WatchEvent};
use slinky_nodeset_controller::worker::WorkQueue;
use slinky_reconcile::IntOrPercent;
use tokio::sync::broadcast;

struct Harness {
    store: Arc<MemoryStore>,
    slurm: Arc<FakeClient>,
    recorder: Arc<MemoryRecorder>,
    reconciler: NodeSetReconciler,
    handler: EventHandler,
    pod_events: broadcast::Receiver<WatchEvent<Pod>>,
    key: ObjectKey,
}

impl Harness {
    async fn new(replicas: Option<i32>) -> Self {
        let store = Arc::new(MemoryStore::new());
        let pod_events = store.pods().watch();
        let slurm = Arc::new(FakeClient::new());
        let clients = Arc::new(ClientMap::new());
        clients.add(ObjectKey::new("slurm", "slurm"), slurm.clone());
        let recorder = Arc::new(MemoryRecorder::new());
        let reconciler = NodeSetReconciler::new(
            store.clone(),
            Arc::new(RealSlurmControl::new(clients)),
            recorder.clone(),
        );
        let handler = EventHandler::new(
            store.clone(),
            reconciler.expectations(),
            Arc::new(WorkQueue::new()),
        );

        let mut nodeset = NodeSet::default();
        nodeset.metadata.name = "compute".into();
        nodeset.metadata.namespace = "slurm".into();
        nodeset.spec.controller_ref = ObjectReference {
            namespace: "slurm".into(),
            name: "slurm".into(),
        };
        nodeset.spec.replicas = replicas;
        nodeset.spec.selector = LabelSelector::from_labels([("app", "slurmd")]);
        nodeset
            .spec
            .template
            .metadata
            .labels
            .insert("app".into(), "slurmd".into());
        nodeset.spec.template.spec.containers.push(Container {
            name: "slurmd".into(),
            image: "slurmd:24.11".into(),
            ..Default::default()
        });
        let created = store.nodesets().create(&nodeset).await.unwrap();

        Self {
            store,
            slurm,
            recorder,
            reconciler,
            handler,
            pod_events,
            key: created.metadata.key(),
        }
    }

    /// Deliver pending pod events, as the informer would between syncs.
    async fn pump(&mut self) {
        while let Ok(event) = self.pod_events.try_recv() {
            self.handler.on_pod(event).await;
        }
    }

    async fn sync(&mut self) {
        self.reconciler.sync(&self.key).await.unwrap();
        self.pump().await;
    }

    async fn nodeset(&self) -> Arc<NodeSet> {
        self.store.nodesets().get(&self.key).await.unwrap()
    }

    async fn edit(&self, f: impl FnOnce(&mut NodeSet)) {
        let mut nodeset = (*self.nodeset().await).clone();
        f(&mut nodeset);
        self.store.nodesets().update(&nodeset).await.unwrap();
    }

    async fn pods(&self) -> Vec<Arc<Pod>> {
        self.store.pods().list("slurm").await.unwrap()
    }

    async fn pod_names(&self) -> Vec<String> {
        self.pods()
            .await
            .iter()
            .map(|p| p.metadata.name.clone())
            .collect()
    }

    /// Make every pod running and ready, registered in Slurm as IDLE.
    async fn bring_up(&mut self) {
        for pod in self.pods().await {
            self.slurm
                .put_node(SlurmNode::new(pod.spec.hostname.clone(), &[NodeState::Idle]));
            if pod.is_running_and_ready() {
                continue;
            }
            let mut up = (*pod).clone();
            up.status.phase = PodPhase::Running;
            up.status.conditions.push(PodCondition {
                condition_type: POD_READY.into(),
                status: ConditionStatus::True,
                last_transition_time: Some(Utc::now() - ChronoDuration::minutes(5)),
                ..Default::default()
            });
            self.store.pods().update_status(&up).await.unwrap();
        }
        self.pump().await;
    }

    fn settled(&self) -> bool {
        self.reconciler
            .expectations()
            .satisfied(&self.key.to_string())
    }
}

fn is_cordoned(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .get(ANNOTATION_POD_CORDON)
        .is_some_and(|v| v == "true")
}

#[tokio::test]
async fn test_replicas_converge_to_ordinals() {
    let mut h = Harness::new(Some(2)).await;
    h.sync().await;
    assert_eq!(h.pod_names().await, vec!["compute-0", "compute-1"]);
    assert!(h.settled());

    // status reflects the pods claimed at the start of a sync
    h.sync().await;
    let status = h.nodeset().await.status.clone();
    assert_eq!(status.replicas, 2);
    assert_eq!(status.updated_replicas, 2);
    assert_eq!(status.selector, "app=slurmd");
}

#[tokio::test]
async fn test_unset_replicas_follow_eligible_nodes() {
    let mut h = Harness::new(None).await;
    h.sync().await;
    assert!(h.pods().await.is_empty());
    assert!(h.recorder.reasons().contains(&"FailedPlacement".to_string()));

    for name in ["kube-1", "kube-2", "kube-3"] {
        let mut node = Node::default();
        node.metadata.name = name.into();
        h.store.nodes().create(&node).await.unwrap();
    }
    h.sync().await;
    assert_eq!(h.pod_names().await.len(), 3);
}

#[tokio::test]
async fn test_scale_in_drains_before_delete() {
    let mut h = Harness::new(Some(2)).await;
    h.sync().await;
    h.bring_up().await;
    h.sync().await;
    assert_eq!(h.pods().await.len(), 2);

    h.edit(|n| n.spec.replicas = Some(0)).await;
    h.sync().await;

    // cordoned and draining, nothing deleted yet
    let pods = h.pods().await;
    assert_eq!(pods.len(), 2);
    assert!(pods.iter().all(|p| is_cordoned(p)));
    for name in ["compute-0", "compute-1"] {
        let node = h.slurm.node(name).unwrap();
        assert!(node.has(NodeState::Idle) && node.has(NodeState::Drain));
    }
    assert!(h.settled());

    h.sync().await;
    assert!(h.pods().await.is_empty());
    assert!(h.settled());
    let deletes = h
        .recorder
        .reasons()
        .iter()
        .filter(|r| r.as_str() == "SuccessfulDelete")
        .count();
    assert_eq!(deletes, 2);
}

#[tokio::test]
async fn test_busy_node_holds_scale_in() {
    let mut h = Harness::new(Some(1)).await;
    h.sync().await;
    h.bring_up().await;
    h.slurm.set_state("compute-0", &[NodeState::Allocated]);

    h.edit(|n| n.spec.replicas = Some(0)).await;
    h.sync().await;
    h.sync().await;

    assert_eq!(h.pod_names().await, vec!["compute-0"]);
    let node = h.slurm.node("compute-0").unwrap();
    assert!(node.has(NodeState::Drain));
}

#[tokio::test]
async fn test_rolling_update_respects_budget() {
    let mut h = Harness::new(Some(4)).await;
    h.edit(|n| {
        n.spec.update_strategy.rolling_update = Some(RollingUpdate {
            max_unavailable: Some(IntOrPercent::Int(1)),
            ..Default::default()
        })
    })
    .await;
    h.sync().await;
    h.bring_up().await;
    h.sync().await;
    let old_hash = h.nodeset().await.status.node_set_hash.clone();

    h.edit(|n| n.spec.template.spec.containers[0].image = "slurmd:25.05".into())
        .await;
    h.sync().await;

    let cordoned: Vec<String> = h
        .pods()
        .await
        .iter()
        .filter(|p| is_cordoned(p))
        .map(|p| p.metadata.name.clone())
        .collect();
    assert_eq!(cordoned.len(), 1);

    h.sync().await;
    let names = h.pod_names().await;
    assert_eq!(names.len(), 3);
    assert!(!names.contains(&cordoned[0]));

    // the freed ordinal comes back on the new revision
    h.sync().await;
    let new_hash = h.nodeset().await.status.node_set_hash.clone();
    assert_ne!(new_hash, old_hash);
    let replaced = h
        .store
        .pods()
        .get(&ObjectKey::new("slurm", cordoned[0].as_str()))
        .await
        .unwrap();
    assert_eq!(
        replaced
            .metadata
            .labels
            .get(slinky_nodeset_controller::api::keys::LABEL_REVISION_HASH),
        Some(&new_hash)
    );
}

#[tokio::test]
async fn test_revert_reuses_revision() {
    let mut h = Harness::new(Some(0)).await;
    h.sync().await;
    let first = h.nodeset().await.status.node_set_hash.clone();

    h.edit(|n| n.spec.template.spec.containers[0].image = "slurmd:25.05".into())
        .await;
    h.sync().await;
    let second = h.nodeset().await.status.node_set_hash.clone();
    assert_ne!(first, second);

    h.edit(|n| n.spec.template.spec.containers[0].image = "slurmd:24.11".into())
        .await;
    h.sync().await;
    assert_eq!(h.nodeset().await.status.node_set_hash, first);
    assert_eq!(h.store.revision_api().len(), 2);
}

#[tokio::test]
async fn test_converged_fleet_is_not_rewritten() {
    let mut h = Harness::new(Some(2)).await;
    h.sync().await;
    h.bring_up().await;
    h.sync().await;
    h.sync().await;

    let before: Vec<String> = h
        .pods()
        .await
        .iter()
        .map(|p| p.metadata.resource_version.clone())
        .collect();
    h.sync().await;
    let after: Vec<String> = h
        .pods()
        .await
        .iter()
        .map(|p| p.metadata.resource_version.clone())
        .collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_empty_selector_blocks_mutation() {
    let mut h = Harness::new(Some(2)).await;
    h.edit(|n| n.spec.selector = LabelSelector::default()).await;
    h.sync().await;

    assert!(h.pods().await.is_empty());
    assert_eq!(h.recorder.reasons(), vec!["SelectingAll".to_string()]);
}

#[tokio::test]
async fn test_deleted_nodeset_clears_expectations() {
    let mut h = Harness::new(Some(2)).await;
    h.reconciler
        .expectations()
        .expect_creations(&h.key.to_string(), 2);
    h.store.nodesets().delete(&h.key).await.unwrap();

    h.sync().await;
    assert!(h
        .reconciler
        .expectations()
        .pending(&h.key.to_string())
        .is_none());
}

#[tokio::test]
async fn test_failed_pod_is_replaced() {
    let mut h = Harness::new(Some(1)).await;
    h.sync().await;
    h.bring_up().await;

    let mut failed = (*h.pods().await[0]).clone();
    failed.status.phase = PodPhase::Failed;
    h.store.pods().update_status(&failed).await.unwrap();
    h.pump().await;

    h.sync().await;
    assert!(h.pods().await.is_empty());
    assert!(h.recorder.reasons().contains(&"FailedNodeSetPod".to_string()));

    h.sync().await;
    assert_eq!(h.pod_names().await, vec!["compute-0"]);
}
