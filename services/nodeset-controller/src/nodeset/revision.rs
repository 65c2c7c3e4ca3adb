//! Revision history steps of a NodeSet sync.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::controller::{NodeSetReconciler, SyncError, SyncResult};
use super::utils::revision_hash;
use crate::api::keys::LABEL_REVISION_HASH;
use crate::api::{ControllerRevision, NodeSet, Pod, Resource};
use crate::history::{
    find_equal_revisions, new_revision, next_revision, revision_label, sort_revisions,
    equal_revision,
};

/// The revisions one sync works against.
#[derive(Debug, Clone)]
pub struct RevisionSet {
    /// What status last reported as rolled out.
    pub current: Arc<ControllerRevision>,
    /// The NodeSet's template as of now.
    pub update: Arc<ControllerRevision>,
    pub collision_count: i32,
    /// Everything listed before the update revision was resolved, oldest
    /// first.
    pub history: Vec<Arc<ControllerRevision>>,
}

fn names_revision(revision: &ControllerRevision, id: &str) -> bool {
    !id.is_empty() && (revision.metadata.name == id || revision_label(revision) == id)
}

impl NodeSetReconciler {
    /// Label unlabelled revisions and adopt orphans.
    pub(crate) async fn adopt_orphan_revisions(&self, nodeset: &NodeSet) -> SyncResult<()> {
        let revisions = self.history.list_revisions(nodeset).await?;

        let mut orphans = Vec::new();
        for revision in revisions {
            let revision = if revision.metadata.labels.contains_key(LABEL_REVISION_HASH) {
                revision
            } else {
                // the name is unique already, no need to rehash
                let mut labelled = (*revision).clone();
                labelled
                    .metadata
                    .labels
                    .insert(LABEL_REVISION_HASH.into(), labelled.metadata.name.clone());
                self.store.revisions().update(&labelled).await?
            };
            if revision.metadata.controller_ref().is_none() {
                orphans.push(revision);
            }
        }

        if orphans.is_empty() {
            return Ok(());
        }
        self.can_adopt(nodeset, ControllerRevision::KIND).await?;
        for orphan in orphans {
            self.history.adopt_revision(nodeset, &orphan).await?;
        }
        Ok(())
    }

    /// Resolve the current and update revisions, creating or bumping the
    /// update revision as needed.
    pub(crate) async fn get_revisions(
        &self,
        nodeset: &NodeSet,
        mut revisions: Vec<Arc<ControllerRevision>>,
    ) -> SyncResult<RevisionSet> {
        sort_revisions(&mut revisions);
        let mut collision_count = nodeset.status.collision_count.unwrap_or(0);

        let candidate = new_revision(nodeset, next_revision(&revisions), collision_count);
        let equal = find_equal_revisions(&revisions, &candidate)
            .last()
            .map(|r| Arc::clone(r));

        let update = match (equal, revisions.last()) {
            (Some(equal), Some(latest)) if equal_revision(latest, &equal) => Arc::clone(latest),
            (Some(equal), _) => {
                info!(
                    revision = %equal.metadata.name,
                    from = equal.revision,
                    to = candidate.revision,
                    "Rolling back to an earlier revision"
                );
                self.history
                    .update_revision(&equal, candidate.revision)
                    .await?
            }
            (None, _) => {
                let created = self
                    .history
                    .create_revision(nodeset, &candidate, &mut collision_count)
                    .await?;
                debug!(revision = %created.metadata.name, "Created revision");
                created
            }
        };

        let current = revisions
            .iter()
            .find(|r| names_revision(r, &nodeset.status.node_set_hash))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&update));

        Ok(RevisionSet {
            current,
            update,
            collision_count,
            history: revisions,
        })
    }

    /// Delete non-live revisions beyond the history limit, oldest first.
    pub(crate) async fn truncate_history(
        &self,
        nodeset: &NodeSet,
        revisions: &RevisionSet,
        pods: &[Arc<Pod>],
    ) -> SyncResult<()> {
        let mut live: HashSet<&str> = HashSet::new();
        live.insert(&revisions.current.metadata.name);
        live.insert(&revisions.update.metadata.name);
        live.extend(pods.iter().filter_map(|p| revision_hash(p)));

        let history: Vec<&Arc<ControllerRevision>> = revisions
            .history
            .iter()
            .filter(|r| !live.iter().any(|id| names_revision(r, id)))
            .collect();

        let limit = nodeset.revision_history_limit() as usize;
        if history.len() <= limit {
            return Ok(());
        }
        let excess = history.len() - limit;
        for revision in history.into_iter().take(excess) {
            debug!(revision = %revision.metadata.name, "Deleting revision beyond history limit");
            self.history
                .delete_revision(revision)
                .await
                .map_err(SyncError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Container, LabelSelector, ObjectMeta, OwnerReference};
    use crate::events::MemoryRecorder;
    use crate::slurm::ClientMap;
    use crate::slurmcontrol::RealSlurmControl;
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStore;

    fn nodeset(image: &str) -> NodeSet {
        let mut nodeset = NodeSet::default();
        nodeset.metadata.name = "compute".into();
        nodeset.metadata.namespace = "slurm".into();
        nodeset.spec.selector = LabelSelector::from_labels([("app", "slurmd")]);
        nodeset
            .spec
            .template
            .metadata
            .labels
            .insert("app".into(), "slurmd".into());
        nodeset.spec.template.spec.containers.push(Container {
            name: "slurmd".into(),
            image: image.into(),
            ..Default::default()
        });
        nodeset
    }

    async fn fixture(image: &str) -> (Arc<MemoryStore>, NodeSetReconciler, NodeSet) {
        let store = Arc::new(MemoryStore::new());
        let reconciler = NodeSetReconciler::new(
            store.clone(),
            Arc::new(RealSlurmControl::new(Arc::new(ClientMap::new()))),
            Arc::new(MemoryRecorder::new()),
        );
        let created = store.nodesets().create(&nodeset(image)).await.unwrap();
        (store, reconciler, (*created).clone())
    }

    async fn resolve(reconciler: &NodeSetReconciler, nodeset: &NodeSet) -> RevisionSet {
        let listed = reconciler.history.list_revisions(nodeset).await.unwrap();
        reconciler.get_revisions(nodeset, listed).await.unwrap()
    }

    #[tokio::test]
    async fn test_latest_equal_revision_is_reused() {
        let (store, reconciler, ns) = fixture("slurmd:24.11").await;

        let first = resolve(&reconciler, &ns).await;
        let second = resolve(&reconciler, &ns).await;

        assert_eq!(first.update.metadata.name, second.update.metadata.name);
        assert_eq!(second.update.revision, 1);
        assert_eq!(store.revision_api().len(), 1);
        assert_eq!(second.current.metadata.name, second.update.metadata.name);
    }

    #[tokio::test]
    async fn test_older_equal_revision_is_bumped() {
        let (store, reconciler, v1) = fixture("slurmd:24.11").await;
        let first = resolve(&reconciler, &v1).await;

        let mut v2 = v1.clone();
        v2.spec.template.spec.containers[0].image = "slurmd:25.05".into();
        let second = resolve(&reconciler, &v2).await;
        assert_eq!(second.update.revision, 2);

        let rollback = resolve(&reconciler, &v1).await;
        assert_eq!(rollback.update.metadata.name, first.update.metadata.name);
        assert_eq!(rollback.update.revision, 3);
        assert_eq!(store.revision_api().len(), 2);
    }

    #[tokio::test]
    async fn test_current_follows_status_hash() {
        let (_store, reconciler, mut ns) = fixture("slurmd:24.11").await;
        let first = resolve(&reconciler, &ns).await;

        ns.status.node_set_hash = revision_label(&first.update).to_string();
        ns.spec.template.spec.containers[0].image = "slurmd:25.05".into();
        let second = resolve(&reconciler, &ns).await;

        assert_eq!(second.current.metadata.name, first.update.metadata.name);
        assert_ne!(second.update.metadata.name, first.update.metadata.name);
    }

    #[tokio::test]
    async fn test_truncate_keeps_live_revisions() {
        let (store, reconciler, mut ns) = fixture("v0").await;
        ns.spec.revision_history_limit = Some(1);

        let mut pod_hash = String::new();
        for i in 0..4 {
            ns.spec.template.spec.containers[0].image = format!("v{i}");
            let set = resolve(&reconciler, &ns).await;
            if i == 0 {
                pod_hash = revision_label(&set.update).to_string();
            }
        }
        assert_eq!(store.revision_api().len(), 4);

        let mut pod = Pod::default();
        pod.metadata.labels.insert(LABEL_REVISION_HASH.into(), pod_hash.clone());
        let set = resolve(&reconciler, &ns).await;
        reconciler
            .truncate_history(&ns, &set, &[Arc::new(pod)])
            .await
            .unwrap();

        // v0 is live through the pod, v3 is the update, v2 fits the limit
        let left: Vec<String> = store
            .revisions()
            .list("slurm")
            .await
            .unwrap()
            .iter()
            .map(|r| revision_label(r).to_string())
            .collect();
        assert_eq!(left.len(), 3);
        assert!(left.contains(&pod_hash));
    }

    #[tokio::test]
    async fn test_orphans_are_labelled_and_adopted() {
        let (store, reconciler, ns) = fixture("slurmd:24.11").await;
        let orphan = ControllerRevision {
            metadata: ObjectMeta {
                name: "compute-legacy".into(),
                namespace: "slurm".into(),
                labels: [("app".to_string(), "slurmd".to_string())].into(),
                ..Default::default()
            },
            revision: 1,
            ..Default::default()
        };
        store.revisions().create(&orphan).await.unwrap();

        reconciler.adopt_orphan_revisions(&ns).await.unwrap();

        let adopted = store.revisions().get(&orphan.key()).await.unwrap();
        assert_eq!(revision_label(&adopted), "compute-legacy");
        assert!(adopted.metadata.is_controlled_by(&ns.metadata.uid));
    }

    #[tokio::test]
    async fn test_adoption_rechecks_uid() {
        let (store, reconciler, mut ns) = fixture("slurmd:24.11").await;
        let orphan = ControllerRevision {
            metadata: ObjectMeta {
                name: "compute-legacy".into(),
                namespace: "slurm".into(),
                labels: [
                    ("app".to_string(), "slurmd".to_string()),
                    (LABEL_REVISION_HASH.to_string(), "legacy".to_string()),
                ]
                .into(),
                ..Default::default()
            },
            revision: 1,
            ..Default::default()
        };
        store.revisions().create(&orphan).await.unwrap();

        // a stale copy of a NodeSet that has since been recreated
        ns.metadata.uid = "previous".into();
        let err = reconciler.adopt_orphan_revisions(&ns).await.unwrap_err();
        assert!(matches!(err, SyncError::CannotAdopt { .. }));

        let untouched = store.revisions().get(&orphan.key()).await.unwrap();
        assert!(!untouched
            .metadata
            .owner_references
            .iter()
            .any(|o: &OwnerReference| o.is_controller()));
    }
}
