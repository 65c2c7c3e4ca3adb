//! Pod ownership: adopt matching orphans, release pods that no longer match.

use std::sync::Arc;

use tracing::{debug, info};

use super::controller::{NodeSetReconciler, SyncError, SyncResult};
use super::utils::is_pod_from_nodeset;
use crate::api::{NodeSet, OwnerReference, Pod, Resource};
use crate::store::retry_on_conflict;

impl NodeSetReconciler {
    /// Fresh read guarding adoption: the NodeSet must still be the same
    /// object and must not be going away.
    pub(crate) async fn can_adopt(&self, nodeset: &NodeSet, kind: &'static str) -> SyncResult<()> {
        let fresh = self.store.nodesets().get(&nodeset.key()).await?;
        let reason = if fresh.metadata.uid != nodeset.metadata.uid {
            format!(
                "original NodeSet is gone: got uid {}, wanted {}",
                fresh.metadata.uid, nodeset.metadata.uid
            )
        } else if fresh.metadata.is_terminating() {
            "NodeSet is being deleted".to_string()
        } else {
            return Ok(());
        };
        Err(SyncError::CannotAdopt {
            kind,
            nodeset: nodeset.key().to_string(),
            reason,
        })
    }

    /// The pods this NodeSet owns after adopting and releasing.
    ///
    /// All pods in the namespace are considered so that owned pods whose
    /// labels drifted are released instead of leaking.
    pub(crate) async fn claim_pods(&self, nodeset: &NodeSet) -> SyncResult<Vec<Arc<Pod>>> {
        let uid = nodeset.metadata.uid.as_str();
        let pods = self.store.pods().list(&nodeset.metadata.namespace).await?;

        let mut claimed = Vec::new();
        let mut errors = Vec::new();
        let mut adoption_checked = false;

        for pod in pods {
            let matches = nodeset.spec.selector.matches(&pod.metadata.labels)
                && is_pod_from_nodeset(nodeset, &pod);

            match pod.metadata.controller_ref() {
                Some(owner) if owner.uid != uid => continue,
                Some(_) if matches => claimed.push(pod),
                Some(_) => {
                    if nodeset.metadata.is_terminating() {
                        continue;
                    }
                    if let Err(err) = self.release_pod(nodeset, &pod).await {
                        errors.push(err);
                    }
                }
                None => {
                    if !matches || nodeset.metadata.is_terminating() || pod.is_terminating() {
                        continue;
                    }
                    if !adoption_checked {
                        if let Err(err) = self.can_adopt(nodeset, Pod::KIND).await {
                            errors.push(err);
                            break;
                        }
                        adoption_checked = true;
                    }
                    match self.adopt_pod(nodeset, &pod).await {
                        Ok(Some(adopted)) => claimed.push(adopted),
                        Ok(None) => {}
                        Err(err) => errors.push(err),
                    }
                }
            }
        }

        SyncError::collect(errors)?;
        Ok(claimed)
    }

    async fn adopt_pod(&self, nodeset: &NodeSet, pod: &Pod) -> SyncResult<Option<Arc<Pod>>> {
        let result = retry_on_conflict(self.store.pods(), &pod.key(), false, |p| {
            if p.metadata.controller_ref().is_some() {
                return false;
            }
            p.metadata
                .owner_references
                .push(OwnerReference::controller_for(nodeset));
            true
        })
        .await;

        match result {
            Ok(adopted) if adopted.metadata.is_controlled_by(&nodeset.metadata.uid) => {
                info!(pod = %pod.metadata.name, nodeset = %nodeset.key(), "Adopted orphan pod");
                Ok(Some(adopted))
            }
            Ok(_) => Ok(None),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn release_pod(&self, nodeset: &NodeSet, pod: &Pod) -> SyncResult<()> {
        let uid = nodeset.metadata.uid.as_str();
        let result = retry_on_conflict(self.store.pods(), &pod.key(), false, |p| {
            if !p.metadata.has_owner(uid) {
                return false;
            }
            p.metadata.owner_references.retain(|o| o.uid != uid);
            true
        })
        .await;

        match result {
            Ok(_) => {
                debug!(pod = %pod.metadata.name, nodeset = %nodeset.key(), "Released pod");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LabelSelector;
    use crate::events::MemoryRecorder;
    use crate::nodeset::utils::new_nodeset_pod;
    use crate::slurm::ClientMap;
    use crate::slurmcontrol::RealSlurmControl;
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStore;

    async fn fixture() -> (Arc<MemoryStore>, NodeSetReconciler, NodeSet) {
        let store = Arc::new(MemoryStore::new());
        let reconciler = NodeSetReconciler::new(
            store.clone(),
            Arc::new(RealSlurmControl::new(Arc::new(ClientMap::new()))),
            Arc::new(MemoryRecorder::new()),
        );
        let mut nodeset = NodeSet::default();
        nodeset.metadata.name = "compute".into();
        nodeset.metadata.namespace = "slurm".into();
        nodeset.spec.selector = LabelSelector::from_labels([("app", "slurmd")]);
        let created = store.nodesets().create(&nodeset).await.unwrap();
        (store, reconciler, (*created).clone())
    }

    #[tokio::test]
    async fn test_claim_adopts_and_releases() {
        let (store, reconciler, ns) = fixture().await;

        let owned = new_nodeset_pod(&ns, 0, "rev");
        store.pods().create(&owned).await.unwrap();

        let mut orphan = new_nodeset_pod(&ns, 1, "rev");
        orphan.metadata.owner_references.clear();
        store.pods().create(&orphan).await.unwrap();

        let mut drifted = new_nodeset_pod(&ns, 2, "rev");
        drifted.metadata.labels.insert("app".into(), "other".into());
        store.pods().create(&drifted).await.unwrap();

        let mut foreign = new_nodeset_pod(&ns, 3, "rev");
        foreign.metadata.owner_references[0].uid = "someone-else".into();
        store.pods().create(&foreign).await.unwrap();

        let mut claimed: Vec<String> = reconciler
            .claim_pods(&ns)
            .await
            .unwrap()
            .iter()
            .map(|p| p.metadata.name.clone())
            .collect();
        claimed.sort();
        assert_eq!(claimed, vec!["compute-0", "compute-1"]);

        let released = store.pods().get(&drifted.key()).await.unwrap();
        assert!(released.metadata.owner_references.is_empty());
        let adopted = store.pods().get(&orphan.key()).await.unwrap();
        assert!(adopted.metadata.is_controlled_by(&ns.metadata.uid));
    }

    #[tokio::test]
    async fn test_orphan_with_foreign_name_is_ignored() {
        let (store, reconciler, ns) = fixture().await;
        let mut stray = new_nodeset_pod(&ns, 0, "rev");
        stray.metadata.name = "login-0".into();
        stray.metadata.owner_references.clear();
        store.pods().create(&stray).await.unwrap();

        assert!(reconciler.claim_pods(&ns).await.unwrap().is_empty());
        let untouched = store.pods().get(&stray.key()).await.unwrap();
        assert!(untouched.metadata.owner_references.is_empty());
    }
}
