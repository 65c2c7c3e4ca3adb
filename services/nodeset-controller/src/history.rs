//! Controller revision history.
//!
//! A revision snapshots a NodeSet's pod template so pods can be compared
//! against the template they were created from. Revision names are
//! `<nodeset>-<hash>`; a hash collision with different content is resolved
//! by bumping the NodeSet's collision count and rehashing.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use slinky_reconcile::hash_revision;
use tracing::{debug, info};

use crate::api::keys::LABEL_REVISION_HASH;
use crate::api::{ControllerRevision, NodeSet, ObjectMeta, OwnerReference, Resource};
use crate::nodeset::utils::get_patch;
use crate::store::{retry_on_conflict, ObjectStore, StoreError, StoreResult};

/// Longest name prefix kept before the hash suffix.
const MAX_PREFIX_LEN: usize = 223;

pub fn revision_name(parent: &str, hash: &str) -> String {
    let prefix = match parent.char_indices().nth(MAX_PREFIX_LEN) {
        Some((end, _)) => &parent[..end],
        None => parent,
    };
    format!("{prefix}-{hash}")
}

/// The hash label carried by a revision.
pub fn revision_label(revision: &ControllerRevision) -> &str {
    revision
        .metadata
        .labels
        .get(LABEL_REVISION_HASH)
        .map(String::as_str)
        .unwrap_or_default()
}

/// Build an unsaved revision of the NodeSet's current template.
pub fn new_revision(nodeset: &NodeSet, revision: i64, collision_count: i32) -> ControllerRevision {
    let data = get_patch(nodeset);
    let hash = hash_revision(&data, Some(collision_count));

    let mut labels = nodeset.spec.template.metadata.labels.clone();
    labels.insert(LABEL_REVISION_HASH.into(), hash.clone());

    ControllerRevision {
        metadata: ObjectMeta {
            name: revision_name(&nodeset.metadata.name, &hash),
            namespace: nodeset.metadata.namespace.clone(),
            labels,
            annotations: nodeset.metadata.annotations.clone(),
            owner_references: vec![OwnerReference::controller_for(nodeset)],
            ..Default::default()
        },
        data,
        revision,
    }
}

/// Same template content.
pub fn equal_revision(a: &ControllerRevision, b: &ControllerRevision) -> bool {
    a.data == b.data
}

/// Revisions with the same content as `needle`, in input order.
pub fn find_equal_revisions<'a>(
    revisions: &'a [Arc<ControllerRevision>],
    needle: &ControllerRevision,
) -> Vec<&'a Arc<ControllerRevision>> {
    revisions
        .iter()
        .filter(|r| equal_revision(r, needle))
        .collect()
}

fn compare_revisions(a: &ControllerRevision, b: &ControllerRevision) -> Ordering {
    a.revision
        .cmp(&b.revision)
        .then_with(|| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// Oldest first.
pub fn sort_revisions(revisions: &mut [Arc<ControllerRevision>]) {
    revisions.sort_by(|a, b| compare_revisions(a, b));
}

/// One past the newest revision, or 1 for an empty history. Expects sorted
/// input.
pub fn next_revision(revisions: &[Arc<ControllerRevision>]) -> i64 {
    revisions.last().map_or(1, |r| r.revision + 1)
}

/// Revision storage for one owner kind.
#[async_trait]
pub trait HistoryControl: Send + Sync {
    /// Revisions matching the selector that are owned by the NodeSet or by
    /// nobody.
    async fn list_revisions(&self, nodeset: &NodeSet) -> StoreResult<Vec<Arc<ControllerRevision>>>;

    /// Create `revision`, renaming it on collisions. `collision_count` is
    /// bumped for every collision with different content.
    async fn create_revision(
        &self,
        nodeset: &NodeSet,
        revision: &ControllerRevision,
        collision_count: &mut i32,
    ) -> StoreResult<Arc<ControllerRevision>>;

    /// Set the revision number, retrying on conflict.
    async fn update_revision(
        &self,
        revision: &ControllerRevision,
        new_revision: i64,
    ) -> StoreResult<Arc<ControllerRevision>>;

    async fn delete_revision(&self, revision: &ControllerRevision) -> StoreResult<()>;

    /// Take controller ownership of an orphan revision.
    async fn adopt_revision(
        &self,
        nodeset: &NodeSet,
        revision: &ControllerRevision,
    ) -> StoreResult<Arc<ControllerRevision>>;

    /// Drop the NodeSet's owner reference. Returns `None` when the revision
    /// is gone or was not ours.
    async fn release_revision(
        &self,
        nodeset: &NodeSet,
        revision: &ControllerRevision,
    ) -> StoreResult<Option<Arc<ControllerRevision>>>;
}

/// [`HistoryControl`] over the object store.
pub struct RealHistory {
    store: Arc<dyn ObjectStore>,
}

impl RealHistory {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HistoryControl for RealHistory {
    async fn list_revisions(&self, nodeset: &NodeSet) -> StoreResult<Vec<Arc<ControllerRevision>>> {
        let selected = self
            .store
            .revisions()
            .list_selected(&nodeset.metadata.namespace, &nodeset.spec.selector)
            .await?;
        Ok(selected
            .into_iter()
            .filter(|r| {
                r.metadata
                    .controller_ref()
                    .is_none_or(|owner| owner.uid == nodeset.metadata.uid)
            })
            .collect())
    }

    async fn create_revision(
        &self,
        nodeset: &NodeSet,
        revision: &ControllerRevision,
        collision_count: &mut i32,
    ) -> StoreResult<Arc<ControllerRevision>> {
        loop {
            let hash = hash_revision(&revision.data, Some(*collision_count));
            let mut candidate = revision.clone();
            candidate.metadata.name = revision_name(&nodeset.metadata.name, &hash);
            candidate.metadata.namespace = nodeset.metadata.namespace.clone();
            candidate
                .metadata
                .labels
                .insert(LABEL_REVISION_HASH.into(), hash);

            match self.store.revisions().create(&candidate).await {
                Err(err) if err.is_already_exists() => {
                    let existing = self.store.revisions().get(&candidate.key()).await?;
                    if equal_revision(&existing, &candidate) {
                        return Ok(existing);
                    }
                    *collision_count += 1;
                    debug!(
                        revision = %candidate.metadata.name,
                        collision_count = *collision_count,
                        "Revision name collision"
                    );
                }
                result => return result,
            }
        }
    }

    async fn update_revision(
        &self,
        revision: &ControllerRevision,
        new_revision: i64,
    ) -> StoreResult<Arc<ControllerRevision>> {
        retry_on_conflict(self.store.revisions(), &revision.key(), false, |r| {
            if r.revision == new_revision {
                return false;
            }
            r.revision = new_revision;
            true
        })
        .await
    }

    async fn delete_revision(&self, revision: &ControllerRevision) -> StoreResult<()> {
        self.store.revisions().delete(&revision.key()).await
    }

    async fn adopt_revision(
        &self,
        nodeset: &NodeSet,
        revision: &ControllerRevision,
    ) -> StoreResult<Arc<ControllerRevision>> {
        let adopted = retry_on_conflict(self.store.revisions(), &revision.key(), false, |r| {
            if r.metadata.controller_ref().is_some() {
                return false;
            }
            r.metadata
                .owner_references
                .push(OwnerReference::controller_for(nodeset));
            true
        })
        .await?;

        if !adopted.metadata.is_controlled_by(&nodeset.metadata.uid) {
            return Err(StoreError::Invalid {
                kind: ControllerRevision::KIND,
                key: adopted.key().to_string(),
                reason: "owned by another controller".into(),
            });
        }
        info!(revision = %adopted.metadata.name, nodeset = %nodeset.key(), "Adopted orphan revision");
        Ok(adopted)
    }

    async fn release_revision(
        &self,
        nodeset: &NodeSet,
        revision: &ControllerRevision,
    ) -> StoreResult<Option<Arc<ControllerRevision>>> {
        let uid = nodeset.metadata.uid.as_str();
        let result = retry_on_conflict(self.store.revisions(), &revision.key(), false, |r| {
            if !r.metadata.has_owner(uid) {
                return false;
            }
            r.metadata.owner_references.retain(|o| o.uid != uid);
            true
        })
        .await;

        match result {
            Ok(released) if released.metadata.has_owner(uid) => Ok(None),
            Ok(released) => Ok(Some(released)),
            Err(StoreError::NotFound { .. } | StoreError::Invalid { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}
