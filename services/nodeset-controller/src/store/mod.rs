//! Object store access.
//!
//! The controller talks to the platform through [`ObjectStore`], a bundle of
//! typed [`Api`] handles. Reads hand out shared `Arc<T>` views; callers clone
//! before mutating. Two implementations exist:
//!
//! - [`memory::MemoryStore`]: in-process, used by tests and local runs
//! - [`kube::KubeStore`]: the Kubernetes REST API

pub mod kube;
pub mod memory;
pub mod patch;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::api::{
    ControllerRevision, LabelSelector, Node, NodeSet, ObjectKey, PersistentVolumeClaim, Pod,
    Resource, Service,
};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by the object store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("conflict writing {kind} {key}: {reason}")]
    Conflict {
        kind: &'static str,
        key: String,
        reason: String,
    },

    #[error("invalid {kind} {key}: {reason}")]
    Invalid {
        kind: &'static str,
        key: String,
        reason: String,
    },

    /// Creation refused because the target namespace is being deleted.
    #[error("cannot create {kind} {key}: namespace is terminating")]
    NamespaceTerminating { kind: &'static str, key: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl StoreError {
    pub fn not_found<R: Resource>(key: &ObjectKey) -> Self {
        StoreError::NotFound {
            kind: R::KIND,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_namespace_terminating(&self) -> bool {
        matches!(self, StoreError::NamespaceTerminating { .. })
    }
}

/// A change observed on one object.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    Added(Arc<T>),
    Modified { old: Arc<T>, new: Arc<T> },
    Deleted(Arc<T>),
}

/// Typed access to one kind.
#[async_trait]
pub trait Api<T: Resource>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Arc<T>>;

    /// All objects in `namespace` (every namespace when empty).
    async fn list(&self, namespace: &str) -> StoreResult<Vec<Arc<T>>>;

    async fn create(&self, obj: &T) -> StoreResult<Arc<T>>;

    /// Replace the object, keeping its status. Fails with a conflict when
    /// `obj` carries a stale resource version.
    async fn update(&self, obj: &T) -> StoreResult<Arc<T>>;

    /// Replace only the status of the object.
    async fn update_status(&self, obj: &T) -> StoreResult<Arc<T>>;

    /// Apply a JSON merge patch.
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> StoreResult<Arc<T>>;

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;

    async fn list_selected(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<Arc<T>>> {
        let all = self.list(namespace).await?;
        Ok(all
            .into_iter()
            .filter(|o| selector.matches(&o.meta().labels))
            .collect())
    }
}

/// Every kind the controller touches.
pub trait ObjectStore: Send + Sync {
    fn nodesets(&self) -> &dyn Api<NodeSet>;
    fn pods(&self) -> &dyn Api<Pod>;
    fn claims(&self) -> &dyn Api<PersistentVolumeClaim>;
    fn services(&self) -> &dyn Api<Service>;
    fn revisions(&self) -> &dyn Api<ControllerRevision>;
    fn nodes(&self) -> &dyn Api<Node>;
}

/// Number of attempts for read-modify-write loops that hit conflicts.
pub const CONFLICT_RETRIES: usize = 5;

/// Re-fetch and re-apply `mutate` until the write succeeds or the conflict
/// budget runs out. `mutate` returns `false` when no write is needed.
pub async fn retry_on_conflict<T, F>(
    api: &dyn Api<T>,
    key: &ObjectKey,
    status_only: bool,
    mut mutate: F,
) -> StoreResult<Arc<T>>
where
    T: Resource,
    F: FnMut(&mut T) -> bool + Send,
{
    let mut last_err = None;
    for _ in 0..CONFLICT_RETRIES {
        let current = api.get(key).await?;
        let mut obj = (*current).clone();
        if !mutate(&mut obj) {
            return Ok(current);
        }
        let result = if status_only {
            api.update_status(&obj).await
        } else {
            api.update(&obj).await
        };
        match result {
            Ok(updated) => return Ok(updated),
            Err(err) if err.is_conflict() => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| StoreError::Conflict {
        kind: T::KIND,
        key: key.to_string(),
        reason: "retries exhausted".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use crate::api::ObjectMeta;

    #[tokio::test]
    async fn test_retry_on_conflict_skips_clean_write() {
        let store = MemoryStore::new();
        let pod = Pod {
            metadata: ObjectMeta {
                name: "compute-0".into(),
                namespace: "slurm".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = store.pods().create(&pod).await.unwrap();

        let unchanged = retry_on_conflict(store.pods(), &created.key(), false, |_| false)
            .await
            .unwrap();
        assert_eq!(
            unchanged.metadata.resource_version,
            created.metadata.resource_version
        );

        let changed = retry_on_conflict(store.pods(), &created.key(), false, |p| {
            p.metadata.labels.insert("a".into(), "b".into());
            true
        })
        .await
        .unwrap();
        assert_ne!(
            changed.metadata.resource_version,
            created.metadata.resource_version
        );
    }

    #[tokio::test]
    async fn test_retry_on_conflict_recovers_from_conflict() {
        let store = MemoryStore::new();
        let pod = Pod {
            metadata: ObjectMeta {
                name: "compute-0".into(),
                namespace: "slurm".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = store.pods().create(&pod).await.unwrap();
        store.pod_api().fail_next(
            memory::Verb::Update,
            StoreError::Conflict {
                kind: "Pod",
                key: created.key().to_string(),
                reason: "stale".into(),
            },
        );

        let updated = retry_on_conflict(store.pods(), &created.key(), false, |p| {
            p.metadata.labels.insert("a".into(), "b".into());
            true
        })
        .await
        .unwrap();
        assert_eq!(updated.metadata.labels.get("a").map(String::as_str), Some("b"));
    }
}
