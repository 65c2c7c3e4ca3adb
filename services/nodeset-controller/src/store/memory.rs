//! In-process object store.
//!
//! Behaves like the API server for the parts the controller relies on:
//! UIDs and resource versions are assigned on write, stale writes conflict,
//! `update` leaves status alone and `update_status` touches nothing else,
//! and every change is broadcast to watchers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::patch::json_merge_patch;
use super::{Api, ObjectStore, StoreError, StoreResult, WatchEvent};
use crate::api::{
    ControllerRevision, Node, NodeSet, ObjectKey, PersistentVolumeClaim, Pod, Resource, Service,
};

const WATCH_CAPACITY: usize = 1024;

/// Operation selector for injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Create,
    Update,
    UpdateStatus,
    Patch,
    Delete,
}

/// One kind held in memory.
pub struct MemoryApi<T: Resource> {
    objects: DashMap<ObjectKey, Arc<T>>,
    version: Arc<AtomicU64>,
    events: broadcast::Sender<WatchEvent<T>>,
    failures: Mutex<Vec<(Verb, StoreError)>>,
}

impl<T: Resource> MemoryApi<T> {
    fn new(version: Arc<AtomicU64>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: DashMap::new(),
            version,
            events,
            failures: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `verb` call fail with `err`.
    pub fn fail_next(&self, verb: Verb, err: StoreError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push((verb, err));
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn injected(&self, verb: Verb) -> StoreResult<()> {
        let Ok(mut failures) = self.failures.lock() else {
            return Ok(());
        };
        match failures.iter().position(|(v, _)| *v == verb) {
            Some(idx) => Err(failures.remove(idx).1),
            None => Ok(()),
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn stored(&self, key: &ObjectKey) -> StoreResult<Arc<T>> {
        self.objects
            .get(key)
            .map(|o| Arc::clone(o.value()))
            .ok_or_else(|| StoreError::not_found::<T>(key))
    }

    fn check_version(&self, stored: &T, incoming: &T) -> StoreResult<()> {
        let incoming_rv = &incoming.meta().resource_version;
        if !incoming_rv.is_empty() && *incoming_rv != stored.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                key: stored.key().to_string(),
                reason: format!(
                    "resource version {} is stale (current {})",
                    incoming_rv,
                    stored.meta().resource_version
                ),
            });
        }
        Ok(())
    }

    /// Write `next` over `stored`, keeping server-owned metadata.
    fn commit(&self, stored: &Arc<T>, next: Value) -> StoreResult<Arc<T>> {
        let key = stored.key();
        let old_value = to_value(stored.as_ref())?;
        let mut obj: T = from_value(next, &key)?;

        let old_meta = stored.meta();
        let spec_changed = old_value.get("spec") != to_value(&obj)?.get("spec");
        let meta = obj.meta_mut();
        meta.name = old_meta.name.clone();
        meta.namespace = old_meta.namespace.clone();
        meta.uid = old_meta.uid.clone();
        meta.creation_timestamp = old_meta.creation_timestamp;
        meta.generation = old_meta.generation + i64::from(spec_changed);
        meta.resource_version = self.next_version();

        let obj = Arc::new(obj);
        self.objects.insert(key, Arc::clone(&obj));
        let _ = self.events.send(WatchEvent::Modified {
            old: Arc::clone(stored),
            new: Arc::clone(&obj),
        });
        Ok(obj)
    }
}

fn to_value<T: Resource>(obj: &T) -> StoreResult<Value> {
    serde_json::to_value(obj).map_err(|e| StoreError::Invalid {
        kind: T::KIND,
        key: obj.key().to_string(),
        reason: e.to_string(),
    })
}

fn from_value<T: Resource>(value: Value, key: &ObjectKey) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|e| StoreError::Invalid {
        kind: T::KIND,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn with_status(mut target: Value, source: &Value) -> Value {
    if let Value::Object(map) = &mut target {
        match source.get("status") {
            Some(status) => {
                map.insert("status".into(), status.clone());
            }
            None => {
                map.remove("status");
            }
        }
    }
    target
}

#[async_trait]
impl<T: Resource> Api<T> for MemoryApi<T> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Arc<T>> {
        self.stored(key)
    }

    async fn list(&self, namespace: &str) -> StoreResult<Vec<Arc<T>>> {
        let mut items: Vec<Arc<T>> = self
            .objects
            .iter()
            .filter(|e| namespace.is_empty() || e.key().namespace == namespace)
            .map(|e| Arc::clone(e.value()))
            .collect();
        items.sort_by_key(|o| o.key());
        Ok(items)
    }

    async fn create(&self, obj: &T) -> StoreResult<Arc<T>> {
        self.injected(Verb::Create)?;
        let key = obj.key();
        if key.name.is_empty() || (T::NAMESPACED && key.namespace.is_empty()) {
            return Err(StoreError::Invalid {
                kind: T::KIND,
                key: key.to_string(),
                reason: "name and namespace are required".into(),
            });
        }

        let mut obj = obj.clone();
        let meta = obj.meta_mut();
        meta.uid = Uuid::new_v4().to_string();
        meta.resource_version = self.next_version();
        meta.generation = 1;
        meta.creation_timestamp = Some(Utc::now());
        let obj = Arc::new(obj);

        match self.objects.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists {
                    kind: T::KIND,
                    key: key.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&obj));
            }
        }
        let _ = self.events.send(WatchEvent::Added(Arc::clone(&obj)));
        Ok(obj)
    }

    async fn update(&self, obj: &T) -> StoreResult<Arc<T>> {
        self.injected(Verb::Update)?;
        let stored = self.stored(&obj.key())?;
        self.check_version(&stored, obj)?;
        let next = with_status(to_value(obj)?, &to_value(stored.as_ref())?);
        self.commit(&stored, next)
    }

    async fn update_status(&self, obj: &T) -> StoreResult<Arc<T>> {
        self.injected(Verb::UpdateStatus)?;
        let stored = self.stored(&obj.key())?;
        self.check_version(&stored, obj)?;
        let next = with_status(to_value(stored.as_ref())?, &to_value(obj)?);
        self.commit(&stored, next)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> StoreResult<Arc<T>> {
        self.injected(Verb::Patch)?;
        let stored = self.stored(key)?;
        let mut next = to_value(stored.as_ref())?;
        json_merge_patch(&mut next, patch);
        self.commit(&stored, next)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.injected(Verb::Delete)?;
        let (_, removed) = self
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::not_found::<T>(key))?;
        let _ = self.events.send(WatchEvent::Deleted(removed));
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.events.subscribe()
    }
}

/// All kinds held in memory.
pub struct MemoryStore {
    nodesets: MemoryApi<NodeSet>,
    pods: MemoryApi<Pod>,
    claims: MemoryApi<PersistentVolumeClaim>,
    services: MemoryApi<Service>,
    revisions: MemoryApi<ControllerRevision>,
    nodes: MemoryApi<Node>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let version = Arc::new(AtomicU64::new(0));
        Self {
            nodesets: MemoryApi::new(Arc::clone(&version)),
            pods: MemoryApi::new(Arc::clone(&version)),
            claims: MemoryApi::new(Arc::clone(&version)),
            services: MemoryApi::new(Arc::clone(&version)),
            revisions: MemoryApi::new(Arc::clone(&version)),
            nodes: MemoryApi::new(version),
        }
    }

    pub fn nodeset_api(&self) -> &MemoryApi<NodeSet> {
        &self.nodesets
    }

    pub fn pod_api(&self) -> &MemoryApi<Pod> {
        &self.pods
    }

    pub fn claim_api(&self) -> &MemoryApi<PersistentVolumeClaim> {
        &self.claims
    }

    pub fn revision_api(&self) -> &MemoryApi<ControllerRevision> {
        &self.revisions
    }
}

impl ObjectStore for MemoryStore {
    fn nodesets(&self) -> &dyn Api<NodeSet> {
        &self.nodesets
    }

    fn pods(&self) -> &dyn Api<Pod> {
        &self.pods
    }

    fn claims(&self) -> &dyn Api<PersistentVolumeClaim> {
        &self.claims
    }

    fn services(&self) -> &dyn Api<Service> {
        &self.services
    }

    fn revisions(&self) -> &dyn Api<ControllerRevision> {
        &self.revisions
    }

    fn nodes(&self) -> &dyn Api<Node> {
        &self.nodes
    }
}
