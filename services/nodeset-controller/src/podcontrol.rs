//! Pod and claim mutations for NodeSet members.
//!
//! Every mutation records an event on the NodeSet. Claims follow the
//! NodeSet's retention policy through owner references: a claim owned by
//! the NodeSet goes away with it, a claim owned by its pod goes away when
//! the pod is scaled away.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::{
    NodeSet, OwnerReference, PersistentVolumeClaim, Pod, Resource, RetentionPolicy,
    RetentionPolicyType,
};
use crate::events::{Event, EventRecorder, EventType, REASON_CONFLICTING_CONTROLLER};
use crate::nodeset::utils::{
    is_identity_match, is_storage_match, ordinal, pod_claims, update_identity, update_storage,
};
use crate::store::{ObjectStore, StoreError, StoreResult, CONFLICT_RETRIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Create,
    Delete,
    Update,
}

impl Verb {
    fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "Create",
            Verb::Delete => "Delete",
            Verb::Update => "Update",
        }
    }
}

/// Mutations on the pods of a NodeSet.
///
/// `scaled_down` tells the retention logic whether the pod is leaving the
/// fleet, in which case a `whenScaled: Delete` policy hands its claims to
/// the pod.
#[async_trait]
pub trait PodControl: Send + Sync {
    /// Create missing claims, then the pod, then fix claim ownership.
    async fn create_nodeset_pod(&self, nodeset: &NodeSet, pod: &Pod) -> StoreResult<()>;

    async fn delete_nodeset_pod(&self, nodeset: &NodeSet, pod: &Pod) -> StoreResult<()>;

    /// Bring identity, storage and claim ownership in line with the
    /// NodeSet. Writes the pod only when something was off.
    async fn update_nodeset_pod(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        scaled_down: bool,
    ) -> StoreResult<()>;

    async fn pod_pvcs_match_retention_policy(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        scaled_down: bool,
    ) -> StoreResult<bool>;

    async fn update_pod_pvcs_for_retention_policy(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        scaled_down: bool,
    ) -> StoreResult<()>;
}

/// [`PodControl`] over the object store.
pub struct RealPodControl {
    store: Arc<dyn ObjectStore>,
    recorder: Arc<dyn EventRecorder>,
}

impl RealPodControl {
    pub fn new(store: Arc<dyn ObjectStore>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self { store, recorder }
    }

    async fn record_pod_event(
        &self,
        verb: Verb,
        nodeset: &NodeSet,
        pod: &Pod,
        result: Result<(), &StoreError>,
    ) {
        let lower = verb.as_str().to_lowercase();
        let event = match result {
            Ok(()) => Event::new(
                nodeset,
                EventType::Normal,
                &format!("Successful{}", verb.as_str()),
                format!(
                    "{lower} Pod {} in NodeSet {} successful",
                    pod.metadata.name, nodeset.metadata.name
                ),
            ),
            Err(err) => Event::new(
                nodeset,
                EventType::Warning,
                &format!("Failed{}", verb.as_str()),
                format!(
                    "{lower} Pod {} in NodeSet {} failed error: {err}",
                    pod.metadata.name, nodeset.metadata.name
                ),
            ),
        };
        self.recorder.record(event).await;
    }

    async fn record_claim_event(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        claim: &PersistentVolumeClaim,
        result: Result<(), &StoreError>,
    ) {
        let event = match result {
            Ok(()) => Event::new(
                nodeset,
                EventType::Normal,
                "SuccessfulCreate",
                format!(
                    "create Claim {} Pod {} in NodeSet {} successful",
                    claim.metadata.name, pod.metadata.name, nodeset.metadata.name
                ),
            ),
            Err(err) => Event::new(
                nodeset,
                EventType::Warning,
                "FailedCreate",
                format!(
                    "create Claim {} for Pod {} in NodeSet {} failed error: {err}",
                    claim.metadata.name, pod.metadata.name, nodeset.metadata.name
                ),
            ),
        };
        self.recorder.record(event).await;
    }

    /// Create every claim the pod mounts that does not exist yet. All
    /// claims are attempted; the first failure is returned.
    async fn create_persistent_volume_claims(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
    ) -> StoreResult<()> {
        let mut first_err = None;
        for (_, claim) in pod_claims(nodeset, ordinal(pod)) {
            let err = match self.store.claims().get(&claim.key()).await {
                Err(err) if err.is_not_found() => match self.store.claims().create(&claim).await {
                    Ok(_) => {
                        self.record_claim_event(nodeset, pod, &claim, Ok(())).await;
                        None
                    }
                    Err(err) => {
                        if !err.is_already_exists() {
                            self.record_claim_event(nodeset, pod, &claim, Err(&err)).await;
                        }
                        Some(err)
                    }
                },
                Err(err) => {
                    self.record_claim_event(nodeset, pod, &claim, Err(&err)).await;
                    Some(err)
                }
                Ok(existing) if existing.metadata.is_terminating() => Some(StoreError::Invalid {
                    kind: PersistentVolumeClaim::KIND,
                    key: existing.key().to_string(),
                    reason: "claim is being deleted".into(),
                }),
                Ok(_) => None,
            };
            if let Some(err) = err {
                warn!(claim = %claim.metadata.name, pod = %pod.metadata.name, error = %err, "Failed to ensure claim");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Check and fix one pod in memory. Returns whether a write is needed.
    async fn make_consistent(
        &self,
        nodeset: &NodeSet,
        pod: &mut Pod,
        scaled_down: bool,
    ) -> StoreResult<bool> {
        let mut dirty = false;
        if !is_identity_match(nodeset, pod) {
            update_identity(nodeset, pod);
            dirty = true;
        }
        if !is_storage_match(nodeset, pod) {
            update_storage(nodeset, pod);
            dirty = true;
            self.create_persistent_volume_claims(nodeset, pod).await?;
        }
        if !self
            .pod_pvcs_match_retention_policy(nodeset, pod, scaled_down)
            .await?
        {
            self.update_pod_pvcs_for_retention_policy(nodeset, pod, scaled_down)
                .await?;
            dirty = true;
        }
        Ok(dirty)
    }
}

#[async_trait]
impl PodControl for RealPodControl {
    async fn create_nodeset_pod(&self, nodeset: &NodeSet, pod: &Pod) -> StoreResult<()> {
        if let Err(err) = self.create_persistent_volume_claims(nodeset, pod).await {
            self.record_pod_event(Verb::Create, nodeset, pod, Err(&err))
                .await;
            return Err(err);
        }

        let created = match self.store.pods().create(pod).await {
            Ok(created) => created,
            Err(err) if err.is_already_exists() => return Err(err),
            Err(err) => {
                self.record_pod_event(Verb::Create, nodeset, pod, Err(&err))
                    .await;
                return Err(err);
            }
        };

        // claims existed before the pod had a UID; hand them over now
        if let Err(err) = self
            .update_pod_pvcs_for_retention_policy(nodeset, &created, false)
            .await
        {
            self.record_pod_event(Verb::Update, nodeset, &created, Err(&err))
                .await;
            return Err(err);
        }

        info!(pod = %created.metadata.name, nodeset = %nodeset.key(), "Created pod");
        self.record_pod_event(Verb::Create, nodeset, &created, Ok(()))
            .await;
        Ok(())
    }

    async fn delete_nodeset_pod(&self, nodeset: &NodeSet, pod: &Pod) -> StoreResult<()> {
        let result = self.store.pods().delete(&pod.key()).await;
        if result.is_ok() {
            info!(pod = %pod.metadata.name, nodeset = %nodeset.key(), "Deleted pod");
        }
        self.record_pod_event(Verb::Delete, nodeset, pod, result.as_ref().map(|_| ()))
            .await;
        result
    }

    async fn update_nodeset_pod(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        scaled_down: bool,
    ) -> StoreResult<()> {
        let mut pod = pod.clone();
        let mut attempted = false;
        let mut result = Ok(());

        for _ in 0..CONFLICT_RETRIES {
            match self.make_consistent(nodeset, &mut pod, scaled_down).await {
                Ok(false) => {
                    result = Ok(());
                    break;
                }
                Ok(true) => {}
                Err(err) => {
                    self.record_pod_event(Verb::Update, nodeset, &pod, Err(&err))
                        .await;
                    return Err(err);
                }
            }

            attempted = true;
            match self.store.pods().update(&pod).await {
                Ok(_) => {
                    result = Ok(());
                    break;
                }
                Err(err) if err.is_conflict() => {
                    debug!(pod = %pod.metadata.name, "Pod update conflicted, refetching");
                    if let Ok(fresh) = self.store.pods().get(&pod.key()).await {
                        pod = (*fresh).clone();
                    }
                    result = Err(err);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }

        if attempted {
            self.record_pod_event(Verb::Update, nodeset, &pod, result.as_ref().map(|_| ()))
                .await;
        }
        result
    }

    async fn pod_pvcs_match_retention_policy(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        scaled_down: bool,
    ) -> StoreResult<bool> {
        for (_, template) in pod_claims(nodeset, ordinal(pod)) {
            match self.store.claims().get(&template.key()).await {
                Err(err) if err.is_not_found() => {
                    debug!(claim = %template.metadata.name, "Expected claim missing, picking it up next cycle");
                }
                Err(err) => return Err(err),
                Ok(claim) => {
                    if !is_claim_owner_up_to_date(&claim, nodeset, pod, scaled_down) {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn update_pod_pvcs_for_retention_policy(
        &self,
        nodeset: &NodeSet,
        pod: &Pod,
        scaled_down: bool,
    ) -> StoreResult<()> {
        for (_, template) in pod_claims(nodeset, ordinal(pod)) {
            let claim = match self.store.claims().get(&template.key()).await {
                Err(err) if err.is_not_found() => {
                    debug!(claim = %template.metadata.name, "Expected claim missing, picking it up next cycle");
                    continue;
                }
                Err(err) => return Err(err),
                Ok(claim) => claim,
            };

            if has_unexpected_controller(&claim, nodeset, pod) {
                let message = format!(
                    "PersistentVolumeClaim {} has a conflicting OwnerReference that acts as a managing controller, the retention policy is ignored for this claim",
                    claim.metadata.name
                );
                self.recorder
                    .record(Event::new(
                        nodeset,
                        EventType::Warning,
                        REASON_CONFLICTING_CONTROLLER,
                        message,
                    ))
                    .await;
            }

            if !is_claim_owner_up_to_date(&claim, nodeset, pod, scaled_down) {
                let mut updated = (*claim).clone();
                update_claim_owner_refs(&mut updated, nodeset, pod, scaled_down);
                debug!(claim = %updated.metadata.name, owners = updated.metadata.owner_references.len(), "Updating claim owners for retention policy");
                self.store.claims().update(&updated).await?;
            }
        }
        Ok(())
    }
}

fn has_owner_ref(claim: &PersistentVolumeClaim, uid: &str) -> bool {
    claim.metadata.has_owner(uid)
}

/// A reference to `owner` by kind and name whose UID no longer matches,
/// i.e. it points at a previous incarnation.
fn has_stale_owner_ref<R: Resource>(claim: &PersistentVolumeClaim, owner: &R) -> bool {
    claim
        .metadata
        .owner_references
        .iter()
        .find(|r| r.refers_to(owner))
        .is_some_and(|r| r.uid != owner.meta().uid)
}

/// Another controller manages the claim, or a reference to the NodeSet or
/// pod carries a foreign UID.
fn has_unexpected_controller(claim: &PersistentVolumeClaim, nodeset: &NodeSet, pod: &Pod) -> bool {
    let policy = nodeset.retention_policy();
    if policy.when_scaled == RetentionPolicyType::Retain
        && policy.when_deleted == RetentionPolicyType::Retain
    {
        return false;
    }
    for owner in &claim.metadata.owner_references {
        if owner.refers_to(nodeset) {
            if owner.uid != nodeset.metadata.uid {
                return true;
            }
            continue;
        }
        if owner.refers_to(pod) {
            if owner.uid != pod.metadata.uid {
                return true;
            }
            continue;
        }
        if owner.is_controller() {
            return true;
        }
    }
    false
}

fn has_non_controller_owner(claim: &PersistentVolumeClaim, nodeset: &NodeSet, pod: &Pod) -> bool {
    claim.metadata.owner_references.iter().any(|o| {
        (o.uid == nodeset.metadata.uid || o.uid == pod.metadata.uid) && !o.is_controller()
    })
}

/// Whether the claim's owner references already express the retention
/// policy for this pod.
pub fn is_claim_owner_up_to_date(
    claim: &PersistentVolumeClaim,
    nodeset: &NodeSet,
    pod: &Pod,
    scaled_down: bool,
) -> bool {
    if has_stale_owner_ref(claim, nodeset) || has_stale_owner_ref(claim, pod) {
        return true;
    }

    let owned_by_set = has_owner_ref(claim, &nodeset.metadata.uid);
    let owned_by_pod = has_owner_ref(claim, &pod.metadata.uid);

    if has_unexpected_controller(claim, nodeset, pod) {
        // our refs must go
        return !(owned_by_set || owned_by_pod);
    }
    if has_non_controller_owner(claim, nodeset, pod) {
        return false;
    }

    use RetentionPolicyType::{Delete, Retain};
    let RetentionPolicy {
        when_deleted,
        when_scaled,
    } = nodeset.retention_policy();
    match (when_deleted, when_scaled) {
        (Retain, Retain) => !owned_by_set && !owned_by_pod,
        (Delete, Retain) => owned_by_set && !owned_by_pod,
        (Retain, Delete) => !owned_by_set && scaled_down == owned_by_pod,
        (Delete, Delete) => scaled_down != owned_by_set && scaled_down == owned_by_pod,
    }
}

fn add_controller_ref<R: Resource>(refs: &mut Vec<OwnerReference>, owner: &R) {
    if !refs.iter().any(|r| r.uid == owner.meta().uid) {
        refs.push(OwnerReference::controller_for(owner));
    }
}

/// Replace the NodeSet and pod references on the claim per policy.
pub fn update_claim_owner_refs(
    claim: &mut PersistentVolumeClaim,
    nodeset: &NodeSet,
    pod: &Pod,
    scaled_down: bool,
) {
    let unexpected = has_unexpected_controller(claim, nodeset, pod);
    let refs = &mut claim.metadata.owner_references;
    refs.retain(|r| !r.refers_to(nodeset) && !r.refers_to(pod));
    if unexpected {
        return;
    }

    use RetentionPolicyType::{Delete, Retain};
    let policy = nodeset.retention_policy();
    match (policy.when_deleted, policy.when_scaled) {
        (Retain, Retain) => {}
        (Delete, Retain) => add_controller_ref(refs, nodeset),
        (Retain, Delete) => {
            if scaled_down {
                add_controller_ref(refs, pod);
            }
        }
        (Delete, Delete) => {
            if scaled_down {
                add_controller_ref(refs, pod);
            } else {
                add_controller_ref(refs, nodeset);
            }
        }
    }
}
