//! Pod identity, storage and annotation helpers.
//!
//! A NodeSet pod's name, hostname and claim names are all functions of the
//! NodeSet name and the pod ordinal; everything here either derives them or
//! checks a pod against them.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};

use crate::api::keys::{
    ANNOTATION_POD_CORDON, ANNOTATION_POD_DEADLINE, ANNOTATION_POD_DELETE,
    ANNOTATION_POD_DELETION_COST, ANNOTATION_PROGRESSIVE_CREATE, LABEL_POD_HOSTNAME,
    LABEL_POD_INDEX, LABEL_POD_NAME, LABEL_REVISION_HASH, TOPOLOGY_HOSTNAME,
};
use crate::api::workload::{TAINT_NO_EXECUTE, TAINT_NO_SCHEDULE};
use crate::api::{
    Affinity, ClaimVolumeSource, LabelSelector, Node, NodeSet, ObjectMeta, OwnerReference,
    PersistentVolumeClaim, Pod, PodAffinityTerm, PodAntiAffinity, Volume,
};

static POD_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*)-([0-9]+)$").expect("pod name pattern is valid"));

/// Key used for expectations, hints and the work queue.
pub fn nodeset_key(nodeset: &NodeSet) -> String {
    nodeset.metadata.key().to_string()
}

/// Split `<parent>-<ordinal>`.
pub fn parent_and_ordinal(name: &str) -> Option<(&str, i32)> {
    let caps = POD_NAME.captures(name)?;
    let parent = caps.get(1)?.as_str();
    let ordinal = caps.get(2)?.as_str().parse().ok()?;
    Some((parent, ordinal))
}

/// The pod's ordinal, or -1 when the name does not carry one.
pub fn ordinal(pod: &Pod) -> i32 {
    parent_and_ordinal(&pod.metadata.name)
        .map(|(_, ord)| ord)
        .unwrap_or(-1)
}

/// Name of the headless service giving member pods stable DNS names.
pub fn headless_service_name(nodeset: &NodeSet) -> String {
    format!("{}-headless", nodeset.metadata.name)
}

pub fn pod_name(nodeset: &NodeSet, ordinal: i32) -> String {
    format!("{}-{}", nodeset.metadata.name, ordinal)
}

/// Name of the Slurm node a pod registers as.
pub fn slurm_node_name(pod: &Pod) -> &str {
    if pod.spec.hostname.is_empty() {
        &pod.metadata.name
    } else {
        &pod.spec.hostname
    }
}

/// Whether the pod name follows this NodeSet's naming schema.
pub fn is_pod_from_nodeset(nodeset: &NodeSet, pod: &Pod) -> bool {
    parent_and_ordinal(&pod.metadata.name)
        .is_some_and(|(parent, _)| parent == nodeset.metadata.name)
}

pub fn is_identity_match(nodeset: &NodeSet, pod: &Pod) -> bool {
    let Some((parent, ordinal)) = parent_and_ordinal(&pod.metadata.name) else {
        return false;
    };
    ordinal >= 0
        && parent == nodeset.metadata.name
        && pod.metadata.name == pod_name(nodeset, ordinal)
        && pod.metadata.namespace == nodeset.metadata.namespace
        && pod.metadata.labels.get(LABEL_POD_NAME) == Some(&pod.metadata.name)
        && pod.metadata.labels.get(LABEL_POD_INDEX) == Some(&ordinal.to_string())
}

/// Rewrite name, namespace and identity labels from the ordinal.
pub fn update_identity(nodeset: &NodeSet, pod: &mut Pod) {
    let ordinal = ordinal(pod);
    pod.metadata.name = pod_name(nodeset, ordinal);
    pod.metadata.namespace = nodeset.metadata.namespace.clone();
    pod.metadata
        .labels
        .insert(LABEL_POD_NAME.into(), pod.metadata.name.clone());
    pod.metadata
        .labels
        .insert(LABEL_POD_INDEX.into(), ordinal.to_string());
}

pub fn claim_name(nodeset: &NodeSet, template: &PersistentVolumeClaim, ordinal: i32) -> String {
    format!(
        "{}-{}-{}",
        template.metadata.name, nodeset.metadata.name, ordinal
    )
}

/// Labels every pod and claim of the NodeSet carries.
pub fn selector_labels(nodeset: &NodeSet) -> BTreeMap<String, String> {
    nodeset.spec.selector.match_labels.clone()
}

/// The claims a pod with `ordinal` mounts, keyed by template name.
pub fn pod_claims(nodeset: &NodeSet, ordinal: i32) -> Vec<(String, PersistentVolumeClaim)> {
    nodeset
        .spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut claim = template.clone();
            claim.metadata.name = claim_name(nodeset, template, ordinal);
            claim.metadata.namespace = nodeset.metadata.namespace.clone();
            claim.metadata.labels.extend(selector_labels(nodeset));
            (template.metadata.name.clone(), claim)
        })
        .collect()
}

/// Point claim volumes at this pod's claims. Claim volumes come first,
/// other volumes keep their relative order.
pub fn update_storage(nodeset: &NodeSet, pod: &mut Pod) {
    let claims = pod_claims(nodeset, ordinal(pod));
    let mut volumes: Vec<Volume> = claims
        .iter()
        .map(|(volume_name, claim)| Volume {
            name: volume_name.clone(),
            persistent_volume_claim: Some(ClaimVolumeSource {
                claim_name: claim.metadata.name.clone(),
                read_only: false,
            }),
            ..Default::default()
        })
        .collect();
    let current = std::mem::take(&mut pod.spec.volumes);
    volumes.extend(
        current
            .into_iter()
            .filter(|v| !claims.iter().any(|(name, _)| *name == v.name)),
    );
    pod.spec.volumes = volumes;
}

pub fn is_storage_match(nodeset: &NodeSet, pod: &Pod) -> bool {
    let ordinal = ordinal(pod);
    if ordinal < 0 {
        return false;
    }
    nodeset.spec.volume_claim_templates.iter().all(|template| {
        pod.spec
            .volumes
            .iter()
            .find(|v| v.name == template.metadata.name)
            .and_then(|v| v.persistent_volume_claim.as_ref())
            .is_some_and(|src| src.claim_name == claim_name(nodeset, template, ordinal))
    })
}

/// Build the pod for `ordinal` from the template.
pub fn new_nodeset_pod(nodeset: &NodeSet, ordinal: i32, revision_hash: &str) -> Pod {
    let template = &nodeset.spec.template;
    let mut labels = template.metadata.labels.clone();
    labels.extend(selector_labels(nodeset));

    let mut pod = Pod {
        metadata: ObjectMeta {
            name: pod_name(nodeset, ordinal),
            namespace: nodeset.metadata.namespace.clone(),
            labels,
            annotations: template.metadata.annotations.clone(),
            owner_references: vec![OwnerReference::controller_for(nodeset)],
            ..Default::default()
        },
        spec: template.spec.clone(),
        ..Default::default()
    };

    update_identity(nodeset, &mut pod);
    pod.spec.hostname = if pod.spec.hostname.is_empty() {
        pod.metadata.name.clone()
    } else {
        format!("{}{}", pod.spec.hostname, ordinal)
    };
    pod.metadata
        .labels
        .insert(LABEL_POD_HOSTNAME.into(), pod.spec.hostname.clone());
    pod.spec.subdomain = headless_service_name(nodeset);
    update_storage(nodeset, &mut pod);

    if !revision_hash.is_empty() {
        pod.metadata
            .labels
            .insert(LABEL_REVISION_HASH.into(), revision_hash.to_string());
    }

    // leave placement to the scheduler
    pod.spec.node_name.clear();
    add_host_anti_affinity(nodeset, &mut pod);
    pod
}

/// Require at most one NodeSet pod per host.
fn add_host_anti_affinity(nodeset: &NodeSet, pod: &mut Pod) {
    let term = PodAffinityTerm {
        label_selector: Some(LabelSelector::from_labels(selector_labels(nodeset))),
        topology_key: TOPOLOGY_HOSTNAME.to_string(),
    };
    let affinity = pod.spec.affinity.get_or_insert_with(Affinity::default);
    let anti = affinity
        .pod_anti_affinity
        .get_or_insert_with(PodAntiAffinity::default);
    if !anti.required.contains(&term) {
        anti.required.push(term);
    }
}

pub fn revision_hash(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .get(LABEL_REVISION_HASH)
        .map(String::as_str)
}

pub fn is_pod_cordon(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .get(ANNOTATION_POD_CORDON)
        .is_some_and(|v| v == "true")
}

pub fn is_pod_delete(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .get(ANNOTATION_POD_DELETE)
        .is_some_and(|v| v == "true")
}

pub fn pod_deletion_cost(pod: &Pod) -> i64 {
    pod.metadata
        .annotations
        .get(ANNOTATION_POD_DELETION_COST)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

pub fn pod_deadline(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata
        .annotations
        .get(ANNOTATION_POD_DEADLINE)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

pub fn is_progressive_create(nodeset: &NodeSet) -> bool {
    nodeset
        .metadata
        .annotations
        .get(ANNOTATION_PROGRESSIVE_CREATE)
        .is_some_and(|v| v == "true")
}

/// Merge patch toggling the cordon annotation.
pub fn cordon_patch(cordon: bool) -> Value {
    let value = if cordon { json!("true") } else { Value::Null };
    json!({"metadata": {"annotations": {ANNOTATION_POD_CORDON: value}}})
}

/// Merge patch setting or clearing the deadline annotation.
pub fn deadline_patch(deadline: Option<DateTime<Utc>>) -> Value {
    let value = match deadline {
        Some(t) => json!(t.to_rfc3339()),
        None => Value::Null,
    };
    json!({"metadata": {"annotations": {ANNOTATION_POD_DEADLINE: value}}})
}

/// The revision payload: the pod template, flagged to replace wholesale.
pub fn get_patch(nodeset: &NodeSet) -> Value {
    let mut template = serde_json::to_value(&nodeset.spec.template).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut template {
        map.insert("$patch".into(), json!("replace"));
    }
    json!({"spec": {"template": template}})
}

/// Whether a NodeSet pod could run on `node`.
pub fn is_node_eligible(nodeset: &NodeSet, node: &Node) -> bool {
    let spec = &nodeset.spec.template.spec;
    let selected = spec
        .node_selector
        .iter()
        .all(|(k, v)| node.metadata.labels.get(k) == Some(v));
    if !selected || node.metadata.is_terminating() {
        return false;
    }
    node.spec
        .taints
        .iter()
        .filter(|t| t.effect == TAINT_NO_SCHEDULE || t.effect == TAINT_NO_EXECUTE)
        .all(|taint| spec.tolerations.iter().any(|tol| tol.tolerates(taint)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PodTemplateSpec, Taint, Toleration};

    fn nodeset() -> NodeSet {
        let mut nodeset = NodeSet::default();
        nodeset.metadata.name = "compute".into();
        nodeset.metadata.namespace = "slurm".into();
        nodeset.metadata.uid = "ns-uid".into();
        nodeset.spec.selector = LabelSelector::from_labels([("app", "slurmd")]);
        nodeset.spec.template = PodTemplateSpec::default();
        nodeset.spec.volume_claim_templates = vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: "scratch".into(),
                ..Default::default()
            },
            ..Default::default()
        }];
        nodeset
    }

    #[test]
    fn test_parent_and_ordinal() {
        assert_eq!(parent_and_ordinal("compute-12"), Some(("compute", 12)));
        assert_eq!(parent_and_ordinal("gpu-a-0"), Some(("gpu-a", 0)));
        assert_eq!(parent_and_ordinal("compute"), None);
        assert_eq!(parent_and_ordinal("compute-x"), None);
    }

    #[test]
    fn test_new_pod_identity() {
        let nodeset = nodeset();
        let pod = new_nodeset_pod(&nodeset, 3, "abc");

        assert_eq!(pod.metadata.name, "compute-3");
        assert_eq!(pod.metadata.namespace, "slurm");
        assert_eq!(pod.spec.hostname, "compute-3");
        assert_eq!(slurm_node_name(&pod), "compute-3");
        assert_eq!(revision_hash(&pod), Some("abc"));
        assert!(pod.metadata.is_controlled_by("ns-uid"));
        assert!(is_identity_match(&nodeset, &pod));
        assert!(is_storage_match(&nodeset, &pod));
        assert_eq!(
            pod.spec.volumes[0]
                .persistent_volume_claim
                .as_ref()
                .map(|c| c.claim_name.as_str()),
            Some("scratch-compute-3")
        );
        let anti = pod
            .spec
            .affinity
            .as_ref()
            .and_then(|a| a.pod_anti_affinity.as_ref())
            .unwrap();
        assert_eq!(anti.required[0].topology_key, TOPOLOGY_HOSTNAME);
    }

    #[test]
    fn test_template_hostname_gets_ordinal() {
        let mut nodeset = nodeset();
        nodeset.spec.template.spec.hostname = "gpu".into();
        nodeset.spec.template.spec.node_name = "pinned".into();

        let pod = new_nodeset_pod(&nodeset, 7, "");
        assert_eq!(pod.spec.hostname, "gpu7");
        assert_eq!(slurm_node_name(&pod), "gpu7");
        assert!(pod.spec.node_name.is_empty());
        assert!(revision_hash(&pod).is_none());
    }

    #[test]
    fn test_update_storage_keeps_other_volumes() {
        let nodeset = nodeset();
        let mut pod = new_nodeset_pod(&nodeset, 1, "");
        pod.spec.volumes = vec![
            Volume {
                name: "config".into(),
                ..Default::default()
            },
            Volume {
                name: "scratch".into(),
                ..Default::default()
            },
        ];
        assert!(!is_storage_match(&nodeset, &pod));

        update_storage(&nodeset, &mut pod);
        let names: Vec<_> = pod.spec.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["scratch", "config"]);
        assert!(is_storage_match(&nodeset, &pod));
    }

    #[test]
    fn test_identity_repair() {
        let nodeset = nodeset();
        let mut pod = new_nodeset_pod(&nodeset, 2, "");
        pod.metadata.labels.remove(LABEL_POD_NAME);
        assert!(!is_identity_match(&nodeset, &pod));

        update_identity(&nodeset, &mut pod);
        assert!(is_identity_match(&nodeset, &pod));
    }

    #[test]
    fn test_annotations() {
        let mut pod = Pod::default();
        assert!(!is_pod_cordon(&pod));
        assert_eq!(pod_deletion_cost(&pod), 0);
        assert!(pod_deadline(&pod).is_none());

        pod.metadata
            .annotations
            .insert(ANNOTATION_POD_CORDON.into(), "true".into());
        pod.metadata
            .annotations
            .insert(ANNOTATION_POD_DELETION_COST.into(), "-5".into());
        pod.metadata
            .annotations
            .insert(ANNOTATION_POD_DEADLINE.into(), "2026-01-02T03:04:05Z".into());
        assert!(is_pod_cordon(&pod));
        assert_eq!(pod_deletion_cost(&pod), -5);
        assert_eq!(
            pod_deadline(&pod).map(|t| t.timestamp()),
            Some(1_767_323_045)
        );
    }

    #[test]
    fn test_get_patch_replaces_template() {
        let nodeset = nodeset();
        let patch = get_patch(&nodeset);
        assert_eq!(patch["spec"]["template"]["$patch"], json!("replace"));
    }

    #[test]
    fn test_node_eligibility() {
        let mut nodeset = nodeset();
        nodeset
            .spec
            .template
            .spec
            .node_selector
            .insert("pool".into(), "gpu".into());

        let mut node = Node::default();
        node.metadata.labels.insert("pool".into(), "gpu".into());
        assert!(is_node_eligible(&nodeset, &node));

        node.spec.taints.push(Taint {
            key: "maintenance".into(),
            value: None,
            effect: TAINT_NO_SCHEDULE.into(),
        });
        assert!(!is_node_eligible(&nodeset, &node));

        nodeset.spec.template.spec.tolerations.push(Toleration {
            key: Some("maintenance".into()),
            operator: Some("Exists".into()),
            ..Default::default()
        });
        assert!(is_node_eligible(&nodeset, &node));

        node.metadata.labels.clear();
        assert!(!is_node_eligible(&nodeset, &node));
    }
}
