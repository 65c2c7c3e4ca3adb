//! Object types the controller reads and writes.

pub mod keys;
pub mod meta;
pub mod nodeset;
pub mod workload;

pub use meta::{
    LabelSelector, LabelSelectorRequirement, ObjectKey, ObjectMeta, ObjectReference,
    OwnerReference, Resource, SelectorOperator,
};
pub use nodeset::{
    Condition, NodeSet, NodeSetSpec, NodeSetStatus, NodeSetUpdateStrategy, RetentionPolicy,
    RetentionPolicyType, RollingUpdate, UpdateStrategyType,
};
pub use workload::{
    Affinity, ClaimVolumeSource, ConditionStatus, Container, ContainerPort, ControllerRevision,
    Node, PersistentVolumeClaim, Pod, PodAffinityTerm, PodAntiAffinity, PodCondition, PodPhase,
    PodSpec, PodStatus, PodTemplateSpec, Service, ServicePort, ServiceSpec, Taint, Toleration,
    Volume,
};
