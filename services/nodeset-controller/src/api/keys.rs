//! Well-known label and annotation keys.

/// Label carrying the revision hash a pod was created from.
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";

/// Label carrying the pod name, for per-pod service selection.
pub const LABEL_POD_NAME: &str = "nodeset.slinky.slurm.net/pod-name";

/// Label carrying the pod ordinal.
pub const LABEL_POD_INDEX: &str = "nodeset.slinky.slurm.net/pod-index";

/// Label carrying the pod hostname.
pub const LABEL_POD_HOSTNAME: &str = "nodeset.slinky.slurm.net/pod-hostname";

/// Present on a pod whose Slurm node should be drained and kept out of service.
pub const ANNOTATION_POD_CORDON: &str = "nodeset.slinky.slurm.net/pod-cordon";

/// Relative cost of deleting a pod; lower goes first.
pub const ANNOTATION_POD_DELETION_COST: &str = "nodeset.slinky.slurm.net/pod-deletion-cost";

/// RFC3339 time by which the running jobs on the pod's node finish.
pub const ANNOTATION_POD_DEADLINE: &str = "nodeset.slinky.slurm.net/pod-deadline";

/// Marks a pod for replacement regardless of its revision.
pub const ANNOTATION_POD_DELETE: &str = "nodeset.slinky.slurm.net/pod-delete";

/// When `"true"` on a NodeSet, creates are capped per cycle.
pub const ANNOTATION_PROGRESSIVE_CREATE: &str = "nodeset.slinky.slurm.net/progressive-create";

/// Scheduler weight of the node backing a pod.
pub const ANNOTATION_NODE_WEIGHT: &str = "slinky.slurm.net/node-weight";

/// Topology key used for one-pod-per-node anti-affinity.
pub const TOPOLOGY_HOSTNAME: &str = "kubernetes.io/hostname";

/// Prefix of the pod conditions mirroring Slurm node states.
pub const CONDITION_SLURM_STATE_PREFIX: &str = "SlurmNodeState";
