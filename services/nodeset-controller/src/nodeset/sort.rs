//! Deletion preference among active pods.
//!
//! Pods that sort first are the cheapest to lose: not yet placed, not yet
//! running, not ready, flagged as cheap, finishing work soonest, already
//! cordoned, highest ordinal, most recently ready, newest.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use slinky_reconcile::clamp;

use super::utils::{is_pod_cordon, ordinal, pod_deadline, pod_deletion_cost};
use crate::api::{Pod, PodPhase};

fn phase_weight(phase: PodPhase) -> u8 {
    match phase {
        PodPhase::Pending => 0,
        PodPhase::Unknown => 1,
        PodPhase::Running => 2,
        // terminal phases weigh like Pending
        PodPhase::Succeeded | PodPhase::Failed => 0,
    }
}

/// Zero (unknown) sorts first, then later times before earlier ones.
fn after_or_zero(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => b.cmp(&a),
    }
}

/// Total order: `Less` means `a` should be removed before `b`.
pub fn compare_active(a: &Pod, b: &Pod) -> Ordering {
    // unassigned < assigned
    let by_node = (!a.spec.node_name.is_empty()).cmp(&!b.spec.node_name.is_empty());
    if by_node != Ordering::Equal {
        return by_node;
    }

    let by_phase = phase_weight(a.status.phase).cmp(&phase_weight(b.status.phase));
    if by_phase != Ordering::Equal {
        return by_phase;
    }

    let by_ready = a.is_ready().cmp(&b.is_ready());
    if by_ready != Ordering::Equal {
        return by_ready;
    }

    let by_cost = pod_deletion_cost(a).cmp(&pod_deletion_cost(b));
    if by_cost != Ordering::Equal {
        return by_cost;
    }

    // missing deadline counts as the earliest
    let by_deadline = pod_deadline(a).cmp(&pod_deadline(b));
    if by_deadline != Ordering::Equal {
        return by_deadline;
    }

    // cordoned first
    let by_cordon = is_pod_cordon(b).cmp(&is_pod_cordon(a));
    if by_cordon != Ordering::Equal {
        return by_cordon;
    }

    let by_ordinal = ordinal(b).cmp(&ordinal(a));
    if by_ordinal != Ordering::Equal {
        return by_ordinal;
    }

    if a.is_ready() && b.is_ready() {
        let by_ready_time = after_or_zero(a.ready_since(), b.ready_since());
        if by_ready_time != Ordering::Equal {
            return by_ready_time;
        }
    }

    after_or_zero(
        a.metadata.creation_timestamp,
        b.metadata.creation_timestamp,
    )
    .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

pub fn sort_active(pods: &mut [Arc<Pod>]) {
    pods.sort_by(|a, b| compare_active(a, b));
}

/// Sort, then split so the first part holds the `n` best deletion
/// candidates. `n` is clamped to the slice length.
pub fn split_active_pods(mut pods: Vec<Arc<Pod>>, n: i64) -> (Vec<Arc<Pod>>, Vec<Arc<Pod>>) {
    sort_active(&mut pods);
    let pivot = clamp(n, 0, pods.len() as i64) as usize;
    let rest = pods.split_off(pivot);
    (pods, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::keys::{ANNOTATION_POD_CORDON, ANNOTATION_POD_DEADLINE, ANNOTATION_POD_DELETION_COST};
    use crate::api::workload::POD_READY;
    use crate::api::{ConditionStatus, PodCondition};
    use chrono::Duration;
    use rstest::rstest;

    fn pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = name.into();
        pod.spec.node_name = "node".into();
        pod.status.phase = PodPhase::Running;
        pod
    }

    fn ready(mut pod: Pod, since: Option<DateTime<Utc>>) -> Pod {
        pod.status.conditions.push(PodCondition {
            condition_type: POD_READY.into(),
            status: ConditionStatus::True,
            last_transition_time: since,
            ..Default::default()
        });
        pod
    }

    fn annotate(mut pod: Pod, key: &str, value: &str) -> Pod {
        pod.metadata.annotations.insert(key.into(), value.into());
        pod
    }

    fn unassigned(mut pod: Pod) -> Pod {
        pod.spec.node_name.clear();
        pod
    }

    fn phase(mut pod: Pod, phase: PodPhase) -> Pod {
        pod.status.phase = phase;
        pod
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_800_000_000, 0).unwrap()
    }

    #[rstest]
    #[case::unassigned_first(unassigned(pod("a-0")), pod("a-1"))]
    #[case::pending_before_unknown(phase(pod("a-0"), PodPhase::Pending), phase(pod("a-1"), PodPhase::Unknown))]
    #[case::unknown_before_running(phase(pod("a-0"), PodPhase::Unknown), pod("a-1"))]
    #[case::not_ready_first(pod("a-0"), ready(pod("a-1"), None))]
    #[case::lower_cost_first(
        annotate(pod("a-0"), ANNOTATION_POD_DELETION_COST, "-1"),
        pod("a-1")
    )]
    #[case::earlier_deadline_first(
        annotate(pod("a-0"), ANNOTATION_POD_DEADLINE, "2026-01-01T00:00:00Z"),
        annotate(pod("a-1"), ANNOTATION_POD_DEADLINE, "2026-06-01T00:00:00Z")
    )]
    #[case::cordoned_first(annotate(pod("a-0"), ANNOTATION_POD_CORDON, "true"), pod("a-1"))]
    #[case::higher_ordinal_first(pod("a-9"), pod("a-1"))]
    #[case::recently_ready_first(
        ready(pod("a-1"), Some(now())),
        ready(pod("a-1"), Some(now() - Duration::minutes(5)))
    )]
    fn test_compare_active(#[case] first: Pod, #[case] second: Pod) {
        assert_eq!(compare_active(&first, &second), Ordering::Less);
        assert_eq!(compare_active(&second, &first), Ordering::Greater);
    }

    #[test]
    fn test_newer_creation_first() {
        let mut older = pod("a-1");
        older.metadata.creation_timestamp = Some(now() - Duration::hours(1));
        let mut newer = pod("a-1");
        newer.metadata.creation_timestamp = Some(now());
        let unknown = pod("a-1");

        assert_eq!(compare_active(&newer, &older), Ordering::Less);
        assert_eq!(compare_active(&unknown, &newer), Ordering::Less);
    }

    #[test]
    fn test_split_active_pods_clamps() {
        let pods: Vec<Arc<Pod>> = (0..3).map(|i| Arc::new(pod(&format!("a-{i}")))).collect();

        let (victims, kept) = split_active_pods(pods.clone(), 1);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].metadata.name, "a-2");
        assert_eq!(kept.len(), 2);

        let (victims, kept) = split_active_pods(pods.clone(), 10);
        assert_eq!(victims.len(), 3);
        assert!(kept.is_empty());

        let (victims, kept) = split_active_pods(pods, -1);
        assert!(victims.is_empty());
        assert_eq!(kept.len(), 3);
    }
}
