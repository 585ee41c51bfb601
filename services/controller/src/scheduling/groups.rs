//! Splitting a batch into independent scheduling groups.
//!
//! Two pending pods belong to the same group when an affinity,
//! anti-affinity or spread selector of one matches the labels of the other.
//! Pods that neither carry nor attract inter-pod constraints all land in a
//! single free group, so first-fit-decreasing packs across all of them.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::state::PodRecord;

/// Pods that must be scheduled together.
#[derive(Debug, Clone)]
pub struct SchedulingGroup {
    /// In pod id order.
    pub pods: Vec<Arc<PodRecord>>,
    /// Some pod in the group carries inter-pod constraints.
    pub constrained: bool,
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn related(a: &PodRecord, b: &PodRecord) -> bool {
    a.pod.constraints.pod_selectors().any(|s| s.matches(&b.pod.labels))
        || b.pod.constraints.pod_selectors().any(|s| s.matches(&a.pod.labels))
}

/// Partition `pods` into groups. Constrained groups come first, ordered by
/// their smallest pod id; the free group comes last.
pub fn partition(pods: &[Arc<PodRecord>]) -> Vec<SchedulingGroup> {
    let mut pods = pods.to_vec();
    pods.sort_by_key(|p| p.id());
    pods.dedup_by_key(|p| p.id());

    let mut parent: Vec<usize> = (0..pods.len()).collect();
    for i in 0..pods.len() {
        for j in (i + 1)..pods.len() {
            if related(&pods[i], &pods[j]) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<Arc<PodRecord>>> = BTreeMap::new();
    for (i, pod) in pods.iter().enumerate() {
        let root = find(&mut parent, i);
        components.entry(root).or_default().push(Arc::clone(pod));
    }

    let mut groups = Vec::new();
    let mut free: Vec<Arc<PodRecord>> = Vec::new();
    for (_, members) in components {
        let constrained = members.len() > 1 || members.iter().any(|p| p.pod.constraints.has_pod_constraints());
        if constrained {
            groups.push(SchedulingGroup {
                pods: members,
                constrained,
            });
        } else {
            free.extend(members);
        }
    }

    if !free.is_empty() {
        free.sort_by_key(|p| p.id());
        groups.push(SchedulingGroup {
            pods: free,
            constrained: false,
        });
    }

    groups
}

/// Size of every group, for logging.
pub fn group_sizes(groups: &[SchedulingGroup]) -> Vec<usize> {
    groups.iter().map(|g| g.pods.len()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::{LabelSelector, PodAffinityTerm, TopologyKey};
    use crate::resources::Resources;
    use crate::state::PodObject;
    use flotilla_id::{PodId, ResourceVersion};

    fn ids(group: &SchedulingGroup) -> Vec<PodId> {
        group.pods.iter().map(|p| p.id()).collect()
    }

    fn pod(app: &str) -> PodObject {
        let mut pod = PodObject::pending("default", app, Resources::cores_gib(1, 1));
        pod.labels.insert("app".into(), app.into());
        pod
    }

    fn record(pod: PodObject) -> Arc<PodRecord> {
        Arc::new(PodRecord {
            pod,
            bound_to: None,
            resource_version: ResourceVersion::new(1),
        })
    }

    #[test]
    fn test_unconstrained_pods_share_one_group() {
        let pods: Vec<_> = (0..4).map(|_| record(pod("web"))).collect();
        let groups = partition(&pods);
        assert_eq!(group_sizes(&groups), vec![4]);
        assert!(!groups[0].constrained);
    }

    #[test]
    fn test_related_pods_grouped_before_free() {
        let mut web = pod("web");
        web.constraints.anti_affinity.push(PodAffinityTerm::new(
            LabelSelector::labels([("app", "db")]),
            TopologyKey::Zone,
        ));
        let web = record(web);
        let db = record(pod("db"));
        let batch = record(pod("batch"));

        let groups = partition(&[batch.clone(), db.clone(), web.clone()]);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].constrained);

        let mut constrained = ids(&groups[0]);
        constrained.sort();
        let mut expected = vec![web.id(), db.id()];
        expected.sort();
        assert_eq!(constrained, expected);
        assert_eq!(ids(&groups[1]), vec![batch.id()]);
    }

    #[test]
    fn test_self_constrained_singleton_is_its_own_group() {
        let mut solo = pod("solo");
        solo.constraints.anti_affinity.push(PodAffinityTerm::new(
            LabelSelector::labels([("app", "solo")]),
            TopologyKey::Hostname,
        ));
        let groups = partition(&[record(solo), record(pod("web"))]);
        assert_eq!(group_sizes(&groups), vec![1, 1]);
        assert!(groups[0].constrained);
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let web = record(pod("web"));
        let groups = partition(&[web.clone(), web]);
        assert_eq!(group_sizes(&groups), vec![1]);
    }
}
