//! Inter-pod constraints during a simulation.
//!
//! Tracks where every pod the simulation knows about sits (existing node
//! or proposed node, and zone once known) so affinity, anti-affinity and
//! topology spread can be evaluated for the next placement.

use std::collections::BTreeSet;

use flotilla_id::NodeId;

use crate::constraints::{labels, Incompatibility, Labels, PodAffinityTerm, Requirement, TopologyKey};
use crate::state::{ClusterSnapshot, PodRecord};

/// A placement target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Host {
    Node(NodeId),
    /// A node the simulation proposes, by bin id.
    Proposed(usize),
}

#[derive(Debug, Clone)]
struct Placed {
    labels: Labels,
    anti_affinity: Vec<PodAffinityTerm>,
    /// Unknown until a proposed node settles on a zone.
    zone: Option<String>,
    host: Host,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Topology {
    placed: Vec<Placed>,
    /// Every zone a pod could land in.
    zones: BTreeSet<String>,
}

impl Topology {
    /// Seed with the pods bound in `snapshot`.
    pub(crate) fn new(snapshot: &ClusterSnapshot, mut zones: BTreeSet<String>) -> Self {
        zones.extend(snapshot.zones());

        let placed = snapshot
            .pods()
            .filter(|p| !p.pod.terminating)
            .filter_map(|p| {
                let node = snapshot.node(&p.bound_to?)?;
                Some(Placed {
                    labels: p.pod.labels.clone(),
                    anti_affinity: p.pod.constraints.anti_affinity.clone(),
                    zone: Some(node.zone.clone()),
                    host: Host::Node(node.id),
                })
            })
            .collect();

        Self { placed, zones }
    }

    pub(crate) fn place(&mut self, pod: &PodRecord, zone: Option<&str>, host: Host) {
        self.placed.push(Placed {
            labels: pod.pod.labels.clone(),
            anti_affinity: pod.pod.constraints.anti_affinity.clone(),
            zone: zone.map(str::to_string),
            host,
        });
    }

    /// Record the zone a proposed node settled on.
    pub(crate) fn pin(&mut self, host: Host, zone: &str) {
        for placed in self.placed.iter_mut().filter(|p| p.host == host) {
            placed.zone = Some(zone.to_string());
        }
    }

    /// Forget pods on a proposed node that was dropped.
    pub(crate) fn remove_host(&mut self, host: Host) {
        self.placed.retain(|p| p.host != host);
    }

    /// Whether the pod's placement depends on which zone it lands in.
    pub(crate) fn zone_sensitive(&self, pod: &PodRecord) -> bool {
        let constraints = &pod.pod.constraints;
        let own = constraints
            .affinity
            .iter()
            .chain(&constraints.anti_affinity)
            .any(|t| t.topology_key == TopologyKey::Zone)
            || constraints
                .topology_spread
                .iter()
                .any(|c| c.is_required() && c.topology_key == TopologyKey::Zone);

        own || self.placed.iter().any(|q| {
            q.anti_affinity.iter().any(|t| {
                t.topology_key == TopologyKey::Zone && t.selector.matches(&pod.pod.labels)
            })
        })
    }

    fn same_domain(key: TopologyKey, placed: &Placed, zone: Option<&str>, host: Host) -> bool {
        match key {
            TopologyKey::Hostname => placed.host == host,
            TopologyKey::Zone => zone.is_some() && placed.zone.as_deref() == zone,
        }
    }

    /// Check the pod's inter-pod constraints for a placement.
    ///
    /// With `zone` unknown, zone-keyed rules are not evaluated.
    pub(crate) fn check(
        &self,
        pod: &PodRecord,
        zone: Option<&str>,
        host: Host,
    ) -> Result<(), Incompatibility> {
        let constraints = &pod.pod.constraints;
        let skip = |key: TopologyKey| key == TopologyKey::Zone && zone.is_none();

        for term in constraints.anti_affinity.iter().filter(|t| !skip(t.topology_key)) {
            let conflict = self.placed.iter().any(|q| {
                Self::same_domain(term.topology_key, q, zone, host) && term.selector.matches(&q.labels)
            });
            if conflict {
                return Err(Incompatibility::AntiAffinity(term.topology_key));
            }
        }

        for q in &self.placed {
            for term in q.anti_affinity.iter().filter(|t| !skip(t.topology_key)) {
                if Self::same_domain(term.topology_key, q, zone, host)
                    && term.selector.matches(&pod.pod.labels)
                {
                    return Err(Incompatibility::AntiAffinity(term.topology_key));
                }
            }
        }

        for term in constraints.affinity.iter().filter(|t| !skip(t.topology_key)) {
            let mut matching = self.placed.iter().filter(|q| term.selector.matches(&q.labels)).peekable();
            if matching.peek().is_none() {
                // The first pod of a self-affine set may go anywhere.
                if term.selector.matches(&pod.pod.labels) {
                    continue;
                }
                return Err(Incompatibility::Affinity(term.topology_key));
            }
            if !matching.any(|q| Self::same_domain(term.topology_key, q, zone, host)) {
                return Err(Incompatibility::Affinity(term.topology_key));
            }
        }

        for spread in constraints
            .topology_spread
            .iter()
            .filter(|c| c.is_required() && !skip(c.topology_key))
        {
            let count_in = |zone: Option<&str>, host: Host| {
                self.placed
                    .iter()
                    .filter(|q| {
                        Self::same_domain(spread.topology_key, q, zone, host)
                            && spread.selector.matches(&q.labels)
                    })
                    .count() as u64
            };

            let here = count_in(zone, host);
            // A new node can always open an empty hostname domain.
            let min = match spread.topology_key {
                TopologyKey::Hostname => 0,
                TopologyKey::Zone => self
                    .eligible_zones(pod)
                    .map(|z| count_in(Some(z), host))
                    .min()
                    .unwrap_or(0),
            };

            if (here + 1).saturating_sub(min) > u64::from(spread.max_skew) {
                return Err(Incompatibility::TopologySpread {
                    key: spread.topology_key,
                    max_skew: spread.max_skew,
                });
            }
        }

        Ok(())
    }

    /// Zones the pod's node requirements allow.
    fn eligible_zones<'a>(&'a self, pod: &'a PodRecord) -> impl Iterator<Item = &'a str> + 'a {
        self.zones
            .iter()
            .map(String::as_str)
            .filter(|z| pod.pod.constraints.node_requirements.allows(labels::ZONE, Some(*z)))
    }

    /// Matching pods per zone, summed over the pod's zone spread rules.
    fn spread_load(&self, pod: &PodRecord, zone: &str) -> usize {
        pod.pod
            .constraints
            .topology_spread
            .iter()
            .filter(|c| c.is_required() && c.topology_key == TopologyKey::Zone)
            .map(|c| {
                self.placed
                    .iter()
                    .filter(|q| q.zone.as_deref() == Some(zone) && c.selector.matches(&q.labels))
                    .count()
            })
            .sum()
    }

    /// Pick the zone for a proposed node: least spread load first, then by
    /// name, among the zones where every constraint holds.
    pub(crate) fn choose_zone<'z>(
        &self,
        pod: &PodRecord,
        candidates: impl IntoIterator<Item = &'z str>,
        host: Host,
    ) -> Result<String, Incompatibility> {
        let mut ranked: Vec<(usize, &str)> = candidates
            .into_iter()
            .map(|z| (self.spread_load(pod, z), z))
            .collect();
        ranked.sort();
        ranked.dedup();

        let mut last = Incompatibility::Requirement(Requirement::exists(labels::ZONE));
        for (_, zone) in ranked {
            match self.check(pod, Some(zone), host) {
                Ok(()) => return Ok(zone.to_string()),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}
