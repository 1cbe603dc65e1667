//! Partition assignment planning.
//!
//! The leader recomputes the full assignment whenever membership or a
//! partition's required size changes. Planning is a pure function of the
//! observed state, so every process that runs it over the same inputs
//! produces the same plan, and applying the planner to its own output
//! changes nothing.
//!
//! The default policy is data-center aware: replicas of a partition prefer
//! distinct data centers, and total load is kept within one partition of
//! even across candidates.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use super::address::{Address, DataCenterResolver};
use super::{MemberSet, PartitionKey, PartitionMap};

/// Inputs to one planning pass.
pub struct RebalanceContext<'a> {
    /// Current assignment, including keys with empty member sets.
    pub current: &'a PartitionMap,
    /// Live members.
    pub members: &'a MemberSet,
    /// Required replication factor per partition. Missing entries default
    /// to 1.
    pub required: &'a BTreeMap<PartitionKey, u32>,
    /// Current leader, excluded from assignment under the spare-leader
    /// policy.
    pub leader: Option<&'a Address>,
}

/// Pluggable assignment policy.
///
/// Implementations must be deterministic and idempotent:
/// `plan(plan(x)) == plan(x)` for any input `x`.
pub trait RebalancePolicy: Send + Sync {
    fn plan(&self, ctx: RebalanceContext<'_>) -> PartitionMap;
}

/// Data-center aware assignment with optional spare-leader policy.
pub struct DataCenterAware {
    spare_leader: bool,
    resolver: DataCenterResolver,
}

impl DataCenterAware {
    pub fn new(spare_leader: bool, resolver: DataCenterResolver) -> Self {
        Self { spare_leader, resolver }
    }

    fn data_centers(&self, members: &MemberSet) -> BTreeSet<String> {
        members.iter().map(|a| (self.resolver)(a)).collect()
    }
}

impl RebalancePolicy for DataCenterAware {
    fn plan(&self, ctx: RebalanceContext<'_>) -> PartitionMap {
        let mut candidates: Vec<Address> = ctx.members.iter().cloned().collect();
        if self.spare_leader {
            if let Some(leader) = ctx.leader {
                candidates.retain(|a| a != leader);
            }
        }

        if candidates.is_empty() {
            if !ctx.current.is_empty() {
                warn!("no assignment candidates; emptying all partition assignments");
            }
            return ctx
                .current
                .keys()
                .map(|k| (k.clone(), MemberSet::new()))
                .collect();
        }

        let candidate_set: BTreeSet<&Address> = candidates.iter().collect();
        let mut load: BTreeMap<Address, usize> =
            candidates.iter().map(|a| (a.clone(), 0)).collect();

        // Phase 1a: drop members that are no longer candidates.
        let mut plan: PartitionMap = BTreeMap::new();
        for (key, assigned) in ctx.current {
            let kept: MemberSet = assigned
                .iter()
                .filter(|a| candidate_set.contains(a))
                .cloned()
                .collect();
            for member in &kept {
                if let Some(carried) = load.get_mut(member) {
                    *carried += 1;
                }
            }
            plan.insert(key.clone(), kept);
        }

        // Phase 1b: compensate each partition toward its required size.
        let mut warned_insufficient = false;
        for (key, assignment) in plan.iter_mut() {
            let required = ctx.required.get(key).copied().unwrap_or(1) as usize;
            let target = required.min(candidates.len());
            if required > candidates.len() && !warned_insufficient {
                warn!(
                    partition = %key,
                    required,
                    candidates = candidates.len(),
                    "fewer candidates than required replicas; assigning all candidates"
                );
                warned_insufficient = true;
            }

            while assignment.len() > target {
                let Some(victim) = assignment
                    .iter()
                    .max_by_key(|a| (load.get(*a).copied().unwrap_or(0), (*a).clone()))
                    .cloned()
                else {
                    break;
                };
                assignment.remove(&victim);
                if let Some(carried) = load.get_mut(&victim) {
                    *carried -= 1;
                }
            }

            while assignment.len() < target {
                let covered: BTreeSet<String> =
                    assignment.iter().map(|a| (self.resolver)(a)).collect();
                let Some(pick) = candidates
                    .iter()
                    .filter(|a| !assignment.contains(*a))
                    .min_by_key(|a| {
                        (
                            covered.contains(&(self.resolver)(a)),
                            load.get(*a).copied().unwrap_or(0),
                            (*a).clone(),
                        )
                    })
                    .cloned()
                else {
                    break;
                };
                assignment.insert(pick.clone());
                if let Some(carried) = load.get_mut(&pick) {
                    *carried += 1;
                }
            }
        }

        // Phase 2: even out total load across candidates, never shrinking a
        // partition's data-center spread.
        let total: usize = plan.values().map(MemberSet::len).sum();
        let ceil = total.div_ceil(candidates.len());
        let floor = total / candidates.len();
        loop {
            let Some(heavy) = load
                .iter()
                .filter(|(_, l)| **l > ceil)
                .max_by_key(|(a, l)| (**l, (*a).clone()))
                .map(|(a, _)| a.clone())
            else {
                break;
            };
            let Some(light) = load
                .iter()
                .filter(|(_, l)| **l < floor)
                .min_by_key(|(a, l)| (**l, (*a).clone()))
                .map(|(a, _)| a.clone())
            else {
                break;
            };

            let mut moved = false;
            for assignment in plan.values_mut() {
                if !assignment.contains(&heavy) || assignment.contains(&light) {
                    continue;
                }
                let spread_before = self.data_centers(assignment).len();
                let mut shifted = assignment.clone();
                shifted.remove(&heavy);
                shifted.insert(light.clone());
                if self.data_centers(&shifted).len() < spread_before {
                    continue;
                }
                *assignment = shifted;
                if let Some(carried) = load.get_mut(&heavy) {
                    *carried -= 1;
                }
                if let Some(carried) = load.get_mut(&light) {
                    *carried += 1;
                }
                moved = true;
                break;
            }
            if !moved {
                break;
            }
        }

        plan
    }
}
