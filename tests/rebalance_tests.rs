//! Property-style tests for the data-center aware rebalance policy.

use std::collections::BTreeMap;
use std::sync::Arc;

use menagerie::cluster::{
    Address, DataCenterAware, DataCenterResolver, MemberSet, PartitionKey, PartitionMap,
    RebalanceContext, RebalancePolicy,
};

fn member(dc: u16, n: u16) -> Address {
    Address::new(format!("10.{dc}.0.{n}"), 9000)
}

/// Data center is the second host octet.
fn dc_resolver() -> DataCenterResolver {
    Arc::new(|a: &Address| a.host.split('.').nth(1).unwrap_or("0").to_string())
}

fn scenario(partitions: usize, sizes: &[u32]) -> (PartitionMap, BTreeMap<PartitionKey, u32>) {
    let mut current = PartitionMap::new();
    let mut required = BTreeMap::new();
    for i in 0..partitions {
        let key = PartitionKey::from(format!("partition-{i}").as_bytes());
        current.insert(key.clone(), MemberSet::new());
        required.insert(key, sizes[i % sizes.len()]);
    }
    (current, required)
}

#[test]
fn plan_is_idempotent_across_shapes() {
    let policy = DataCenterAware::new(false, dc_resolver());
    let members: MemberSet =
        [member(1, 1), member(1, 2), member(2, 1), member(2, 2), member(3, 1)].into();

    for (partitions, sizes) in
        [(1usize, &[1u32][..]), (5, &[2]), (16, &[1, 2, 3]), (40, &[3, 1])]
    {
        let (current, required) = scenario(partitions, sizes);
        let once = policy.plan(RebalanceContext {
            current: &current,
            members: &members,
            required: &required,
            leader: None,
        });
        let twice = policy.plan(RebalanceContext {
            current: &once,
            members: &members,
            required: &required,
            leader: None,
        });
        assert_eq!(once, twice, "{partitions} partitions with sizes {sizes:?}");
    }
}

#[test]
fn every_partition_reaches_its_target_size() {
    let policy = DataCenterAware::new(false, dc_resolver());
    let members: MemberSet = [member(1, 1), member(1, 2), member(2, 1)].into();
    let (current, required) = scenario(12, &[1, 2, 3, 5]);

    let plan = policy.plan(RebalanceContext {
        current: &current,
        members: &members,
        required: &required,
        leader: None,
    });
    for (key, assigned) in &plan {
        let target = (required[key] as usize).min(members.len());
        assert_eq!(assigned.len(), target, "partition {key}");
    }
}

#[test]
fn replicas_spread_across_data_centers() {
    let policy = DataCenterAware::new(false, dc_resolver());
    let members: MemberSet =
        [member(1, 1), member(1, 2), member(1, 3), member(2, 1), member(3, 1)].into();
    let (current, required) = scenario(10, &[3]);

    let plan = policy.plan(RebalanceContext {
        current: &current,
        members: &members,
        required: &required,
        leader: None,
    });
    let resolver = dc_resolver();
    for assigned in plan.values() {
        let dcs: std::collections::BTreeSet<String> =
            assigned.iter().map(|a| resolver(a)).collect();
        assert_eq!(dcs.len(), 3, "three replicas must cover all three data centers");
    }
}

#[test]
fn load_stays_within_one_partition_of_even() {
    let policy = DataCenterAware::new(false, dc_resolver());
    let members: MemberSet = [member(1, 1), member(1, 2), member(2, 1), member(2, 2)].into();
    let (current, required) = scenario(20, &[2]);

    let plan = policy.plan(RebalanceContext {
        current: &current,
        members: &members,
        required: &required,
        leader: None,
    });
    let total: usize = plan.values().map(MemberSet::len).sum();
    let ceil = total.div_ceil(members.len());
    let floor = total / members.len();
    for candidate in &members {
        let carried = plan.values().filter(|s| s.contains(candidate)).count();
        assert!(
            carried <= ceil && carried >= floor,
            "{candidate} carries {carried}, expected within [{floor}, {ceil}]"
        );
    }
}

#[test]
fn spare_leader_with_lone_member_empties_the_plan() {
    let policy = DataCenterAware::new(true, dc_resolver());
    let leader = member(1, 1);
    let members: MemberSet = [leader.clone()].into();
    let (current, required) = scenario(3, &[2]);

    let plan = policy.plan(RebalanceContext {
        current: &current,
        members: &members,
        required: &required,
        leader: Some(&leader),
    });
    assert!(plan.values().all(MemberSet::is_empty));
}

#[test]
fn joining_member_relieves_overloaded_peers() {
    let policy = DataCenterAware::new(false, dc_resolver());
    let veteran = member(1, 1);
    let rookie = member(2, 1);

    // everything currently on the veteran
    let mut current = PartitionMap::new();
    let mut required = BTreeMap::new();
    for i in 0..6 {
        let key = PartitionKey::from(format!("p{i}").as_bytes());
        current.insert(key.clone(), MemberSet::from([veteran.clone()]));
        required.insert(key, 1);
    }

    let members: MemberSet = [veteran.clone(), rookie.clone()].into();
    let plan = policy.plan(RebalanceContext {
        current: &current,
        members: &members,
        required: &required,
        leader: None,
    });
    let rookie_count = plan.values().filter(|s| s.contains(&rookie)).count();
    assert_eq!(rookie_count, 3, "half of the partitions must move to the new member");
}
