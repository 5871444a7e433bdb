//! Property-Based Tests for Replica Placement
//!
//! # Test Properties
//!
//! 1. **Anti-affinity**: replicas never share a node while enough eligible
//!    nodes exist
//! 2. **Eligibility**: every chosen pool is on an Online, non-excluded node
//!    and has room for the replica
//! 3. **Determinism**: input order does not change the result
//! 4. **Strict avoidance**: nodes already hosting the volume are never chosen

#![cfg(test)]

use std::collections::BTreeSet;

use proptest::prelude::*;

use super::placement::{select_pools, PlacementRequest};
use crate::domain::model::{NodeId, Pool, PoolId};

// =============================================================================
// Property Strategies
// =============================================================================

/// Up to 8 nodes with 1-3 pools each and a random online mask.
fn inventory_strategy() -> impl Strategy<Value = (Vec<Pool>, BTreeSet<NodeId>)> {
    (1usize..=8)
        .prop_flat_map(|nodes| {
            let pools = prop::collection::vec((0..nodes, 1u64..1000, 0u64..=100), 1..=nodes * 3);
            let online = prop::collection::vec(any::<bool>(), nodes);
            (pools, online)
        })
        .prop_map(|(specs, online)| {
            let pools = specs
                .into_iter()
                .enumerate()
                .map(|(i, (node, capacity, used_pct))| {
                    let mut pool = Pool::new(
                        PoolId::new(format!("pool-{:02}", i)),
                        NodeId::new(format!("node-{}", node)),
                        capacity,
                    );
                    pool.used = capacity * used_pct / 100;
                    pool
                })
                .collect();
            let online = online
                .into_iter()
                .enumerate()
                .filter(|(_, up)| *up)
                .map(|(i, _)| NodeId::new(format!("node-{}", i)))
                .collect();
            (pools, online)
        })
}

fn eligible_nodes(pools: &[Pool], online: &BTreeSet<NodeId>, size: u64) -> BTreeSet<NodeId> {
    pools
        .iter()
        .filter(|p| online.contains(&p.node) && p.free() >= size)
        .map(|p| p.node.clone())
        .collect()
}

// =============================================================================
// Anti-affinity Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: without relaxation, every chosen pool sits on its own node.
    #[test]
    fn prop_never_colocates_without_relaxation(
        (pools, online) in inventory_strategy(),
        size in 1u64..500,
        count in 1usize..=4,
    ) {
        let request = PlacementRequest::new(size, count);
        let eligible = eligible_nodes(&pools, &online, size);

        match select_pools(&pools, &online, &request) {
            Ok(placement) => {
                prop_assert_eq!(placement.pools.len(), count);
                prop_assert_eq!(placement.distinct_nodes(), count);
                prop_assert!(!placement.relaxed);
            }
            Err(_) => prop_assert!(eligible.len() < count),
        }
    }

    /// Property: relaxation is only used when distinct nodes run out.
    #[test]
    fn prop_relaxes_only_when_needed(
        (pools, online) in inventory_strategy(),
        size in 1u64..500,
        count in 1usize..=4,
    ) {
        let mut request = PlacementRequest::new(size, count);
        request.allow_colocation = true;
        let eligible = eligible_nodes(&pools, &online, size);

        if let Ok(placement) = select_pools(&pools, &online, &request) {
            prop_assert_eq!(placement.pools.len(), count);
            if eligible.len() >= count {
                prop_assert!(!placement.relaxed);
                prop_assert_eq!(placement.distinct_nodes(), count);
            } else {
                prop_assert_eq!(placement.distinct_nodes(), eligible.len());
            }
        }
    }

    /// Property: chosen pools are eligible and avoided nodes are untouched.
    #[test]
    fn prop_chosen_pools_are_eligible(
        (pools, online) in inventory_strategy(),
        size in 1u64..500,
        count in 1usize..=3,
        avoid in prop::collection::btree_set(0usize..8, 0..3),
        exclude in prop::collection::btree_set(0usize..8, 0..2),
    ) {
        let mut request = PlacementRequest::new(size, count);
        request.avoid_nodes = avoid.iter().map(|i| NodeId::new(format!("node-{}", i))).collect();
        request.exclude_nodes = exclude.iter().map(|i| NodeId::new(format!("node-{}", i))).collect();

        if let Ok(placement) = select_pools(&pools, &online, &request) {
            for pool in &placement.pools {
                prop_assert!(online.contains(&pool.node));
                prop_assert!(pool.free() >= size);
                prop_assert!(!request.avoid_nodes.contains(&pool.node));
                prop_assert!(!request.exclude_nodes.contains(&pool.node));
            }
        }
    }

    /// Property: the result does not depend on inventory order.
    #[test]
    fn prop_placement_is_deterministic(
        (pools, online) in inventory_strategy(),
        size in 1u64..500,
        count in 1usize..=3,
    ) {
        let request = PlacementRequest::new(size, count);
        let mut reversed = pools.clone();
        reversed.reverse();

        let forward = select_pools(&pools, &online, &request).ok();
        let backward = select_pools(&reversed, &online, &request).ok();
        prop_assert_eq!(forward, backward);
    }
}
