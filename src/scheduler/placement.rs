//! Replica placement.
//!
//! Pure pool selection: no I/O, no store access. Candidates are pools on
//! Online nodes with enough free space, ranked by ascending used/total ratio
//! with ties broken by node id and then pool id, so the result is fully
//! deterministic for a given inventory.

use std::collections::BTreeSet;

use crate::domain::model::{NodeId, Pool, PoolId};
use crate::error::{Error, Result};

/// Constraints for one placement decision.
#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    /// Bytes each replica needs
    pub size: u64,
    /// Number of pools to select
    pub count: usize,
    /// Nodes that must not be used at all (failed in an earlier attempt)
    pub exclude_nodes: BTreeSet<NodeId>,
    /// Nodes that already host a replica of the volume
    pub avoid_nodes: BTreeSet<NodeId>,
    /// Allow a second pool on an already chosen node when distinct nodes
    /// run out
    pub allow_colocation: bool,
}

impl PlacementRequest {
    pub fn new(size: u64, count: usize) -> Self {
        Self {
            size,
            count,
            ..Default::default()
        }
    }
}

/// Chosen pools in preference order.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub pools: Vec<Pool>,
    /// Set when anti-affinity had to be relaxed
    pub relaxed: bool,
}

impl Placement {
    pub fn distinct_nodes(&self) -> usize {
        self.pools
            .iter()
            .map(|p| &p.node)
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Rank eligible pools, best first.
pub fn rank_pools<'a>(
    pools: impl IntoIterator<Item = &'a Pool>,
    online: &BTreeSet<NodeId>,
    request: &PlacementRequest,
) -> Vec<&'a Pool> {
    let mut ranked: Vec<&Pool> = pools
        .into_iter()
        .filter(|p| online.contains(&p.node))
        .filter(|p| !request.exclude_nodes.contains(&p.node))
        .filter(|p| p.capacity > 0 && p.free() >= request.size)
        .collect();

    ranked.sort_by(|a, b| {
        a.usage_ratio()
            .total_cmp(&b.usage_ratio())
            .then_with(|| a.node.cmp(&b.node))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// Select `request.count` pools.
///
/// Each node contributes at most one pool and nodes in `avoid_nodes` are
/// skipped. Only when that leaves too few pools and `allow_colocation` is
/// set are further pools taken from nodes that were already chosen.
pub fn select_pools<'a>(
    pools: impl IntoIterator<Item = &'a Pool>,
    online: &BTreeSet<NodeId>,
    request: &PlacementRequest,
) -> Result<Placement> {
    if request.count == 0 {
        return Ok(Placement {
            pools: Vec::new(),
            relaxed: false,
        });
    }

    let ranked = rank_pools(pools, online, request);
    let mut chosen: Vec<&Pool> = Vec::with_capacity(request.count);
    let mut used_nodes: BTreeSet<&NodeId> = BTreeSet::new();

    for pool in &ranked {
        if chosen.len() == request.count {
            break;
        }
        if request.avoid_nodes.contains(&pool.node) || used_nodes.contains(&pool.node) {
            continue;
        }
        used_nodes.insert(&pool.node);
        chosen.push(pool);
    }

    let mut relaxed = false;
    if chosen.len() < request.count && request.allow_colocation {
        let taken: BTreeSet<&PoolId> = chosen.iter().map(|p| &p.id).collect();
        let extra: Vec<&Pool> = ranked
            .iter()
            .copied()
            .filter(|p| !taken.contains(&p.id))
            .take(request.count - chosen.len())
            .collect();
        relaxed = !extra.is_empty();
        chosen.extend(extra);
    }

    if chosen.len() < request.count {
        return Err(Error::InsufficientResources(format!(
            "need {} pools with {} free bytes on distinct online nodes, found {}",
            request.count,
            request.size,
            chosen.len()
        )));
    }

    Ok(Placement {
        pools: chosen.into_iter().cloned().collect(),
        relaxed,
    })
}
