//! Multi-record transactions.

use crate::domain::model::{Nexus, NexusId, Pool, PoolId, Replica, ReplicaId, Volume, VolumeId};
use crate::error::{Error, Result};

use super::snapshot::Tables;

#[derive(Debug, Clone)]
pub(crate) enum Op {
    PutVolume(Volume),
    DeleteVolume(VolumeId, u64),
    PutReplica(Replica),
    DeleteReplica(ReplicaId, u64),
    PutNexus(Nexus),
    DeleteNexus(NexusId, u64),
    PutPool(Pool),
    DeletePool(PoolId, u64),
}

/// A set of puts and deletes applied atomically by `VolumeStore::commit`.
///
/// Each record carries the version it was read at. A put with version `0`
/// inserts and fails if the record exists; any other version must match the
/// stored one. Deleting a record that is already gone is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub(crate) ops: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn put_volume(&mut self, volume: Volume) -> &mut Self {
        self.ops.push(Op::PutVolume(volume));
        self
    }

    pub fn delete_volume(&mut self, volume: &Volume) -> &mut Self {
        self.ops
            .push(Op::DeleteVolume(volume.id.clone(), volume.version));
        self
    }

    pub fn put_replica(&mut self, replica: Replica) -> &mut Self {
        self.ops.push(Op::PutReplica(replica));
        self
    }

    pub fn delete_replica(&mut self, replica: &Replica) -> &mut Self {
        self.ops
            .push(Op::DeleteReplica(replica.id.clone(), replica.version));
        self
    }

    pub fn put_nexus(&mut self, nexus: Nexus) -> &mut Self {
        self.ops.push(Op::PutNexus(nexus));
        self
    }

    pub fn delete_nexus(&mut self, nexus: &Nexus) -> &mut Self {
        self.ops.push(Op::DeleteNexus(nexus.id.clone(), nexus.version));
        self
    }

    pub fn put_pool(&mut self, pool: Pool) -> &mut Self {
        self.ops.push(Op::PutPool(pool));
        self
    }

    pub fn delete_pool(&mut self, pool: &Pool) -> &mut Self {
        self.ops.push(Op::DeletePool(pool.id.clone(), pool.version));
        self
    }
}

// =============================================================================
// Apply
// =============================================================================

fn check(kind: &'static str, id: &str, supplied: u64, stored: Option<u64>) -> Result<u64> {
    let found = stored.unwrap_or(0);
    if supplied != found {
        return Err(Error::Conflict {
            kind,
            id: id.to_string(),
            expected: supplied,
            found,
        });
    }
    Ok(found + 1)
}

macro_rules! put {
    ($map:expr, $kind:literal, $rec:expr) => {{
        let mut rec = $rec;
        let stored = $map.get(&rec.id).map(|r| r.version);
        rec.version = check($kind, rec.id.as_str(), rec.version, stored)?;
        $map.insert(rec.id.clone(), rec);
    }};
}

macro_rules! delete {
    ($map:expr, $kind:literal, $id:expr, $version:expr) => {{
        if let Some(stored) = $map.get(&$id).map(|r| r.version) {
            check($kind, $id.as_str(), $version, Some(stored))?;
            $map.remove(&$id);
        }
    }};
}

impl Tables {
    /// Apply every operation in order, bumping versions as records change.
    ///
    /// On error `self` may be partially modified; callers apply to a scratch
    /// copy and publish it only on success.
    pub(crate) fn apply(&mut self, txn: Txn) -> Result<()> {
        for op in txn.ops {
            match op {
                Op::PutVolume(v) => put!(self.volumes, "volume", v),
                Op::DeleteVolume(id, version) => delete!(self.volumes, "volume", id, version),
                Op::PutReplica(r) => put!(self.replicas, "replica", r),
                Op::DeleteReplica(id, version) => delete!(self.replicas, "replica", id, version),
                Op::PutNexus(n) => put!(self.nexuses, "nexus", n),
                Op::DeleteNexus(id, version) => delete!(self.nexuses, "nexus", id, version),
                Op::PutPool(p) => put!(self.pools, "pool", p),
                Op::DeletePool(id, version) => delete!(self.pools, "pool", id, version),
            }
        }
        self.revision += 1;
        Ok(())
    }
}
