//! Volume State Store
//!
//! Authoritative, versioned record of volumes, replicas, nexuses and pools.
//!
//! Readers take an immutable [`Snapshot`]; writers submit a [`Txn`] which is
//! validated against per-record versions and published atomically. The lock
//! inside the store guards only the in-memory swap, never a node RPC, so it is
//! not an operation lock: concurrent writers are arbitrated by versions.

mod persist;
mod snapshot;
mod txn;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::model::{Nexus, NexusId, Pool, PoolId, Replica, ReplicaId, Volume, VolumeId};
use crate::domain::ports::{PersistedState, StateBackend};
use crate::error::{Error, Result};

pub use persist::run_persister;
pub use snapshot::{Snapshot, Tables};
pub use txn::Txn;

/// Attempts made by the `update_*` helpers before surfacing a conflict.
pub const CONFLICT_RETRIES: usize = 8;

/// How far the store has been written to its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Durability {
    /// No persister attached; the store lives in memory only
    Detached,
    /// Highest revision the backend holds
    Saved(u64),
    /// The persister stopped on a backend error
    Failed,
}

pub struct VolumeStore {
    current: RwLock<Snapshot>,
    revisions: watch::Sender<u64>,
    durability: watch::Sender<Durability>,
}

impl Default for VolumeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeStore {
    pub fn new() -> Self {
        Self::from_tables(Tables::default())
    }

    fn from_tables(tables: Tables) -> Self {
        let (revisions, _) = watch::channel(tables.revision);
        let (durability, _) = watch::channel(Durability::Detached);
        Self {
            current: RwLock::new(Arc::new(tables)),
            revisions,
            durability,
        }
    }

    /// Rebuild a store from persisted state.
    pub fn restore(state: PersistedState) -> Self {
        Self::from_tables(Tables::from_persisted(state))
    }

    /// Load the store from `backend`, starting empty when nothing was saved.
    pub async fn load(backend: &dyn StateBackend) -> Result<Self> {
        let state = backend.load().await.map_err(|e| {
            Error::Internal(format!(
                "failed to load state from {} backend: {}",
                backend.name(),
                e
            ))
        })?;

        match state {
            Some(state) => {
                info!(
                    backend = backend.name(),
                    revision = state.revision,
                    volumes = state.volumes.len(),
                    replicas = state.replicas.len(),
                    pools = state.pools.len(),
                    "Restored volume store"
                );
                Ok(Self::restore(state))
            }
            None => {
                info!(backend = backend.name(), "No persisted state, starting empty");
                Ok(Self::new())
            }
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.current.read().clone()
    }

    pub fn revision(&self) -> u64 {
        self.current.read().revision
    }

    /// Watch channel carrying the latest committed revision.
    pub fn subscribe_revisions(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    /// Wait until the backend holds `revision` or a later one.
    ///
    /// Returns at once when no persister is attached, and fails once the
    /// persister has stopped on a backend error.
    pub async fn flush(&self, revision: u64) -> Result<()> {
        let mut durability = self.durability.subscribe();
        loop {
            match *durability.borrow_and_update() {
                Durability::Detached => return Ok(()),
                Durability::Saved(saved) if saved >= revision => return Ok(()),
                Durability::Saved(_) => {}
                Durability::Failed => {
                    return Err(Error::Internal(format!(
                        "revision {} was not persisted: state backend failed",
                        revision
                    )))
                }
            }
            if durability.changed().await.is_err() {
                return Err(Error::Cancelled("volume store dropped".into()));
            }
        }
    }

    pub(crate) fn attach_persister(&self) {
        self.durability.send_replace(Durability::Saved(0));
    }

    pub(crate) fn mark_saved(&self, revision: u64) {
        self.durability.send_modify(|d| {
            if let Durability::Saved(saved) = d {
                *saved = (*saved).max(revision);
            }
        });
    }

    pub(crate) fn detach_persister(&self, failed: bool) {
        let state = if failed {
            Durability::Failed
        } else {
            Durability::Detached
        };
        self.durability.send_replace(state);
    }

    /// Atomically apply `txn`; returns the snapshot it produced.
    pub fn commit(&self, txn: Txn) -> Result<Snapshot> {
        if txn.is_empty() {
            return Ok(self.snapshot());
        }

        let ops = txn.len();
        let snapshot = {
            let mut current = self.current.write();
            let mut next = Tables::clone(&current);
            next.apply(txn)?;
            let next = Arc::new(next);
            *current = next.clone();
            next
        };

        debug!(revision = snapshot.revision, ops, "Committed transaction");
        self.revisions.send_replace(snapshot.revision);
        Ok(snapshot)
    }

    /// Build a transaction from a fresh snapshot and commit it, rebuilding
    /// on version conflicts.
    pub fn update<F>(&self, mut build: F) -> Result<Snapshot>
    where
        F: FnMut(&Tables) -> Result<Txn>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let snapshot = self.snapshot();
            let txn = build(&snapshot)?;
            match self.commit(txn) {
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    debug!(attempt, error = %e, "Retrying store update after conflict");
                }
                result => return result,
            }
        }
    }

    // =========================================================================
    // Single-record helpers
    // =========================================================================

    /// Mutate a stored volume in place, retrying on conflict.
    pub fn update_volume<F>(&self, id: &VolumeId, mut f: F) -> Result<Volume>
    where
        F: FnMut(&mut Volume) -> Result<()>,
    {
        let snapshot = self.update(|tables| {
            let mut volume = tables
                .volume(id)
                .cloned()
                .ok_or_else(|| Error::not_found("volume", id))?;
            f(&mut volume)?;
            let mut txn = Txn::new();
            txn.put_volume(volume);
            Ok(txn)
        })?;
        snapshot
            .volume(id)
            .cloned()
            .ok_or_else(|| Error::not_found("volume", id))
    }

    pub fn update_replica<F>(&self, id: &ReplicaId, mut f: F) -> Result<Replica>
    where
        F: FnMut(&mut Replica) -> Result<()>,
    {
        let snapshot = self.update(|tables| {
            let mut replica = tables
                .replica(id)
                .cloned()
                .ok_or_else(|| Error::not_found("replica", id))?;
            f(&mut replica)?;
            let mut txn = Txn::new();
            txn.put_replica(replica);
            Ok(txn)
        })?;
        snapshot
            .replica(id)
            .cloned()
            .ok_or_else(|| Error::not_found("replica", id))
    }

    pub fn update_nexus<F>(&self, id: &NexusId, mut f: F) -> Result<Nexus>
    where
        F: FnMut(&mut Nexus) -> Result<()>,
    {
        let snapshot = self.update(|tables| {
            let mut nexus = tables
                .nexus(id)
                .cloned()
                .ok_or_else(|| Error::not_found("nexus", id))?;
            f(&mut nexus)?;
            let mut txn = Txn::new();
            txn.put_nexus(nexus);
            Ok(txn)
        })?;
        snapshot
            .nexus(id)
            .cloned()
            .ok_or_else(|| Error::not_found("nexus", id))
    }

    /// Insert or refresh a pool record.
    pub fn upsert_pool<F>(&self, id: &PoolId, mut f: F) -> Result<Pool>
    where
        F: FnMut(Option<Pool>) -> Pool,
    {
        let snapshot = self.update(|tables| {
            let pool = f(tables.pool(id).cloned());
            let mut txn = Txn::new();
            txn.put_pool(pool);
            Ok(txn)
        })?;
        snapshot
            .pool(id)
            .cloned()
            .ok_or_else(|| Error::not_found("pool", id))
    }
}

impl std::fmt::Debug for VolumeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("VolumeStore")
            .field("revision", &snapshot.revision)
            .field("volumes", &snapshot.volumes.len())
            .field("replicas", &snapshot.replicas.len())
            .finish()
    }
}
