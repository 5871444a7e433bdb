//! Per-volume operation locks.
//!
//! Every mutating operation on a volume holds that volume's lock for its
//! whole duration, including node RPCs. Different volumes never contend.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::model::VolumeId;
use crate::error::{Error, Result};

pub type VolumeGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
struct CreateEntry {
    generation: u64,
    token: CancellationToken,
    holders: usize,
}

#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: DashMap<VolumeId, Arc<Mutex<()>>>,
    creates: DashMap<VolumeId, CreateEntry>,
    generation: AtomicU64,
    closed: AtomicBool,
    root: CancellationToken,
}

/// Registration of an in-flight create; dropping it unregisters.
#[derive(Debug)]
pub struct CreateTicket<'a> {
    locks: &'a VolumeLocks,
    volume: VolumeId,
    generation: u64,
    token: CancellationToken,
}

impl CreateTicket<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail with `Cancelled` once a delete or shutdown has superseded the create.
    pub fn check(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled(format!(
                "create of volume {} was superseded",
                self.volume
            )));
        }
        Ok(())
    }
}

impl Drop for CreateTicket<'_> {
    fn drop(&mut self) {
        self.locks.creates.remove_if_mut(&self.volume, |_, entry| {
            if entry.generation != self.generation {
                return false;
            }
            entry.holders = entry.holders.saturating_sub(1);
            entry.holders == 0
        });
    }
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, volume: &VolumeId) -> Arc<Mutex<()>> {
        self.locks
            .entry(volume.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Cancelled("control plane is shutting down".into()));
        }
        Ok(())
    }

    /// Wait for exclusive access to `volume`.
    pub async fn lock(&self, volume: &VolumeId) -> Result<VolumeGuard> {
        self.ensure_open()?;
        let mutex = self.mutex(volume);
        tokio::select! {
            guard = mutex.lock_owned() => Ok(guard),
            _ = self.root.cancelled() => Err(Error::Cancelled("control plane is shutting down".into())),
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_lock(&self, volume: &VolumeId) -> Option<VolumeGuard> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.mutex(volume).try_lock_owned().ok()
    }

    pub fn is_locked(&self, volume: &VolumeId) -> bool {
        self.locks
            .get(volume)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Register an in-flight create so a delete can cancel it.
    pub fn begin_create(&self, volume: &VolumeId) -> Result<CreateTicket<'_>> {
        self.ensure_open()?;
        let mut entry = self
            .creates
            .entry(volume.clone())
            .or_insert_with(|| CreateEntry {
                generation: self.generation.fetch_add(1, Ordering::SeqCst),
                token: self.root.child_token(),
                holders: 0,
            });
        entry.holders += 1;
        Ok(CreateTicket {
            locks: self,
            volume: volume.clone(),
            generation: entry.generation,
            token: entry.token.clone(),
        })
    }

    /// Cancel in-flight creates of `volume`. Returns whether any existed.
    pub fn cancel_create(&self, volume: &VolumeId) -> bool {
        match self.creates.remove(volume) {
            Some((_, entry)) => {
                debug!(volume = %volume, "Cancelling in-flight create");
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop lock entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks
            .retain(|_, mutex| Arc::strong_count(mutex) > 1 || mutex.try_lock().is_err());
    }

    /// Refuse new operations, cancel creates, then wait for every held lock.
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.root.cancel();

        let mutexes: Vec<(VolumeId, Arc<Mutex<()>>)> = self
            .locks
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let count = mutexes.len();
        for (volume, mutex) in mutexes {
            let _guard = mutex.lock().await;
            debug!(volume = %volume, "Drained volume lock");
        }
        info!(volumes = count, "Volume operations drained");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
