//! Background persistence of the volume store.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::VolumeStore;
use crate::domain::ports::StateBackend;
use crate::error::{Error, Result};

/// Write a full snapshot to `backend` after every committed revision.
///
/// Commits that land while a save is in flight are coalesced into the next
/// save. Returns `Err` on the first backend failure; the caller treats that
/// as fatal. A final save is attempted on shutdown.
///
/// The store is attached before the returned future first runs, so
/// [`VolumeStore::flush`] waits for saves from then on.
pub fn run_persister(
    store: Arc<VolumeStore>,
    backend: Arc<dyn StateBackend>,
    shutdown: CancellationToken,
) -> impl Future<Output = Result<()>> + Send + 'static {
    store.attach_persister();
    async move {
        let result = persist(&store, backend.as_ref(), &shutdown).await;
        store.detach_persister(result.is_err());
        result
    }
}

async fn persist(
    store: &VolumeStore,
    backend: &dyn StateBackend,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut revisions = store.subscribe_revisions();
    // Commits made before attaching may not be in the backend yet
    let mut saved = match store.revision() {
        0 => 0,
        _ => save(store, backend).await?,
    };

    info!(backend = backend.name(), revision = saved, "Persister started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let revision = *revisions.borrow_and_update();
        if revision == saved {
            continue;
        }
        saved = save(store, backend).await?;
    }

    if store.revision() != saved {
        save(store, backend).await?;
    }
    info!(backend = backend.name(), "Persister stopped");
    Ok(())
}

async fn save(store: &VolumeStore, backend: &dyn StateBackend) -> Result<u64> {
    let state = store.snapshot().to_persisted();
    let revision = state.revision;
    backend.save(&state).await.map_err(|e| {
        error!(backend = backend.name(), revision, error = %e, "Failed to persist volume store");
        Error::Internal(format!("{} backend save failed: {}", backend.name(), e))
    })?;
    store.mark_saved(revision);
    Ok(revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::state_backend::MemoryBackend;
    use crate::domain::model::{NodeId, Pool, PoolId};
    use crate::store::Txn;
    use std::time::Duration;

    #[tokio::test]
    async fn test_persists_commits_and_final_state() {
        let store = Arc::new(VolumeStore::new());
        let backend = Arc::new(MemoryBackend::new());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_persister(
            store.clone(),
            backend.clone(),
            shutdown.clone(),
        ));

        let mut txn = Txn::new();
        txn.put_pool(Pool::new(PoolId::new("p1"), NodeId::new("n1"), 100));
        store.commit(txn).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.saved().map(|s| s.revision) != Some(1) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(backend.saved().unwrap().pools.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_fatal() {
        let store = Arc::new(VolumeStore::new());
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_saves(true);
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_persister(store.clone(), backend, shutdown));

        let mut txn = Txn::new();
        txn.put_pool(Pool::new(PoolId::new("p1"), NodeId::new("n1"), 100));
        store.commit(txn).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Internal(_))));
        assert!(matches!(store.flush(1).await, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_flush_waits_for_save() {
        let store = Arc::new(VolumeStore::new());
        let mut txn = Txn::new();
        txn.put_pool(Pool::new(PoolId::new("p1"), NodeId::new("n1"), 100));
        store.commit(txn).unwrap();

        // In-memory only
        store.flush(1).await.unwrap();

        let backend = Arc::new(MemoryBackend::new());
        let shutdown = CancellationToken::new();
        let persister = run_persister(store.clone(), backend.clone(), shutdown.clone());

        let mut txn = Txn::new();
        txn.put_pool(Pool::new(PoolId::new("p2"), NodeId::new("n2"), 100));
        let revision = store.commit(txn).unwrap().revision();

        let flush = tokio::spawn({
            let store = store.clone();
            async move { store.flush(revision).await }
        });
        tokio::task::yield_now().await;
        assert!(!flush.is_finished());
        assert!(backend.saved().is_none());

        let task = tokio::spawn(persister);
        tokio::time::timeout(Duration::from_secs(5), flush)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(backend.saved().unwrap().revision >= revision);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
