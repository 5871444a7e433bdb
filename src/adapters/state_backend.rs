//! Local State Backends
//!
//! Implements the `StateBackend` port in memory and as a JSON file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::domain::ports::{PersistedState, StateBackend};
use crate::error::{Error, Result};

/// In-memory backend.
///
/// State survives only as long as the process. Used for local development
/// and in tests, where saves can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<Option<PersistedState>>,
    fail_saves: Mutex<bool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            fail_saves: Mutex::new(false),
        }
    }

    /// Last saved state.
    pub fn saved(&self) -> Option<PersistedState> {
        self.state.lock().clone()
    }

    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }
}

#[async_trait]
impl StateBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<PersistedState>> {
        Ok(self.state.lock().clone())
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        if *self.fail_saves.lock() {
            return Err(Error::Internal("memory backend rejected save".into()));
        }
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// JSON file backend.
///
/// Saves go to a sibling temporary file which is then renamed over the
/// target, so a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateBackend for JsonFileBackend {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Option<PersistedState>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let state: PersistedState = serde_json::from_slice(&bytes)?;
                debug!(revision = state.revision, "Loaded state file");
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    #[instrument(skip(self, state), fields(path = %self.path.display(), revision = state.revision))]
    async fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Saved state file");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
