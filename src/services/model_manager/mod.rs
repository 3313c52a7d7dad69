// Hot-swap manager for the served detector artifact
//
// File layout next to the served artifact:
// - `<served>.tmp`      fetched artifact being validated
// - `<served>.bak`      previous generation (rollback target)
// - `<served>.bak.tmp`  backup being staged
//
// The served path is only ever replaced by an atomic rename, so a detection
// call always finds either the old or the new artifact there.

pub mod loader;
pub mod retry;

use anyhow::Context;
use parking_lot::RwLock;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::core::config::{ModelConfig, StorageConfig};
use crate::core::errors::{ArtifactError, LifecycleError, LifecycleResult, LoadError};
use crate::core::types::{LifecycleState, ServedModel};
use crate::services::storage::ArtifactStore;
use crate::utils::Metrics;

pub use loader::{loader_for, ModelLoader, ProbeLoader};
pub use retry::{Backoff, RetryPolicy, Sleeper, TokioSleeper};

/// Where the served artifact lives and how swaps are retried
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub served_path: PathBuf,
    pub bucket: String,
    pub policy: RetryPolicy,
    pub fetch_timeout: Duration,
}

impl LifecycleSettings {
    pub fn from_config(model: &ModelConfig, storage: &StorageConfig) -> Self {
        Self {
            served_path: model.served_model_path.clone(),
            bucket: storage.bucket.clone(),
            policy: RetryPolicy::fixed(model.swap_max_attempts, model.swap_retry_delay),
            fetch_timeout: model.fetch_timeout,
        }
    }
}

/// Identity of an artifact generation kept on disk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub remote_key: Option<String>,
    pub format: String,
}

/// Read side of the served artifact, as seen by detection
pub trait ServedModelSource: Send + Sync {
    fn served(&self) -> Arc<ServedModel>;
}

impl ServedModelSource for ModelLifecycleManager {
    fn served(&self) -> Arc<ServedModel> {
        ModelLifecycleManager::served(self)
    }
}

/// Status surface for `/health`
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub served: ServedModel,
    pub state: LifecycleState,
    pub backup: Option<Generation>,
    pub loader: &'static str,
    pub store: &'static str,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Resets the lifecycle state when an operation ends, however it ends
struct StateGuard<'a>(&'a RwLock<LifecycleState>);

impl<'a> StateGuard<'a> {
    fn enter(state: &'a RwLock<LifecycleState>, next: LifecycleState) -> Self {
        *state.write() = next;
        Self(state)
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.0.write() = LifecycleState::Idle;
    }
}

/// Owns the served detector artifact, its single backup generation and the
/// swap/rollback state machine. Swap and rollback are single-flight: a call
/// made while another is running fails with `SwapInProgress`.
pub struct ModelLifecycleManager {
    served_path: PathBuf,
    backup_path: PathBuf,
    staging_path: PathBuf,
    backup_staging_path: PathBuf,
    bucket: String,
    policy: RetryPolicy,
    fetch_timeout: Duration,

    store: Arc<dyn ArtifactStore>,
    loader: Arc<dyn ModelLoader>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Metrics,

    served: RwLock<Arc<ServedModel>>,
    backup: RwLock<Option<Generation>>,
    state: RwLock<LifecycleState>,
    operation: Mutex<()>,
}

impl ModelLifecycleManager {
    /// Validate the artifact already at the served path and take ownership of
    /// it. Fails if it is missing or not loadable.
    ///
    /// A loadable `<served>.bak` left by a previous run becomes the rollback
    /// target; stale in-transit files are removed.
    pub async fn initialize(
        settings: LifecycleSettings,
        store: Arc<dyn ArtifactStore>,
        loader: Arc<dyn ModelLoader>,
        sleeper: Arc<dyn Sleeper>,
        metrics: Metrics,
    ) -> LifecycleResult<Self> {
        let served_path = settings.served_path;
        let backup_path = with_suffix(&served_path, ".bak");
        let staging_path = with_suffix(&served_path, ".tmp");
        let backup_staging_path = with_suffix(&served_path, ".bak.tmp");

        let format = validate(&loader, &served_path).await?;

        for stale in [&staging_path, &backup_staging_path] {
            remove_if_exists(stale).await?;
        }

        let backup = if tokio::fs::try_exists(&backup_path).await? {
            match validate(&loader, &backup_path).await {
                Ok(format) => Some(Generation {
                    remote_key: None,
                    format,
                }),
                Err(e) => {
                    warn!("Ignoring unusable backup {}: {}", backup_path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Serving {} model from {} (backup: {})",
            format,
            served_path.display(),
            if backup.is_some() { "yes" } else { "no" }
        );

        Ok(Self {
            served: RwLock::new(Arc::new(ServedModel {
                path: served_path.clone(),
                generation: 0,
                remote_key: None,
                format,
            })),
            served_path,
            backup_path,
            staging_path,
            backup_staging_path,
            bucket: settings.bucket,
            policy: settings.policy,
            fetch_timeout: settings.fetch_timeout,
            store,
            loader,
            sleeper,
            metrics,
            backup: RwLock::new(backup),
            state: RwLock::new(LifecycleState::Idle),
            operation: Mutex::new(()),
        })
    }

    /// Snapshot of the currently served artifact
    pub fn served(&self) -> Arc<ServedModel> {
        self.served.read().clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn backup(&self) -> Option<Generation> {
        self.backup.read().clone()
    }

    pub fn status(&self) -> ModelStatus {
        ModelStatus {
            served: (*self.served()).clone(),
            state: self.state(),
            backup: self.backup(),
            loader: self.loader.name(),
            store: self.store.backend(),
        }
    }

    /// Replace the served artifact with the one stored under `remote_key`.
    ///
    /// Each attempt fetches, validates and promotes; failed attempts are
    /// retried per the policy. On exhaustion the served artifact is untouched.
    #[instrument(skip(self))]
    pub async fn swap(&self, remote_key: &str) -> LifecycleResult<Arc<ServedModel>> {
        let remote_key = remote_key.trim();
        if remote_key.is_empty() || remote_key.ends_with('/') {
            warn!("Swap rejected: '{}' does not name an artifact", remote_key);
            return Err(LifecycleError::InvalidKey(remote_key.to_string()));
        }

        let _flight = self.operation.try_lock().map_err(|_| {
            self.metrics.record_lifecycle_rejection();
            warn!("Swap to {} rejected: another operation is running", remote_key);
            LifecycleError::SwapInProgress
        })?;
        let _state = StateGuard::enter(&self.state, LifecycleState::Swapping);

        let max_attempts = self.policy.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt_swap(remote_key).await {
                Ok(served) => {
                    info!(
                        "Swapped in {} (generation {}) on attempt {}/{}",
                        remote_key, served.generation, attempt, max_attempts
                    );
                    self.metrics.record_swap(true);
                    return Ok(served);
                }
                Err(e) => {
                    warn!("Swap attempt {}/{} failed: {:#}", attempt, max_attempts, e);
                    self.metrics.record_swap_attempt_failure();
                    if let Err(cleanup) = remove_if_exists(&self.staging_path).await {
                        warn!("Failed to remove {}: {}", self.staging_path.display(), cleanup);
                    }
                    last_error = format!("{:#}", e);

                    if let Some(delay) = self.policy.delay_after(attempt) {
                        self.sleeper.sleep(delay).await;
                    }
                }
            }
        }

        error!("Swap to {} exhausted after {} attempts", remote_key, max_attempts);
        self.metrics.record_swap(false);
        Err(LifecycleError::SwapExhausted {
            remote_key: remote_key.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    async fn attempt_swap(&self, remote_key: &str) -> anyhow::Result<Arc<ServedModel>> {
        remove_if_exists(&self.staging_path).await?;
        if let Some(parent) = self.staging_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::time::timeout(
            self.fetch_timeout,
            self.store.fetch(&self.bucket, remote_key, &self.staging_path),
        )
        .await
        .unwrap_or(Err(ArtifactError::Timeout {
            after: self.fetch_timeout,
        }))
        .with_context(|| format!("failed to fetch {}", remote_key))?;

        let format = validate(&self.loader, &self.staging_path).await?;

        // current artifact becomes the backup, then the new one replaces it
        self.stage_backup_of_served().await?;
        tokio::fs::rename(&self.backup_staging_path, &self.backup_path)
            .await
            .context("failed to store backup")?;

        let previous = self.served();
        *self.backup.write() = Some(Generation {
            remote_key: previous.remote_key.clone(),
            format: previous.format.clone(),
        });

        tokio::fs::rename(&self.staging_path, &self.served_path)
            .await
            .context("failed to promote new artifact")?;

        let served = Arc::new(ServedModel {
            path: self.served_path.clone(),
            generation: previous.generation + 1,
            remote_key: Some(remote_key.to_string()),
            format,
        });
        *self.served.write() = served.clone();
        Ok(served)
    }

    /// Restore the backup generation; the current artifact becomes the backup
    #[instrument(skip(self))]
    pub async fn rollback(&self) -> LifecycleResult<Arc<ServedModel>> {
        let _flight = self.operation.try_lock().map_err(|_| {
            self.metrics.record_lifecycle_rejection();
            warn!("Rollback rejected: another operation is running");
            LifecycleError::SwapInProgress
        })?;

        let result = self.rollback_locked().await;
        if !matches!(result, Err(LifecycleError::NoBackupAvailable)) {
            self.metrics.record_rollback(result.is_ok());
        }
        result
    }

    async fn rollback_locked(&self) -> LifecycleResult<Arc<ServedModel>> {
        let Some(restored) = self.backup() else {
            warn!("Rollback requested without a backup generation");
            return Err(LifecycleError::NoBackupAvailable);
        };
        if !tokio::fs::try_exists(&self.backup_path).await? {
            warn!("Backup file {} disappeared", self.backup_path.display());
            *self.backup.write() = None;
            return Err(LifecycleError::NoBackupAvailable);
        }

        let _state = StateGuard::enter(&self.state, LifecycleState::RollingBack);

        let format = validate(&self.loader, &self.backup_path).await?;

        self.stage_backup_of_served().await?;
        if let Err(e) = tokio::fs::rename(&self.backup_path, &self.served_path).await {
            let _ = remove_if_exists(&self.backup_staging_path).await;
            return Err(e.into());
        }

        let previous = self.served();
        match tokio::fs::rename(&self.backup_staging_path, &self.backup_path).await {
            Ok(()) => {
                *self.backup.write() = Some(Generation {
                    remote_key: previous.remote_key.clone(),
                    format: previous.format.clone(),
                });
            }
            Err(e) => {
                warn!("Rolled back but could not keep the replaced artifact: {}", e);
                *self.backup.write() = None;
            }
        }

        let served = Arc::new(ServedModel {
            path: self.served_path.clone(),
            generation: previous.generation + 1,
            remote_key: restored.remote_key,
            format,
        });
        *self.served.write() = served.clone();
        info!("Rolled back to generation {}", served.generation);
        Ok(served)
    }

    /// Put a copy of the served artifact at the backup staging path without
    /// ever removing the served path
    async fn stage_backup_of_served(&self) -> std::io::Result<()> {
        remove_if_exists(&self.backup_staging_path).await?;
        if tokio::fs::hard_link(&self.served_path, &self.backup_staging_path)
            .await
            .is_err()
        {
            tokio::fs::copy(&self.served_path, &self.backup_staging_path).await?;
        }
        Ok(())
    }
}

async fn validate(loader: &Arc<dyn ModelLoader>, path: &Path) -> LifecycleResult<String> {
    let loader = loader.clone();
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || loader.load(&owned))
        .await
        .map_err(|e| LifecycleError::TaskJoinFailed(e.to_string()))?
        .map_err(|source: LoadError| LifecycleError::ModelNotLoadable {
            path: path.to_path_buf(),
            source,
        })
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
