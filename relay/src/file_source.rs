//! Flag client backed by a JSON file, for running a relay without an
//! upstream.
//!
//! The file holds a single object of flag key to value. Every user gets the
//! same values.

use crate::config::{DataSourceConfig, EnvironmentConfig};
use crate::flag_client::{FlagClient, FlagClientError, FlagClientFactory, FlagValues};
use crate::user::UserContext;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

// How often a file without a reload interval is retried until the first load
// succeeds.
const INITIAL_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid flag data: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceStatus {
    Loading,
    Ready,
    Closed,
}

struct Snapshot {
    version: u64,
    values: FlagValues,
}

#[derive(Default)]
struct SourceData {
    snapshot: Option<Snapshot>,
    // Set while reloads fail after a successful load
    interruption: Option<String>,
}

struct FileSource {
    path: PathBuf,
    data: RwLock<SourceData>,
    status: watch::Sender<SourceStatus>,
}

impl FileSource {
    async fn reload(&self) {
        match load(&self.path).await {
            Ok(values) => {
                let version = {
                    let mut data = self.data.write();
                    let version = data.snapshot.as_ref().map_or(1, |s| s.version + 1);
                    data.snapshot = Some(Snapshot { version, values });
                    data.interruption = None;
                    version
                };
                self.status.send_if_modified(|status| {
                    if *status == SourceStatus::Loading {
                        *status = SourceStatus::Ready;
                        true
                    } else {
                        false
                    }
                });
                tracing::debug!(path = %self.path.display(), version, "Loaded flag data");
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to load flag data");
                let mut data = self.data.write();
                if data.snapshot.is_some() {
                    data.interruption = Some(e.to_string());
                }
            }
        }
    }

    fn has_snapshot(&self) -> bool {
        self.data.read().snapshot.is_some()
    }
}

async fn load(path: &Path) -> Result<FlagValues, LoadError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Loads the file in a background task. With a reload interval the file is
/// re-read periodically; a newer snapshot replaces the previous one whole.
pub struct FileFlagClient {
    source: Arc<FileSource>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileFlagClient {
    /// Starts loading `path` on the given runtime.
    pub fn spawn(handle: &Handle, path: PathBuf, reload_interval: Option<Duration>) -> Self {
        let (status, _) = watch::channel(SourceStatus::Loading);
        let source = Arc::new(FileSource {
            path,
            data: RwLock::new(SourceData::default()),
            status,
        });

        let reload_interval = reload_interval.filter(|interval| !interval.is_zero());
        let worker = handle.spawn(run_loader(source.clone(), reload_interval));

        FileFlagClient {
            source,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Version of the current snapshot. Increases with every successful load.
    pub fn version(&self) -> Option<u64> {
        self.source
            .data
            .read()
            .snapshot
            .as_ref()
            .map(|snapshot| snapshot.version)
    }
}

async fn run_loader(source: Arc<FileSource>, reload_interval: Option<Duration>) {
    let mut ticker = tokio::time::interval(reload_interval.unwrap_or(INITIAL_RETRY_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        source.reload().await;

        if reload_interval.is_none() && source.has_snapshot() {
            break;
        }
    }
}

#[async_trait]
impl FlagClient for FileFlagClient {
    async fn all_flags(&self, _user: &UserContext) -> Result<FlagValues, FlagClientError> {
        if *self.source.status.borrow() == SourceStatus::Closed {
            return Err(FlagClientError::Closed);
        }

        let data = self.source.data.read();
        match (&data.snapshot, &data.interruption) {
            (None, _) => Err(FlagClientError::NotInitialized),
            (Some(snapshot), Some(reason)) => Err(FlagClientError::Unavailable {
                reason: reason.clone(),
                last_known: Some(snapshot.values.clone()),
            }),
            (Some(snapshot), None) => Ok(snapshot.values.clone()),
        }
    }

    async fn ready(&self) -> Result<(), FlagClientError> {
        let mut rx = self.source.status.subscribe();
        let status = rx
            .wait_for(|status| *status != SourceStatus::Loading)
            .await
            .map_err(|_| FlagClientError::Closed)?;
        match *status {
            SourceStatus::Ready => Ok(()),
            SourceStatus::Loading | SourceStatus::Closed => Err(FlagClientError::Closed),
        }
    }

    async fn close(&self) -> Result<(), FlagClientError> {
        self.source.status.send_replace(SourceStatus::Closed);
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        Ok(())
    }
}

/// Creates a [`FileFlagClient`] for every environment with a file data
/// source.
#[derive(Default)]
pub struct FileFlagClientFactory;

impl FlagClientFactory for FileFlagClientFactory {
    fn create(&self, config: &EnvironmentConfig) -> Result<Arc<dyn FlagClient>, FlagClientError> {
        let handle =
            Handle::try_current().map_err(|e| FlagClientError::Configuration(e.to_string()))?;

        match &config.data_source {
            DataSourceConfig::File {
                path,
                reload_interval_secs,
            } => Ok(Arc::new(FileFlagClient::spawn(
                &handle,
                path.clone(),
                reload_interval_secs.map(Duration::from_secs),
            ))),
        }
    }
}
