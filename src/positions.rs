//! Durable key to cursor mapping.
//!
//! Targets record how far they got in a positions file so that a restarted
//! agent resumes where it left off. Values are stored as strings; docker
//! targets store a unix-seconds cursor under [`cursor_key`].

use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CURSOR_PREFIX: &str = "cursor-";

fn default_sync_period() -> u64 {
    10
}

fn default_filename() -> PathBuf {
    PathBuf::from("positions.yaml")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PositionsConfig {
    #[serde(default = "default_filename")]
    pub filename: PathBuf,
    /// Seconds between two syncs of the positions file.
    #[serde(default = "default_sync_period")]
    pub sync_period: u64,
    /// Start from an empty set of positions when the file can not be parsed.
    #[serde(default)]
    pub ignore_invalid_yaml: bool,
    /// Never write the positions file.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            filename: default_filename(),
            sync_period: default_sync_period(),
            ignore_invalid_yaml: false,
            read_only: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PositionsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid cursor {value:?} stored for {key}")]
    InvalidCursor { key: String, value: String },
}

/// The key a docker target stores its cursor under.
pub fn cursor_key(container_id: &str) -> String {
    format!("{CURSOR_PREFIX}{container_id}")
}

pub trait Positions: Send + Sync {
    /// Cursor stored under `key`, `0` when nothing was stored yet.
    fn get(&self, key: &str) -> Result<i64, PositionsError>;
    fn put(&self, key: &str, cursor: i64);
    /// Raw stored value, empty when nothing was stored yet.
    fn get_string(&self, key: &str) -> String;
    fn put_string(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionsFile {
    #[serde(default)]
    positions: BTreeMap<String, String>,
}

/// Positions kept in memory and synced periodically to a YAML file.
pub struct FilePositions {
    config: PositionsConfig,
    positions: Arc<Mutex<BTreeMap<String, String>>>,
    cancel: CancellationToken,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl FilePositions {
    /// Load the positions file and start the sync task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PositionsConfig) -> Result<Arc<Self>, PositionsError> {
        let positions = match read_positions_file(&config.filename) {
            Ok(positions) => positions,
            Err(PositionsError::Yaml(e)) if config.ignore_invalid_yaml => {
                log::warn!(
                    "Ignoring invalid positions file {:?}: {}",
                    config.filename,
                    e
                );
                BTreeMap::new()
            }
            Err(e) => return Err(e),
        };

        let positions = Arc::new(Mutex::new(positions));
        let cancel = CancellationToken::new();

        let sync_task = if config.read_only {
            None
        } else {
            Some(tokio::spawn(sync_loop(
                config.filename.clone(),
                Duration::from_secs(config.sync_period.max(1)),
                Arc::clone(&positions),
                cancel.clone(),
            )))
        };

        Ok(Arc::new(Self {
            config,
            positions,
            cancel,
            sync_task: Mutex::new(sync_task),
        }))
    }

    /// Stop the sync task and write the positions one last time.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = lock(&self.sync_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Positions sync task failed: {}", e);
            }
        }
    }

    pub async fn sync(&self) -> Result<(), PositionsError> {
        if self.config.read_only {
            return Ok(());
        }
        let snapshot = lock(&self.positions).clone();
        write_positions_file(&self.config.filename, snapshot).await
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        lock(&self.positions)
    }
}

impl Drop for FilePositions {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Positions for FilePositions {
    fn get(&self, key: &str) -> Result<i64, PositionsError> {
        match self.entries().get(key) {
            None => Ok(0),
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| PositionsError::InvalidCursor {
                    key: key.to_string(),
                    value: value.clone(),
                }),
        }
    }

    fn put(&self, key: &str, cursor: i64) {
        self.put_string(key, &cursor.to_string());
    }

    fn get_string(&self, key: &str) -> String {
        self.entries().get(key).cloned().unwrap_or_default()
    }

    fn put_string(&self, key: &str, value: &str) {
        self.entries().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries().remove(key);
    }
}

/// Lock the map, recovering it if a writer panicked. Every critical
/// section is a single map operation so the data is never half-updated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn sync_loop(
    filename: PathBuf,
    period: Duration,
    positions: Arc<Mutex<BTreeMap<String, String>>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = lock(&positions).clone();
                if let Err(e) = write_positions_file(&filename, snapshot).await {
                    log::error!("Error writing positions file {:?}: {}", filename, e);
                }
            }
        }
    }

    let snapshot = lock(&positions).clone();
    match write_positions_file(&filename, snapshot).await {
        Ok(()) => log::debug!("Positions saved to {:?}", filename),
        Err(e) => log::error!("Error writing positions file {:?}: {}", filename, e),
    }
}

fn read_positions_file(path: &Path) -> Result<BTreeMap<String, String>, PositionsError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let file: PositionsFile = serde_yaml::from_str(&content)?;
    Ok(file.positions)
}

async fn write_positions_file(
    path: &Path,
    positions: BTreeMap<String, String>,
) -> Result<(), PositionsError> {
    let content = serde_yaml::to_string(&PositionsFile { positions })?;

    // Write next to the target and rename so a crash never leaves a
    // truncated positions file behind.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
