//! Docker container log target.
//!
//! A [`DockerTarget`] follows the logs of one container. Four tasks run per
//! target:
//!
//! ```text
//!   LogSource --framed bytes--> demux --stdout pipe--> LineProcessor --+
//!                                   \--stderr pipe--> LineProcessor --+--> entry handler
//! ```
//!
//! plus the lifecycle task that opens the stream and waits for
//! cancellation. All of them share one [`CancellationToken`] and are
//! joined through one [`TaskTracker`].

pub mod client;
pub mod demux;
pub mod process;

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::Sender;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::api::{Entry, LabelSet};
use crate::metrics::Metrics;
use crate::positions::{Positions, PositionsError, cursor_key};
use crate::relabel::RelabelRule;
use crate::target::{Target, TargetType};

use client::{LogRequest, LogSource, LogStream};
use demux::Demuxer;
use process::{LineProcessor, OutputStream};

/// Cursor value asking for the whole log history.
pub const SINCE_BEGINNING: i64 = 0;

/// Buffer of each in-process pipe between the demultiplexer and a
/// line processor.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("Positions error: {0}")]
    Positions(#[from] PositionsError),
}

/// Debug snapshot of a docker target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DockerTargetDetails {
    pub id: String,
    /// `None` until the log stream could not be opened.
    pub error: Option<String>,
    pub position: String,
    pub running: bool,
}

/// State shared between the target handle and its tasks.
struct Shared {
    container_id: String,
    labels: LabelSet,
    relabel_rules: Arc<[RelabelRule]>,
    since: i64,
    handler: Sender<Entry>,
    positions: Arc<dyn Positions>,
    metrics: Arc<Metrics>,
    client: Arc<dyn LogSource>,
    running: AtomicBool,
    error: OnceLock<String>,
}

pub struct DockerTarget {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl DockerTarget {
    /// Create the target and start following the container's logs in
    /// the background.
    ///
    /// Only the position lookup can fail here; a failure to open the
    /// log stream is reported through [`DockerTarget::details`].
    /// Must be called from within a tokio runtime.
    pub fn new(
        metrics: Arc<Metrics>,
        handler: Sender<Entry>,
        positions: Arc<dyn Positions>,
        container_id: impl Into<String>,
        labels: LabelSet,
        relabel_rules: Arc<[RelabelRule]>,
        client: Arc<dyn LogSource>,
    ) -> Result<Self, TargetError> {
        let container_id = container_id.into();
        let since = match positions.get(&cursor_key(&container_id))? {
            0 => SINCE_BEGINNING,
            pos => pos,
        };

        let shared = Arc::new(Shared {
            container_id,
            labels,
            relabel_rules,
            since,
            handler,
            positions,
            metrics,
            client,
            running: AtomicBool::new(false),
            error: OnceLock::new(),
        });

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(process_loop(
            Arc::clone(&shared),
            cancel.clone(),
            tracker.clone(),
        ));

        Ok(Self {
            shared,
            cancel,
            tracker,
        })
    }

    pub fn container_id(&self) -> &str {
        &self.shared.container_id
    }

    /// Cursor the target started from.
    pub fn since(&self) -> i64 {
        self.shared.since
    }

    /// The error that stopped the target before it could start.
    pub fn error(&self) -> Option<&str> {
        self.shared.error.get().map(String::as_str)
    }

    pub fn docker_details(&self) -> DockerTargetDetails {
        let shared = &self.shared;
        DockerTargetDetails {
            id: shared.container_id.clone(),
            error: shared.error.get().cloned(),
            position: shared
                .positions
                .get_string(&cursor_key(&shared.container_id)),
            running: shared.running.load(Ordering::SeqCst),
        }
    }
}

impl Drop for DockerTarget {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Target for DockerTarget {
    fn target_type(&self) -> TargetType {
        TargetType::Docker
    }

    fn ready(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn discovered_labels(&self) -> LabelSet {
        self.shared.labels.clone()
    }

    fn labels(&self) -> LabelSet {
        self.shared.labels.clone()
    }

    fn details(&self) -> serde_json::Value {
        serde_json::to_value(self.docker_details()).unwrap_or_default()
    }

    async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        log::debug!("Stopped docker target {}", self.shared.container_id);
    }
}

async fn process_loop(shared: Arc<Shared>, cancel: CancellationToken, tracker: TaskTracker) {
    let request = LogRequest {
        stdout: true,
        stderr: true,
        follow: true,
        timestamps: true,
        since: shared.since,
    };

    let logs = tokio::select! {
        _ = cancel.cancelled() => return,
        logs = shared.client.open_logs(&shared.container_id, &request) => logs,
    };
    let logs = match logs {
        Ok(logs) => logs,
        Err(e) => {
            log::error!(
                "Could not fetch logs for container {}: {}",
                shared.container_id,
                e
            );
            let _ = shared.error.set(e.to_string());
            return;
        }
    };
    shared.running.store(true, Ordering::SeqCst);

    let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);

    tracker.spawn(transfer(
        Arc::clone(&shared),
        logs,
        stdout_writer,
        stderr_writer,
        cancel.clone(),
    ));
    tracker.spawn(line_processor(&shared, OutputStream::Stdout).run(stdout_reader));
    tracker.spawn(line_processor(&shared, OutputStream::Stderr).run(stderr_reader));

    cancel.cancelled().await;
    shared.running.store(false, Ordering::SeqCst);
    log::debug!("Done processing docker logs of {}", shared.container_id);
}

/// Copy the combined stream into the two pipes. Both pipe writers and the
/// combined stream are dropped when this returns, which ends the line
/// processors, and the target is torn down whatever the outcome.
async fn transfer(
    shared: Arc<Shared>,
    logs: LogStream,
    mut stdout: tokio::io::DuplexStream,
    mut stderr: tokio::io::DuplexStream,
    cancel: CancellationToken,
) {
    let mut demuxer = Demuxer::new(logs);
    let result = tokio::select! {
        _ = cancel.cancelled() => None,
        result = demuxer.copy_to(&mut stdout, &mut stderr) => Some(result),
    };
    let result = result.unwrap_or_else(|| Ok(demuxer.written()));

    match result {
        Ok(written) => log::info!(
            "Finished transferring logs of {} ({} bytes written)",
            shared.container_id,
            written
        ),
        Err(e) => log::warn!(
            "Could not transfer logs of {} ({} bytes written): {}",
            shared.container_id,
            demuxer.written(),
            e
        ),
    }

    drop(stdout);
    drop(stderr);
    cancel.cancel();
}

fn line_processor(shared: &Shared, stream: OutputStream) -> LineProcessor {
    LineProcessor {
        container_id: shared.container_id.clone(),
        stream,
        labels: shared.labels.clone(),
        relabel_rules: Arc::clone(&shared.relabel_rules),
        handler: shared.handler.clone(),
        positions: Arc::clone(&shared.positions),
        metrics: Arc::clone(&shared.metrics),
    }
}
