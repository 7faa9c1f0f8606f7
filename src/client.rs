//! Dry-run client: prints entries instead of shipping them.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::api::{Entry, format_labels};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Consumes entries from a bounded channel and writes one line per entry:
/// `<timestamp>\t<labels>\t<line>`.
pub struct Logger<W> {
    tx: Sender<Entry>,
    task: JoinHandle<std::io::Result<W>>,
}

impl<W> Logger<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Must be called from within a tokio runtime.
    pub fn new(writer: W, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run(rx, writer));
        Self { tx, task }
    }

    /// The sending side every target forwards its entries to.
    pub fn sender(&self) -> Sender<Entry> {
        self.tx.clone()
    }

    /// Wait for every sender to be dropped, write what is left and give
    /// the writer back.
    pub async fn stop(self) -> std::io::Result<W> {
        drop(self.tx);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

async fn run<W>(mut rx: Receiver<Entry>, mut writer: W) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(entry) = rx.recv().await {
        let line = format!(
            "{}\t{}\t{}\n",
            entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.9f%z"),
            format_labels(&entry.labels),
            entry.line
        );
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            log::error!("Failed to write entry: {}", e);
            return Err(e);
        }
    }
    writer.flush().await?;
    log::debug!("Entry channel closed, logger stopped");
    Ok(writer)
}
