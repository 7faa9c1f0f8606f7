//! Opening a container's combined log stream.

use std::{io, pin::Pin};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::query_parameters::{
    InspectContainerOptions, InspectContainerOptionsBuilder, LogsOptions, LogsOptionsBuilder,
};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use super::demux::{DemuxError, StreamKind, encode_frame};

/// A combined, framed stdout/stderr byte stream.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

/// What to ask the daemon for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogRequest {
    pub stdout: bool,
    pub stderr: bool,
    pub follow: bool,
    pub timestamps: bool,
    /// Unix seconds, `0` streams from the beginning.
    pub since: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum LogSourceError {
    #[error("no such container: {0}")]
    NoSuchContainer(String),
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),
}

#[async_trait]
pub trait LogSource: Send + Sync {
    async fn open_logs(
        &self,
        container_id: &str,
        request: &LogRequest,
    ) -> Result<LogStream, LogSourceError>;
}

/// Log source backed by the local docker daemon.
#[derive(Debug, Clone)]
pub struct BollardLogSource {
    docker: Docker,
}

impl BollardLogSource {
    /// Connects using the default method for the platform
    /// (Unix socket on Linux/macOS, named pipe on Windows).
    pub fn connect() -> Result<Self, LogSourceError> {
        Ok(Self::new(Docker::connect_with_local_defaults()?))
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl LogSource for BollardLogSource {
    async fn open_logs(
        &self,
        container_id: &str,
        request: &LogRequest,
    ) -> Result<LogStream, LogSourceError> {
        // The logs endpoint only reports a missing container once the
        // stream is polled, so check up front.
        let inspect: InspectContainerOptions = InspectContainerOptionsBuilder::new().build();
        match self.docker.inspect_container(container_id, Some(inspect)).await {
            Ok(_) => {}
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(LogSourceError::NoSuchContainer(container_id.to_string())),
            Err(e) => return Err(LogSourceError::DockerApi(e)),
        }

        let options: LogsOptions = LogsOptionsBuilder::new()
            .stdout(request.stdout)
            .stderr(request.stderr)
            .follow(request.follow)
            .timestamps(request.timestamps)
            .since(i32::try_from(request.since).unwrap_or(i32::MAX))
            .build();

        let frames = self
            .docker
            .logs(container_id, Some(options))
            .map(|output| match output {
                Ok(output) => reframe(output).map_err(io::Error::other),
                Err(e) => Err(io::Error::other(e)),
            });

        Ok(Box::pin(StreamReader::new(frames)))
    }
}

/// bollard already splits the stream; put the frames back so the
/// target always demultiplexes the wire format itself.
fn reframe(output: LogOutput) -> Result<Bytes, DemuxError> {
    match output {
        LogOutput::StdOut { message } => encode_frame(StreamKind::Stdout, &message),
        LogOutput::StdErr { message } => encode_frame(StreamKind::Stderr, &message),
        LogOutput::StdIn { message } => encode_frame(StreamKind::Stdin, &message),
        // Containers with a TTY have a single raw stream
        LogOutput::Console { message } => encode_frame(StreamKind::Stdout, &message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::docker::demux::Demuxer;

    #[tokio::test]
    async fn test_reframed_output_demuxes_back() {
        let outputs = vec![
            LogOutput::StdOut {
                message: Bytes::from_static(b"2023-01-01T00:00:01Z out\n"),
            },
            LogOutput::StdErr {
                message: Bytes::from_static(b"2023-01-01T00:00:02Z err\n"),
            },
            LogOutput::Console {
                message: Bytes::from_static(b"2023-01-01T00:00:03Z tty\n"),
            },
        ];
        let frames = futures_util::stream::iter(
            outputs
                .into_iter()
                .map(|output| reframe(output).map_err(io::Error::other)),
        );
        let reader: LogStream = Box::pin(StreamReader::new(frames));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        Demuxer::new(reader)
            .copy_to(&mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(
            stdout,
            b"2023-01-01T00:00:01Z out\n2023-01-01T00:00:03Z tty\n"
        );
        assert_eq!(stderr, b"2023-01-01T00:00:02Z err\n");
    }
}
