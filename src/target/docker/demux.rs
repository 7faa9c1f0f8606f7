//! Docker's multiplexed log stream framing.
//!
//! When a container runs without a TTY, the daemon sends stdout and stderr
//! over a single connection. Each frame is an 8 byte header followed by the
//! payload:
//!
//! ```text
//! [kind u8][0u8; 3][len u32 big endian][payload; len]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    /// Error reported by the daemon itself, the payload is the message.
    SystemErr = 3,
}

impl TryFrom<u8> for StreamKind {
    type Error = DemuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Stdin),
            1 => Ok(Self::Stdout),
            2 => Ok(Self::Stderr),
            3 => Ok(Self::SystemErr),
            other => Err(DemuxError::UnknownStream(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognized stream kind: {0}")]
    UnknownStream(u8),
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("error from daemon in stream: {0}")]
    System(String),
    #[error("payload of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),
}

/// Length field for a payload of `len` bytes.
fn frame_len(len: usize) -> Result<u32, DemuxError> {
    u32::try_from(len).map_err(|_| DemuxError::FrameTooLarge(len))
}

/// Build a single frame for `payload`.
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Result<Bytes, DemuxError> {
    let len = frame_len(payload.len())?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u8(kind as u8);
    frame.put_bytes(0, 3);
    frame.put_u32(len);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

/// Splits a framed stream into stdout and stderr.
pub struct Demuxer<R> {
    src: R,
    written: u64,
}

impl<R: AsyncRead + Unpin> Demuxer<R> {
    pub fn new(src: R) -> Self {
        Self { src, written: 0 }
    }

    /// Payload bytes copied so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Copy frames until the source ends at a frame boundary.
    ///
    /// Stdin frames are routed to `stdout`. The byte count keeps its value
    /// when the future is dropped halfway, so the copy can be raced
    /// against cancellation.
    pub async fn copy_to<O, E>(
        &mut self,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<u64, DemuxError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        while let Some((kind, len)) = self.read_header().await? {
            match kind {
                StreamKind::Stdin | StreamKind::Stdout => {
                    self.copy_payload(len, &mut *stdout).await?
                }
                StreamKind::Stderr => self.copy_payload(len, &mut *stderr).await?,
                StreamKind::SystemErr => {
                    // The length is untrusted, let the buffer grow with the data
                    let mut message = Vec::new();
                    self.copy_payload(len, &mut message).await?;
                    return Err(DemuxError::System(
                        String::from_utf8_lossy(&message).into_owned(),
                    ));
                }
            }
        }
        stdout.flush().await?;
        stderr.flush().await?;
        Ok(self.written)
    }

    /// `None` on a clean end of stream.
    async fn read_header(&mut self) -> Result<Option<(StreamKind, usize)>, DemuxError> {
        let mut header = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self.src.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(DemuxError::Truncated {
                    expected: HEADER_LEN,
                    got: filled,
                });
            }
            filled += n;
        }

        let kind = StreamKind::try_from(header[0])?;
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        Ok(Some((kind, len)))
    }

    async fn copy_payload<W>(&mut self, len: usize, dst: &mut W) -> Result<(), DemuxError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut payload = (&mut self.src).take(len as u64);
        let copied = tokio::io::copy(&mut payload, dst).await?;
        if copied < len as u64 {
            return Err(DemuxError::Truncated {
                expected: len,
                got: copied as usize,
            });
        }
        self.written += copied;
        Ok(())
    }
}
