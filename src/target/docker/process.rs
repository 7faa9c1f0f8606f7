use std::{io, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc::Sender;

use crate::api::{self, Entry, LabelSet};
use crate::metrics::Metrics;
use crate::positions::Positions;
use crate::relabel::{self, RelabelRule};

/// Label carrying the name of the stream a line was read from.
pub const LOG_STREAM_LABEL: &str = "logstream";

/// Longest line accepted, line ending excluded. Scanning stops at the
/// first longer line.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl AsRef<str> for OutputStream {
    fn as_ref(&self) -> &str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    #[error("could not find timestamp in {line:?}")]
    Missing { line: String },
    #[error("could not parse timestamp from {token:?}: {source}")]
    Invalid {
        token: String,
        source: chrono::ParseError,
    },
}

/// Split the leading timestamp from a line written with docker's
/// `--timestamps` flag, e.g. `2006-01-02T15:04:05.999999999Z07:00 text`.
pub fn extract_timestamp(line: &str) -> Result<(DateTime<Utc>, &str), TimestampError> {
    let Some((token, rest)) = line.split_once(' ') else {
        return Err(TimestampError::Missing {
            line: line.to_string(),
        });
    };
    let ts = DateTime::parse_from_rfc3339(token).map_err(|source| TimestampError::Invalid {
        token: token.to_string(),
        source,
    })?;
    Ok((ts.with_timezone(&Utc), rest))
}

/// Turns one demultiplexed stream into entries.
pub struct LineProcessor {
    pub container_id: String,
    pub stream: OutputStream,
    pub labels: LabelSet,
    pub relabel_rules: Arc<[RelabelRule]>,
    pub handler: Sender<Entry>,
    pub positions: Arc<dyn Positions>,
    pub metrics: Arc<Metrics>,
}

impl LineProcessor {
    /// Read lines until `reader` reaches end of stream.
    pub async fn run<R: AsyncRead + Unpin>(self, reader: R) {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let key = crate::positions::cursor_key(&self.container_id);

        loop {
            buf.clear();
            match read_line(&mut reader, &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    log::warn!(
                        "Finished scanning {} log lines of {} with an error: {}",
                        self.stream.as_ref(),
                        self.container_id,
                        e
                    );
                    return;
                }
            }

            let line = String::from_utf8_lossy(trim_line_ending(&buf));
            let (ts, line) = match extract_timestamp(&line) {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!(
                        "Could not extract timestamp for {}, skipping line: {}",
                        self.container_id,
                        e
                    );
                    self.metrics.inc_errors();
                    continue;
                }
            };

            let entry = Entry {
                labels: self.entry_labels(),
                timestamp: ts,
                line: line.to_string(),
            };

            if self.handler.send(entry).await.is_err() {
                log::warn!(
                    "Entry handler closed, stopping {} processing for {}",
                    self.stream.as_ref(),
                    self.container_id
                );
                return;
            }
            self.metrics.inc_entries();
            self.positions.put(&key, ts.timestamp());
        }

        log::debug!(
            "Finished reading {} of {}",
            self.stream.as_ref(),
            self.container_id
        );
    }

    /// Static labels plus the stream label, relabeled, without
    /// reserved labels.
    fn entry_labels(&self) -> LabelSet {
        let mut labels = self.labels.clone();
        labels.insert(
            LOG_STREAM_LABEL.to_string(),
            self.stream.as_ref().to_string(),
        );
        // A dropped set still forwards the line, only without labels.
        let processed = relabel::process(&labels, &self.relabel_rules).unwrap_or_default();
        api::strip_reserved(processed)
    }
}

/// Read one line into `buf`, failing once it grows past [`MAX_LINE_LEN`].
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    // Room for a trailing "\r\n"
    let limit = MAX_LINE_LEN as u64 + 2;
    let n = reader.take(limit).read_until(b'\n', buf).await?;
    if trim_line_ending(buf).len() > MAX_LINE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line longer than {MAX_LINE_LEN} bytes"),
        ));
    }
    Ok(n)
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::{FilePositions, PositionsConfig};
    use crate::relabel::{Action, RelabelConfig};
    use chrono::TimeZone;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    #[test]
    fn test_extract_timestamp() {
        let (ts, line) = extract_timestamp("2023-01-01T00:00:00.000000000Z hello").unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(line, "hello");
    }

    #[test]
    fn test_extract_timestamp_keeps_rest_of_line() {
        let (ts, line) =
            extract_timestamp("2019-01-18T07:38:27.123456789+01:00 level=info msg=\"a b\"")
                .unwrap();
        assert_eq!(ts.timestamp(), 1_547_793_507);
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_789);
        assert_eq!(line, "level=info msg=\"a b\"");

        let (_, line) = extract_timestamp("2019-01-18T07:38:27Z ").unwrap();
        assert_eq!(line, "");
    }

    #[test]
    fn test_extract_timestamp_errors() {
        match extract_timestamp("no-whitespace-here") {
            Err(TimestampError::Missing { line }) => assert_eq!(line, "no-whitespace-here"),
            other => panic!("Expected Missing, got {:?}", other),
        }
        match extract_timestamp("yesterday hello") {
            Err(TimestampError::Invalid { token, .. }) => assert_eq!(token, "yesterday"),
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[quickcheck_macros::quickcheck]
    fn prop_extract_timestamp_splits_valid_lines(secs: u32, nanos: u32, text: String) -> bool {
        let ts = Utc
            .timestamp_opt(i64::from(secs), nanos % 1_000_000_000)
            .unwrap();
        let line = format!(
            "{} {}",
            ts.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            text
        );
        match extract_timestamp(&line) {
            Ok((parsed, rest)) => parsed == ts && rest == text,
            Err(_) => false,
        }
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc\n"), b"abc");
        assert_eq!(trim_line_ending(b"abc"), b"abc");
    }

    struct Harness {
        processor: LineProcessor,
        rx: mpsc::Receiver<Entry>,
        positions: Arc<FilePositions>,
        metrics: Arc<Metrics>,
        _dir: tempfile::TempDir,
    }

    fn harness(stream: OutputStream, relabel_rules: Vec<RelabelRule>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let positions = FilePositions::new(PositionsConfig {
            filename: dir.path().join("positions.yaml"),
            read_only: true,
            ..Default::default()
        })
        .unwrap();
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(16);

        let mut labels = LabelSet::new();
        labels.insert("job".to_string(), "docker".to_string());
        labels.insert(
            "__meta_docker_container_id".to_string(),
            "abc".to_string(),
        );

        let processor = LineProcessor {
            container_id: "abc".to_string(),
            stream,
            labels,
            relabel_rules: relabel_rules.into(),
            handler: tx,
            positions: positions.clone(),
            metrics: Arc::clone(&metrics),
        };
        Harness {
            processor,
            rx,
            positions,
            metrics,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_forwards_lines_in_order_and_updates_cursor() {
        let Harness {
            processor,
            mut rx,
            positions,
            metrics,
            _dir,
        } = harness(OutputStream::Stdout, Vec::new());

        let input = "2023-01-01T00:00:01Z first\n\
                     2023-01-01T00:00:02Z second\r\n\
                     2023-01-01T00:00:03Z third";
        processor.run(input.as_bytes()).await;

        let mut lines = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            assert_eq!(entry.labels.get("logstream").map(String::as_str), Some("stdout"));
            assert_eq!(entry.labels.get("job").map(String::as_str), Some("docker"));
            assert!(!entry.labels.contains_key("__meta_docker_container_id"));
            lines.push((entry.timestamp.timestamp(), entry.line));
        }
        assert_eq!(
            lines,
            vec![
                (1_672_531_201, "first".to_string()),
                (1_672_531_202, "second".to_string()),
                (1_672_531_203, "third".to_string()),
            ]
        );
        assert_eq!(metrics.entries(), 3);
        assert_eq!(metrics.errors(), 0);
        assert_eq!(positions.get("cursor-abc").unwrap(), 1_672_531_203);
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped_and_counted() {
        let Harness {
            processor,
            mut rx,
            positions,
            metrics,
            _dir,
        } = harness(OutputStream::Stderr, Vec::new());

        let input = "2023-01-01T00:00:01Z one\n\
                     garbage\n\
                     2023-01-01T00:00:02Z two\n\
                     2023-01-01T00:00:03Z three\n";
        processor.run(input.as_bytes()).await;

        let mut count = 0;
        while let Ok(entry) = rx.try_recv() {
            assert_eq!(entry.labels.get("logstream").map(String::as_str), Some("stderr"));
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(metrics.entries(), 3);
        assert_eq!(metrics.errors(), 1);
        assert_eq!(positions.get("cursor-abc").unwrap(), 1_672_531_203);
    }

    #[tokio::test]
    async fn test_bad_timestamp_does_not_move_cursor() {
        let Harness {
            processor,
            mut rx,
            positions,
            metrics,
            _dir,
        } = harness(OutputStream::Stdout, Vec::new());

        processor
            .run("2023-13-45T00:00:00Z not a date\n".as_bytes())
            .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.errors(), 1);
        assert_eq!(positions.get_string("cursor-abc"), "");
    }

    #[tokio::test]
    async fn test_relabel_output_is_filtered() {
        let rules = crate::relabel::compile(vec![
            RelabelConfig {
                source_labels: vec!["__meta_docker_container_id".to_string()],
                target_label: Some("container_id".to_string()),
                ..Default::default()
            },
            RelabelConfig {
                source_labels: vec!["job".to_string()],
                target_label: Some("__tmp_job".to_string()),
                ..Default::default()
            },
        ])
        .unwrap();
        let Harness {
            processor, mut rx, ..
        } = harness(OutputStream::Stdout, rules);

        processor
            .run("2023-01-01T00:00:01Z hello\n".as_bytes())
            .await;

        let entry = rx.try_recv().unwrap();
        assert_eq!(
            entry.labels.get("container_id").map(String::as_str),
            Some("abc")
        );
        assert!(entry.labels.keys().all(|name| !name.starts_with("__")));
    }

    #[tokio::test]
    async fn test_dropped_label_set_still_forwards_line() {
        let rules = crate::relabel::compile(vec![RelabelConfig {
            source_labels: vec!["logstream".to_string()],
            regex: "stdout".to_string(),
            action: Action::Drop,
            ..Default::default()
        }])
        .unwrap();
        let Harness {
            processor, mut rx, ..
        } = harness(OutputStream::Stdout, rules);

        processor
            .run("2023-01-01T00:00:01Z hello\n".as_bytes())
            .await;

        let entry = rx.try_recv().unwrap();
        assert!(entry.labels.is_empty());
        assert_eq!(entry.line, "hello");
    }

    #[tokio::test]
    async fn test_backpressure_blocks_until_drained() {
        let Harness {
            processor,
            positions,
            _dir,
            ..
        } = harness(OutputStream::Stdout, Vec::new());
        let (tx, mut rx) = mpsc::channel(1);
        let processor = LineProcessor {
            handler: tx,
            ..processor
        };

        let (mut writer, reader) = tokio::io::duplex(1024);
        let task = tokio::spawn(processor.run(reader));

        writer
            .write_all(b"2023-01-01T00:00:01Z a\n2023-01-01T00:00:02Z b\n")
            .await
            .unwrap();
        drop(writer);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.line.as_str(), second.line.as_str()), ("a", "b"));
        task.await.unwrap();
        assert_eq!(positions.get("cursor-abc").unwrap(), 1_672_531_202);
    }

    #[tokio::test]
    async fn test_overlong_line_stops_scanning() {
        let Harness {
            processor,
            mut rx,
            positions,
            metrics,
            _dir,
        } = harness(OutputStream::Stdout, Vec::new());

        let mut input = b"2023-01-01T00:00:01Z before\n".to_vec();
        input.extend_from_slice(b"2023-01-01T00:00:02Z ");
        input.resize(input.len() + MAX_LINE_LEN, b'x');
        input.extend_from_slice(b"\n2023-01-01T00:00:03Z after\n");
        processor.run(&input[..]).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.line, "before");
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.entries(), 1);
        assert_eq!(positions.get("cursor-abc").unwrap(), 1_672_531_201);
    }

    #[tokio::test]
    async fn test_line_at_length_limit_is_accepted() {
        let Harness {
            processor, mut rx, ..
        } = harness(OutputStream::Stdout, Vec::new());

        let prefix = "2023-01-01T00:00:01Z ";
        let mut input = prefix.as_bytes().to_vec();
        input.resize(MAX_LINE_LEN, b'x');
        input.extend_from_slice(b"\r\n");
        processor.run(&input[..]).await;

        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.line.len(), MAX_LINE_LEN - prefix.len());
    }

    #[tokio::test]
    async fn test_closed_handler_stops_processing() {
        let Harness {
            processor,
            rx,
            metrics,
            _dir,
            ..
        } = harness(OutputStream::Stdout, Vec::new());
        drop(rx);

        processor
            .run("2023-01-01T00:00:01Z a\n2023-01-01T00:00:02Z b\n".as_bytes())
            .await;
        assert_eq!(metrics.entries(), 0);
    }
}
