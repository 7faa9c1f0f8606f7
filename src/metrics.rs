use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by docker targets.
///
/// A single instance is usually shared by every target of the agent
/// through an `Arc`, so the values are aggregated across containers.
#[derive(Debug, Default)]
pub struct Metrics {
    entries: AtomicU64,
    errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc_entries(&self) {
        self.entries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Lines forwarded to the entry sink.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// Lines dropped because no timestamp could be extracted.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
