use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

/// Ordered label set. Keys are unique.
pub type LabelSet = BTreeMap<String, String>;

/// Labels starting with this prefix are internal to the pipeline
/// and are never forwarded.
pub const RESERVED_LABEL_PREFIX: &str = "__";

/// One log record produced by a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Render labels the way Prometheus prints them: `{a="b", c="d"}`.
pub fn format_labels(labels: &LabelSet) -> String {
    let mut out = String::with_capacity(2 + labels.len() * 16);
    out.push('{');
    for (i, (name, value)) in labels.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        // Writing into a String can not fail
        let _ = write!(out, "{name}={value:?}");
    }
    out.push('}');
    out
}

/// Remove every label reserved for internal use.
pub fn strip_reserved(labels: LabelSet) -> LabelSet {
    labels
        .into_iter()
        .filter(|(name, _)| !name.starts_with(RESERVED_LABEL_PREFIX))
        .collect()
}
