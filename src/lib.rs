//! Docker log target: follows a container's combined log stream, splits it
//! into stdout and stderr, extracts per-line timestamps, relabels and
//! forwards entries while persisting a resumable cursor.

pub mod api;
pub mod client;
pub mod config;
pub mod metrics;
pub mod positions;
pub mod relabel;
pub mod target;

pub use api::{Entry, LabelSet};
pub use metrics::Metrics;
pub use positions::{FilePositions, Positions};
pub use target::docker::{DockerTarget, DockerTargetDetails};
pub use target::{Target, TargetType};
