pub mod docker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::LabelSet;

/// Every kind of target the agent knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetType {
    Docker,
    File,
    Journal,
    Syslog,
    Push,
}

impl AsRef<str> for TargetType {
    fn as_ref(&self) -> &str {
        match self {
            Self::Docker => "Docker",
            Self::File => "File",
            Self::Journal => "Journal",
            Self::Syslog => "Syslog",
            Self::Push => "Push",
        }
    }
}

/// The capabilities a supervisor needs from any running target.
#[async_trait]
pub trait Target: Send + Sync {
    fn target_type(&self) -> TargetType;
    /// Whether the target is currently producing entries.
    fn ready(&self) -> bool;
    fn discovered_labels(&self) -> LabelSet;
    fn labels(&self) -> LabelSet;
    /// Target specific debug information.
    fn details(&self) -> serde_json::Value;
    /// Stop the target and wait for all of its work to finish.
    async fn stop(&self);
}
