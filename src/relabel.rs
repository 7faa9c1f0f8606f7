//! Prometheus-style relabeling of label sets.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::api::LabelSet;

fn default_separator() -> String {
    ";".to_string()
}

fn default_regex() -> String {
    "(.*)".to_string()
}

fn default_replacement() -> String {
    "$1".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Replace,
    Keep,
    Drop,
    #[serde(alias = "label_map")]
    LabelMap,
    #[serde(alias = "label_drop")]
    LabelDrop,
    #[serde(alias = "label_keep")]
    LabelKeep,
    Lowercase,
    Uppercase,
}

/// A relabel rule as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelabelConfig {
    #[serde(default)]
    pub source_labels: Vec<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_regex")]
    pub regex: String,
    #[serde(default)]
    pub target_label: Option<String>,
    #[serde(default = "default_replacement")]
    pub replacement: String,
    #[serde(default)]
    pub action: Action,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        Self {
            source_labels: Vec::new(),
            separator: default_separator(),
            regex: default_regex(),
            target_label: None,
            replacement: default_replacement(),
            action: Action::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelabelError {
    #[error("invalid relabel regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("relabel configuration for {0:?} action requires 'target_label' value")]
    MissingTargetLabel(Action),
}

/// A validated relabel rule with its regex compiled and anchored.
#[derive(Debug, Clone)]
pub struct RelabelRule {
    source_labels: Vec<String>,
    separator: String,
    regex: Regex,
    target_label: String,
    replacement: String,
    action: Action,
}

impl TryFrom<RelabelConfig> for RelabelRule {
    type Error = RelabelError;

    fn try_from(config: RelabelConfig) -> Result<Self, Self::Error> {
        let regex = Regex::new(&format!("^(?:{})$", config.regex))?;
        let target_label = match (config.action, config.target_label) {
            (Action::Replace | Action::Lowercase | Action::Uppercase, None) => {
                return Err(RelabelError::MissingTargetLabel(config.action));
            }
            (_, target_label) => target_label.unwrap_or_default(),
        };

        Ok(Self {
            source_labels: config.source_labels,
            separator: config.separator,
            regex,
            target_label,
            replacement: config.replacement,
            action: config.action,
        })
    }
}

/// Compile a list of configured rules, keeping their order.
pub fn compile(configs: Vec<RelabelConfig>) -> Result<Vec<RelabelRule>, RelabelError> {
    configs.into_iter().map(RelabelRule::try_from).collect()
}

/// Apply `rules` in order. Returns `None` when a `keep` or `drop` rule
/// discarded the whole set.
pub fn process(labels: &LabelSet, rules: &[RelabelRule]) -> Option<LabelSet> {
    let mut labels = labels.clone();
    for rule in rules {
        if !rule.apply(&mut labels) {
            return None;
        }
    }
    Some(labels)
}

impl RelabelRule {
    /// Returns false when the label set must be dropped.
    fn apply(&self, labels: &mut LabelSet) -> bool {
        let value = self
            .source_labels
            .iter()
            .map(|name| labels.get(name).map(String::as_str).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(&self.separator);

        match self.action {
            Action::Drop => {
                if self.regex.is_match(&value) {
                    return false;
                }
            }
            Action::Keep => {
                if !self.regex.is_match(&value) {
                    return false;
                }
            }
            Action::Replace => {
                let Some(captures) = self.regex.captures(&value) else {
                    return true;
                };
                let mut target = String::new();
                captures.expand(&self.target_label, &mut target);
                if !is_valid_label_name(&target) {
                    return true;
                }
                let mut replaced = String::new();
                captures.expand(&self.replacement, &mut replaced);
                if replaced.is_empty() {
                    labels.remove(&target);
                } else {
                    labels.insert(target, replaced);
                }
            }
            Action::Lowercase => {
                labels.insert(self.target_label.clone(), value.to_lowercase());
            }
            Action::Uppercase => {
                labels.insert(self.target_label.clone(), value.to_uppercase());
            }
            Action::LabelMap => {
                let mapped: Vec<(String, String)> = labels
                    .iter()
                    .filter(|(name, _)| self.regex.is_match(name))
                    .map(|(name, value)| {
                        let name = self
                            .regex
                            .replace_all(name, self.replacement.as_str())
                            .into_owned();
                        (name, value.clone())
                    })
                    .collect();
                labels.extend(mapped);
            }
            Action::LabelDrop => labels.retain(|name, _| !self.regex.is_match(name)),
            Action::LabelKeep => labels.retain(|name, _| self.regex.is_match(name)),
        }
        true
    }
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
