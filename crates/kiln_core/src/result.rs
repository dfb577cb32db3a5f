use crate::{ObjectId, ObjectUrl};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/**
 * Status of a build step.
 *
 * `NotProcessed -> Running -> {terminal}`. Once terminal, a status is never
 * changed again within the same build.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResultStatus {
    #[default]
    NotProcessed,
    Running,
    Successful,
    Failed,
    Cancelled,
    NotTriggeredWasSuccessful,
    NotTriggeredPrerequisiteFailed,
}

impl ResultStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResultStatus::NotProcessed | ResultStatus::Running)
    }

    /// Terminal statuses that prevent dependents from running
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ResultStatus::Failed | ResultStatus::Cancelled | ResultStatus::NotTriggeredPrerequisiteFailed
        )
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResultStatus::Successful | ResultStatus::NotTriggeredWasSuccessful
        )
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResultStatus::NotProcessed => "not processed",
            ResultStatus::Running => "running",
            ResultStatus::Successful => "successful",
            ResultStatus::Failed => "failed",
            ResultStatus::Cancelled => "cancelled",
            ResultStatus::NotTriggeredWasSuccessful => "up-to-date",
            ResultStatus::NotTriggeredPrerequisiteFailed => "prerequisite failed",
        };
        f.write_str(text)
    }
}

/// Overall outcome of a builder run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResultCode {
    Successful,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

/// A message logged by a command while it executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/**
 * Everything a command execution produced.
 *
 * Persisted in the result cache under the command's cache key and read back
 * on later builds to decide whether the command can be skipped.
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: ResultStatus,

    /** Every output written, with the hash of its content */
    #[serde(default)]
    pub output_objects: BTreeMap<ObjectUrl, ObjectId>,

    /** Version of every input observed while executing */
    #[serde(default)]
    pub input_dependency_versions: BTreeMap<ObjectUrl, ObjectId>,

    #[serde(default)]
    pub tags: BTreeMap<ObjectUrl, BTreeSet<String>>,

    #[serde(default)]
    pub log: Vec<LogEntry>,
}

impl CommandResult {
    pub fn new(status: ResultStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /**
     * Fold another result's outputs, inputs and tags into this one.
     * Entries already present are kept.
     */
    pub fn merge(&mut self, other: &CommandResult) {
        for (url, id) in &other.output_objects {
            self.output_objects.entry(url.clone()).or_insert(*id);
        }
        for (url, id) in &other.input_dependency_versions {
            self.input_dependency_versions
                .entry(url.clone())
                .or_insert(*id);
        }
        for (url, tags) in &other.tags {
            self.tags
                .entry(url.clone())
                .or_default()
                .extend(tags.iter().cloned());
        }
    }

    /// True when the result references the given url path as an input
    pub fn depends_on_path(&self, path: &str) -> bool {
        self.input_dependency_versions
            .keys()
            .any(|url| url.path == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ResultStatus::NotProcessed.is_terminal());
        assert!(!ResultStatus::Running.is_terminal());
        assert!(ResultStatus::Successful.is_terminal());
        assert!(ResultStatus::NotTriggeredPrerequisiteFailed.is_terminal());

        assert!(ResultStatus::Cancelled.is_failure());
        assert!(!ResultStatus::NotTriggeredWasSuccessful.is_failure());
        assert!(ResultStatus::NotTriggeredWasSuccessful.is_success());
    }

    #[test]
    fn test_result_json_uses_string_keys() {
        let mut result = CommandResult::new(ResultStatus::Successful);
        result
            .output_objects
            .insert(ObjectUrl::content("meshes/rock"), ObjectId::EMPTY);

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"content:meshes/rock\""));

        let back: CommandResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_merge_keeps_existing_entries() {
        let first = ObjectId::from_bytes([1; 32]);
        let second = ObjectId::from_bytes([2; 32]);

        let mut parent = CommandResult::new(ResultStatus::Successful);
        parent
            .output_objects
            .insert(ObjectUrl::content("a"), first);

        let mut child = CommandResult::new(ResultStatus::Successful);
        child.output_objects.insert(ObjectUrl::content("a"), second);
        child
            .input_dependency_versions
            .insert(ObjectUrl::file("src/a.fbx"), second);

        parent.merge(&child);
        assert_eq!(parent.output_objects[&ObjectUrl::content("a")], first);
        assert!(parent.depends_on_path("src/a.fbx"));
    }
}
