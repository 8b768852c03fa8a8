//! Task types.

use crate::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named unit of work a worker process can perform.
///
/// Identity is keyed by `name`; the id is minted the first time the name is
/// discovered and kept for every later discovery of the same name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Task name as reported by the worker.
    pub name: String,

    /// When the name was first discovered.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a new Task with a freshly minted id.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Whether `identifier` refers to this task.
    ///
    /// Accepts the exact id, the exact name, or `prefix/name`. Names may
    /// themselves contain `/`.
    pub fn matches_identifier(&self, identifier: &str) -> bool {
        if self.id.as_str() == identifier || self.name == identifier {
            return true;
        }
        identifier
            .strip_suffix(self.name.as_str())
            .is_some_and(|prefix| prefix.ends_with('/'))
    }
}

/// One entry of a worker's task catalogue, as reported during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTask {
    pub name: String,
}

impl DiscoveredTask {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_exact_id() {
        let task = Task::new("double").with_id(TaskId::new("t-1"));
        assert!(task.matches_identifier("t-1"));
    }

    #[test]
    fn test_matches_workflow_suffix() {
        let task = Task::new("double");
        assert!(task.matches_identifier("double"));
        assert!(task.matches_identifier("math/double"));
        assert!(!task.matches_identifier("math/triple"));
        assert!(!task.matches_identifier("double/math"));
        assert!(!task.matches_identifier("redouble"));
    }

    #[test]
    fn test_matches_name_containing_slash() {
        let task = Task::new("math/double");
        assert!(task.matches_identifier("math/double"));
        assert!(task.matches_identifier("wf/math/double"));
        assert!(!task.matches_identifier("double"));
        assert!(!task.matches_identifier("wf/double"));
    }
}
