//! Captured worker log lines and the filters used to query them.

use crate::{LogId, RunId};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogId,

    /// Owning run. `None` for output captured during a discovery pass.
    pub run_id: Option<RunId>,

    pub message: String,

    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(run_id: Option<RunId>, message: impl Into<String>) -> Self {
        Self {
            id: LogId::generate(),
            run_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Builder method to set the timestamp (useful for testing).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Text predicate over a log message.
#[derive(Debug, Clone)]
enum TextMatcher {
    Pattern(Regex),
    Literal(String),
}

impl TextMatcher {
    fn parse(text: &str) -> Self {
        match Regex::new(text) {
            Ok(re) => Self::Pattern(re),
            Err(_) => Self::Literal(text.to_string()),
        }
    }

    fn is_match(&self, message: &str) -> bool {
        match self {
            Self::Pattern(re) => re.is_match(message),
            Self::Literal(s) => message.contains(s.as_str()),
        }
    }
}

/// Conjunctive filter over log entries. Unset predicates match everything.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Entry must belong to one of these runs (when non-empty).
    pub run_ids: Vec<RunId>,

    /// Inclusive lower bound. Also requests backlog replay on subscribe.
    pub start_time: Option<DateTime<Utc>>,

    /// Inclusive upper bound.
    pub end_time: Option<DateTime<Utc>>,

    text: Option<TextMatcher>,
}

impl LogFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_ids(mut self, run_ids: impl IntoIterator<Item = RunId>) -> Self {
        self.run_ids = run_ids.into_iter().collect();
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    /// Match messages against `text` as a regular expression, or as a plain
    /// substring if it is not a valid pattern.
    pub fn with_text(mut self, text: &str) -> Self {
        self.text = (!text.is_empty()).then(|| TextMatcher::parse(text));
        self
    }

    pub fn matches(&self, entry: &LogEntry) -> bool {
        if !self.run_ids.is_empty() {
            match &entry.run_id {
                Some(run_id) if self.run_ids.contains(run_id) => {}
                _ => return false,
            }
        }
        if self.start_time.is_some_and(|start| entry.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| entry.timestamp > end) {
            return false;
        }
        if let Some(text) = &self.text {
            if !text.is_match(&entry.message) {
                return false;
            }
        }
        true
    }
}
