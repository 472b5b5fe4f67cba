//! Captured output lines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// A single line read from a child's stdout or stderr
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    /// When the line was read
    pub timestamp: DateTime<Utc>,
    /// Which stream it came from
    pub source: LogSource,
    /// Line contents without the trailing newline
    pub line: String,
}

impl OutputLine {
    /// Create a line stamped with the current time
    pub fn new(source: LogSource, line: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            line: line.into(),
        }
    }
}
