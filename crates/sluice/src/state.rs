//! Stream state: status and row accounting

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a stream. Terminal statuses are sticky: once a stream
/// leaves `Active` it never comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Completed,
    Aborted,
    Failed,
}

impl StreamStatus {
    pub fn is_terminal(self) -> bool {
        self != StreamStatus::Active
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamStatus::Active => "active",
            StreamStatus::Completed => "completed",
            StreamStatus::Aborted => "aborted",
            StreamStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Cumulative per-stream accounting, returned from every stream call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    pub status: StreamStatus,
    pub processed_rows: u64,
    pub successful_rows: u64,
    /// 1-based index of the most recent failed row, if any.
    pub error_row_index: Option<u64>,
    /// Rendered form of the most recent error, if any.
    pub last_error: Option<String>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            status: StreamStatus::Active,
            processed_rows: 0,
            successful_rows: 0,
            error_row_index: None,
            last_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == StreamStatus::Active
    }

    /// Record a row-level failure at the current processed position.
    pub fn record_row_error(&mut self, error: &crate::error::IngestError) {
        self.error_row_index = Some(self.processed_rows);
        self.last_error = Some(error.to_string());
    }

    /// Move to a terminal status; once terminal, the status never changes.
    pub fn transition(&mut self, to: StreamStatus) {
        if !self.status.is_terminal() {
            self.status = to;
        }
    }

    /// Rows that failed: everything processed but not successful.
    pub fn failed_rows(&self) -> u64 {
        self.processed_rows - self.successful_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_active() {
        let state = StreamState::new();
        assert!(state.is_active());
        assert_eq!(state.processed_rows, 0);
        assert_eq!(state.successful_rows, 0);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_terminal_statuses_sticky() {
        let mut state = StreamState::new();
        state.transition(StreamStatus::Aborted);
        assert_eq!(state.status, StreamStatus::Aborted);

        state.transition(StreamStatus::Completed);
        assert_eq!(state.status, StreamStatus::Aborted);

        state.transition(StreamStatus::Failed);
        assert_eq!(state.status, StreamStatus::Aborted);
    }

    #[test]
    fn test_row_accounting() {
        let mut state = StreamState::new();
        state.processed_rows = 5;
        state.successful_rows = 3;
        assert_eq!(state.failed_rows(), 2);
    }

    #[test]
    fn test_record_row_error() {
        let mut state = StreamState::new();
        state.processed_rows = 3;
        state.record_row_error(&crate::error::IngestError::Canceled);
        assert_eq!(state.error_row_index, Some(3));
        assert!(state.last_error.is_some());
        assert!(state.is_active());
    }
}
