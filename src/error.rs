//! Typed failures and the per-operation error log.

use thiserror::Error;

use crate::constants::Code;

/// Failures raised by the data tier.
///
/// Only [`DaboError::ConnectFailure`] escapes cursor and bizobj operations;
/// statement failures are captured into an [`ErrorLog`] and reported as a
/// [`Code`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaboError {
    #[error("Failed to connect to {backend} database '{database}': {message}")]
    ConnectFailure {
        backend: String,
        database: String,
        message: String,
    },

    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Integrity violation: {message}")]
    Integrity { message: String },

    #[error("No records in the data set")]
    NoRecords,

    #[error("Field '{name}' does not exist in the data set")]
    FieldNotFound { name: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid spec: {message}")]
    Spec { message: String },
}

impl DaboError {
    pub fn backend(message: impl Into<String>) -> Self {
        DaboError::Backend {
            message: message.into(),
        }
    }

    /// True for failures that must bubble out of cursor operations.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaboError::ConnectFailure { .. })
    }
}

pub type Result<T, E = DaboError> = std::result::Result<T, E>;

/// One failure recorded during an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    /// Table or bizobj name the failure came from.
    pub source: String,
    pub code: Code,
    pub message: String,
}

/// Additive list of failures, cleared at the start of each public operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorLog {
    records: Vec<ErrorRecord>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn push(&mut self, source: impl Into<String>, code: Code, message: impl Into<String>) {
        self.records.push(ErrorRecord {
            source: source.into(),
            code,
            message: message.into(),
        });
    }

    /// Append every record of another log.
    pub fn extend(&mut self, other: &ErrorLog) {
        self.records.extend(other.records.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[ErrorRecord] {
        &self.records
    }

    /// True when any message contains `text`.
    pub fn contains(&self, text: &str) -> bool {
        self.records.iter().any(|r| r.message.contains(text))
    }

    /// Messages joined by newlines, for display.
    pub fn render(&self) -> String {
        self.records
            .iter()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn test_render_joins_with_newline() {
        let mut log = ErrorLog::new();
        log.push("customer", Code::FileCancel, "first");
        log.push("orders", Code::FileCancel, "second");
        assert_eq!(log.render(), "first\nsecond");
        assert_eq!(log.len(), 2);
        assert!(log.contains("sec"));
    }

    #[rstest]
    fn test_extend_and_clear() {
        let mut child = ErrorLog::new();
        child.push("orders", Code::FileCancel, "child failed");

        let mut parent = ErrorLog::new();
        parent.extend(&child);
        assert_eq!(parent.records()[0].source, "orders");

        parent.clear();
        assert!(parent.is_empty());
        assert_eq!(parent.render(), "");
    }

    #[rstest]
    fn test_only_connect_failure_is_fatal() {
        let connect = DaboError::ConnectFailure {
            backend: "sqlite".into(),
            database: "x.db".into(),
            message: "boom".into(),
        };
        assert!(connect.is_fatal());
        assert!(!DaboError::backend("syntax error").is_fatal());
        assert!(connect.to_string().contains("x.db"));
    }
}
