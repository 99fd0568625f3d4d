//! The driver contract consumed by backends and connections.
//!
//! A driver executes one statement at a time and hands back the column
//! description, the fetched rows and the affected-row count. Dialect logic
//! never lives here; see [`Backend`](super::Backend).

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::Result;
use crate::value::{ColumnInfo, Value};

/// Result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawResult {
    pub description: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Value>>,
    /// Rows affected by DML; 0 for queries
    pub rowcount: u64,
}

impl RawResult {
    /// Result of a statement that returns no rows.
    pub fn affected(rowcount: u64) -> Self {
        Self {
            description: Vec::new(),
            rows: Vec::new(),
            rowcount,
        }
    }

    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// A live backend handle.
pub trait RawConnection {
    /// Execute one statement with positional parameters.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<RawResult>;

    /// Execute parameterless statements such as transaction verbs.
    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.execute(sql, &[]).map(|_| ())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Statements seen by a [`RecordingDriver`].
#[derive(Debug, Clone, Default)]
pub struct StatementLog {
    statements: Rc<RefCell<Vec<String>>>,
}

impl StatementLog {
    pub fn statements(&self) -> Vec<String> {
        self.statements.borrow().clone()
    }

    /// Statements starting with `prefix` (case-insensitive), e.g. `"DELETE"`.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.to_ascii_uppercase();
        self.statements
            .borrow()
            .iter()
            .filter(|s| s.trim_start().to_ascii_uppercase().starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.statements.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.statements.borrow_mut().clear();
    }

    fn record(&self, sql: &str) {
        self.statements.borrow_mut().push(sql.to_string());
    }
}

/// Driver decorator that records the text of every statement it forwards.
pub struct RecordingDriver {
    inner: Box<dyn RawConnection>,
    log: StatementLog,
}

impl RecordingDriver {
    pub fn new(inner: Box<dyn RawConnection>) -> (Self, StatementLog) {
        let log = StatementLog::default();
        let driver = Self {
            inner,
            log: log.clone(),
        };
        (driver, log)
    }
}

impl RawConnection for RecordingDriver {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<RawResult> {
        self.log.record(sql);
        self.inner.execute(sql, params)
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.log.record(sql);
        self.inner.execute_batch(sql)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    struct EchoDriver;

    impl RawConnection for EchoDriver {
        fn execute(&mut self, _sql: &str, params: &[Value]) -> Result<RawResult> {
            Ok(RawResult {
                description: vec![],
                rows: vec![params.to_vec()],
                rowcount: 0,
            })
        }
    }

    #[rstest]
    fn test_recording_driver_logs_and_forwards() {
        let (mut driver, log) = RecordingDriver::new(Box::new(EchoDriver));
        let result = driver.execute("SELECT ?", &[Value::Int(7)]).unwrap();
        driver.execute_batch("BEGIN").unwrap();
        driver.execute("delete from t", &[]).unwrap();

        assert_eq!(result.scalar(), Some(&Value::Int(7)));
        assert_eq!(log.statements(), vec!["SELECT ?", "BEGIN", "delete from t"]);
        assert_eq!(log.matching("DELETE"), vec!["delete from t"]);

        log.clear();
        assert!(log.is_empty());
    }

    #[rstest]
    fn test_affected_result_has_no_rows() {
        let result = RawResult::affected(3);
        assert_eq!(result.rowcount, 3);
        assert!(result.scalar().is_none());
    }
}
