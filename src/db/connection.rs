//! Lazy-open shared connection.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, info};

use super::backend::{Backend, backend_for};
use super::driver::{RawConnection, RawResult};
use crate::config::ConnectInfo;
use crate::cursor::Cursor;
use crate::error::{DaboError, Result};
use crate::value::{FieldInfo, Value};

/// One backend connection shared by every cursor and bizobj bound to it.
///
/// The driver handle is opened on first use. The connection also tracks
/// whether a transaction is active so nested saves never issue a second
/// `BEGIN`.
pub struct Connection {
    info: ConnectInfo,
    backend: Box<dyn Backend>,
    raw: RefCell<Option<Box<dyn RawConnection>>>,
    in_transaction: Cell<bool>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("open", &self.is_open())
            .field("in_transaction", &self.in_transaction.get())
            .finish()
    }
}

impl Connection {
    /// Connection that opens its driver on first use.
    pub fn new(info: ConnectInfo) -> Rc<Self> {
        let backend = backend_for(info.backend);
        Rc::new(Self {
            info,
            backend,
            raw: RefCell::new(None),
            in_transaction: Cell::new(false),
        })
    }

    /// Connection over an already-open driver, with an explicit dialect.
    pub fn with_driver(
        info: ConnectInfo,
        backend: Box<dyn Backend>,
        raw: Box<dyn RawConnection>,
    ) -> Rc<Self> {
        Rc::new(Self {
            info,
            backend,
            raw: RefCell::new(Some(raw)),
            in_transaction: Cell::new(false),
        })
    }

    /// Connection opened immediately.
    ///
    /// # Errors
    /// Returns `DaboError::ConnectFailure` when the backend cannot be reached.
    pub fn open(info: ConnectInfo) -> Result<Rc<Self>> {
        let conn = Self::new(info);
        conn.ensure_open()?;
        Ok(conn)
    }

    /// New cursor bound to this connection.
    pub fn cursor(self: &Rc<Self>) -> Cursor {
        Cursor::new(Rc::clone(self))
    }

    pub fn info(&self) -> &ConnectInfo {
        &self.info
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.raw.borrow().is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        info!(backend = %self.info.backend, database = %self.info.database, "opening connection");
        let raw = self.backend.open_connection(&self.info)?;
        *self.raw.borrow_mut() = Some(raw);
        Ok(())
    }

    /// Run `f` against the open driver handle.
    pub(crate) fn with_raw<T>(
        &self,
        f: impl FnOnce(&dyn Backend, &mut dyn RawConnection) -> Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        let mut guard = self.raw.borrow_mut();
        let raw = guard.as_mut().ok_or_else(|| DaboError::ConnectFailure {
            backend: self.info.backend.to_string(),
            database: self.info.database.clone(),
            message: "connection is closed".into(),
        })?;
        f(self.backend.as_ref(), raw.as_mut())
    }

    /// Execute one statement with positional parameters.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<RawResult> {
        debug!(sql, params = params.len(), "execute");
        self.with_raw(|backend, raw| {
            let mut result = raw.execute(sql, params)?;
            backend.massage_description(&mut result.description);
            Ok(result)
        })
    }

    pub fn close(&self) -> Result<()> {
        if let Some(mut raw) = self.raw.borrow_mut().take() {
            info!(database = %self.info.database, "closing connection");
            self.in_transaction.set(false);
            raw.close()?;
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.get()
    }

    /// Start a transaction. Returns `false` when one is already active, in
    /// which case the caller must not commit or roll back.
    pub fn begin(&self) -> Result<bool> {
        if self.in_transaction.get() {
            return Ok(false);
        }
        debug!("begin transaction");
        self.with_raw(|backend, raw| backend.begin_transaction(raw))?;
        self.in_transaction.set(true);
        Ok(true)
    }

    pub fn commit(&self) -> Result<()> {
        debug!("commit");
        self.in_transaction.set(false);
        self.with_raw(|backend, raw| backend.commit(raw))
    }

    pub fn rollback(&self) -> Result<()> {
        debug!("rollback");
        self.in_transaction.set(false);
        self.with_raw(|backend, raw| backend.rollback(raw))
    }

    /// Make preceding DML durable on dialects that need it.
    pub fn flush(&self) -> Result<()> {
        let in_transaction = self.in_transaction.get();
        self.with_raw(|backend, raw| backend.flush(raw, in_transaction))
    }

    pub fn pregenerate_primary_key(&self, table: &str, key_field: &str) -> Result<Option<Value>> {
        self.with_raw(|backend, raw| backend.pregenerate_primary_key(raw, table, key_field))
    }

    pub fn last_insert_id(&self, table: &str, key_field: &str) -> Result<Option<Value>> {
        self.with_raw(|backend, raw| backend.last_insert_id(raw, table, key_field))
    }

    pub fn get_tables(&self) -> Result<Vec<String>> {
        self.with_raw(|backend, raw| backend.get_tables(raw))
    }

    pub fn get_fields(&self, table: &str) -> Result<Vec<FieldInfo>> {
        self.with_raw(|backend, raw| backend.get_fields(raw, table))
    }

    pub fn get_table_record_count(&self, table: &str) -> Result<u64> {
        self.with_raw(|backend, raw| backend.get_table_record_count(raw, table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::backend::{Sqlite, SqliteDriver};
    use crate::db::driver::RecordingDriver;
    use rstest::rstest;

    #[rstest]
    fn test_lazy_open() {
        let conn = Connection::new(ConnectInfo::sqlite_memory());
        assert!(!conn.is_open());
        conn.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();
        assert!(conn.is_open());
        assert_eq!(conn.get_tables().unwrap(), vec!["t"]);

        conn.close().unwrap();
        assert!(!conn.is_open());
    }

    #[rstest]
    fn test_begin_never_nests() {
        let (driver, log) = RecordingDriver::new(Box::new(SqliteDriver::open_in_memory().unwrap()));
        let conn = Connection::with_driver(
            ConnectInfo::sqlite_memory(),
            Box::new(Sqlite),
            Box::new(driver),
        );

        assert!(conn.begin().unwrap());
        assert!(!conn.begin().unwrap());
        assert!(conn.in_transaction());
        conn.commit().unwrap();
        assert!(!conn.in_transaction());

        assert_eq!(log.statements(), vec!["BEGIN", "COMMIT"]);
    }

    #[rstest]
    fn test_rollback_discards_changes() {
        let conn = Connection::open(ConnectInfo::sqlite_memory()).unwrap();
        conn.execute("CREATE TABLE t (a INTEGER)", &[]).unwrap();
        conn.begin().unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        conn.rollback().unwrap();
        assert_eq!(conn.get_table_record_count("t").unwrap(), 0);
    }

    #[rstest]
    fn test_open_failure_is_fatal() {
        let err = Connection::open(ConnectInfo::postgres("127.0.0.1", "nobody", "x"))
            .map(|_| ())
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
