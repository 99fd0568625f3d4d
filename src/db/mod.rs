//! Database layer: driver contract, dialect adapters and connections.
//!
//! # Architecture
//!
//! A [`Connection`] pairs one [`RawConnection`] (the driver handle that runs
//! statements) with one [`Backend`] (the dialect adapter that renders SQL
//! text and issues transaction verbs). The two are plain collaborators; the
//! cursor layer holds a shared `Rc<Connection>` and never sees a driver type.

pub mod backend;
mod connection;
pub mod driver;
pub mod escape;

pub use backend::{Backend, Firebird, Postgres, PostgresDriver, Sqlite, SqliteDriver, backend_for};
pub use connection::Connection;
pub use driver::{RawConnection, RawResult, RecordingDriver, StatementLog};
pub use escape::{escape_string, escape_string_standard, quote_identifier};
