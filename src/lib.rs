//! dabo library - Data-tier core for database business applications
//!
//! Provides backend dialects and drivers, a change-tracking cursor engine, a
//! SELECT builder, business objects with parent/child referential policies,
//! and loaders for field and relation specs.

pub mod bizobj;
pub mod config;
pub mod constants;
pub mod cursor;
pub mod db;
pub mod error;
pub mod spec;
pub mod sql_builder;
pub mod value;

pub use bizobj::{Bizobj, BizobjBuilder, BizobjHooks, Hook};
pub use config::{BackendKind, ConnectInfo, ConnectionDefinitions};
pub use constants::{Code, RefIntegrity};
pub use cursor::{Cursor, SortOrder};
pub use db::{Backend, Connection};
pub use error::{DaboError, ErrorLog, Result};
pub use sql_builder::SqlBuilder;
pub use value::{ColumnInfo, FieldType, Value};
