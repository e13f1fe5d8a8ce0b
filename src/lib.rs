//! # sqlite-wal-driver
//!
//! A SQLite driver that routes every statement to the right connection of a
//! [`sqlite_wal_pool`] pool.
//!
//! - Writes go to the single writer connection; reads go to a pooled reader
//!   while the database is in WAL mode, and to the writer otherwise.
//! - A transaction pins the writer to the task that opened it. Nested
//!   transactions share that connection and only the outermost one commits.
//! - `PRAGMA journal_mode = ...` runs through the pool's transition, which
//!   drains the readers and rebuilds them for the new mode.
//! - The schema is created or migrated once, on first use, with foreign keys
//!   off and checked afterwards.
//! - Listeners keyed by table or query name hear about data changes the
//!   caller reports through [`SqliteDriver::notify_listeners`].
//!
//! Transactions belong to logical tasks. [`SqliteDriver::transaction`] sets
//! one up by itself; explicit [`SqliteDriver::new_transaction`] calls must run
//! inside [`task_scope`].

mod configurable;
mod driver;
mod error;
mod executor;
mod schema;
mod transactions;

pub use configurable::ConfigurableDriver;
pub use driver::{SqliteDriver, SqliteDriverBuilder};
pub use error::{Error, ForeignKeyViolation, Result};
pub use executor::{Binder, Executor};
pub use schema::{AfterVersion, DriverCallbacks, MigrationFuture, NoCallbacks, Schema};
pub use transactions::{TaskToken, TransactionHandle, task_scope};

pub use sqlite_query_observer::{QueryChange, QueryChangeStream, QueryListener, QueryObserver};
pub use sqlite_wal_pool::{
   ConcurrencyModel, ConnectionFactory, ConnectionId, ConnectionPool, Cursor, DatabaseType, JournalMode,
   SqliteConfig, SqliteValue, Statement, StatementId, SyncMode,
};
