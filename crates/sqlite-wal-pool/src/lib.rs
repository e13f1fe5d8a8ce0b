//! # sqlite-wal-pool
//!
//! Connection pooling for SQLite with one exclusive writer and a queue of
//! reader connections that exists only while WAL makes readers useful.
//!
//! ## Core Types
//!
//! - **[`WalConnectionPool`]**: writer mutex plus a lazily populated reader queue
//! - **[`PassthroughConnectionPool`]**: single delegated connection for drivers that pool internally
//! - **[`ConcurrencyModel`]**: how many readers sit next to the writer
//! - **[`StatementCache`]**: per-connection LRU of prepared statements, closed on eviction
//! - **[`classify`]**: spots the pragmas that need special routing
//! - **[`WriterGuard`]** / **[`ReaderGuard`]**: RAII guards that release on drop
//!
//! ## Architecture
//!
//! - **Lazy connections**: the writer and each reader are opened on first use
//! - **Reader fallback**: with no readers, or none free in time, readers get the writer
//! - **Journal mode transitions**: readers are drained and closed before the writer's
//!   journal mode changes, then rebuilt for the mode SQLite reports
//! - **Ordered configuration**: journal mode, then synchronous, then foreign keys
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sqlite_wal_pool::{ConnectionPool, DatabaseType, SqliteConfig, WalConnectionPool};
//!
//! #[tokio::main]
//! async fn main() -> sqlite_wal_pool::Result<()> {
//!    let pool: Arc<dyn ConnectionPool> = Arc::new(WalConnectionPool::open(
//!       &DatabaseType::File("example.db".into()),
//!       &SqliteConfig::default(),
//!       None,
//!    )?);
//!
//!    let writer = pool.acquire_writer().await?;
//!    writer.execute_batch("CREATE TABLE IF NOT EXISTS users (name TEXT)")?;
//!    drop(writer);
//!
//!    let reader = pool.acquire_reader().await?;
//!    let mut statement = reader.prepare("SELECT COUNT(*) FROM users")?;
//!    statement.step()?;
//!    println!("{:?}", statement.get_i64(0));
//!    drop(statement);
//!    drop(reader);
//!
//!    let mode: String = pool
//!       .set_journal_mode(|writer| {
//!          let mode = writer.query_text("PRAGMA journal_mode = DELETE")?.unwrap_or_default();
//!          Ok::<_, sqlite_wal_pool::Error>((mode.clone(), mode))
//!       })
//!       .await?;
//!    assert_eq!(mode, "delete");
//!
//!    pool.close().await?;
//!    Ok(())
//! }
//! ```
//!
mod concurrency;
mod config;
mod connection;
mod error;
mod passthrough;
mod pool;
mod pragma;
mod statement;
mod statement_cache;
mod write_guard;

// Re-export public types
pub use concurrency::ConcurrencyModel;
pub use config::{DatabaseType, JournalMode, SqliteConfig, SyncMode};
pub use connection::{Connection, ConnectionFactory, ConnectionId, SqlxConnectionFactory};
pub use error::Error;
pub use passthrough::PassthroughConnectionPool;
pub use pool::{CloseListener, ConnectionPool, JournalModeChange, PoolSettings, WalConnectionPool};
pub use pragma::{PragmaKind, classify};
pub use statement::{Cursor, SqliteValue, Statement, StatementId};
pub use statement_cache::{CachedStatement, StatementCache};
pub use write_guard::{ReaderGuard, WriterGuard};

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
