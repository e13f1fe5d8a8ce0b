//! Error types for sqlite-wal-pool

use thiserror::Error;

/// Errors that may occur when working with sqlite-wal-pool
#[derive(Error, Debug)]
pub enum Error {
   /// Error from the sqlx library, raised while opening or closing connections
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// Error reported by SQLite while preparing, binding, or stepping a statement
   #[error("SQLite error {code}: {message}")]
   Sqlite { code: i32, message: String },

   /// Pool has been closed and cannot hand out connections
   #[error("Database has been closed")]
   DatabaseClosed,

   /// Rejected configuration value
   #[error("Invalid configuration: {0}")]
   InvalidConfig(String),

   /// The SQL text contained only whitespace or comments
   #[error("SQL contains no statement: {0}")]
   EmptyStatement(String),

   /// Bind index past the statement's parameter count
   #[error("Bind index {index} is out of range for a statement with {count} parameters")]
   BindIndexOutOfRange { index: usize, count: usize },

   /// Journal mode name not recognized by [`crate::JournalMode`]
   #[error("Unknown journal mode '{0}'")]
   UnknownJournalMode(String),

   /// Synchronous mode name not recognized by [`crate::SyncMode`]
   #[error("Unknown synchronous mode '{0}'")]
   UnknownSyncMode(String),
}
