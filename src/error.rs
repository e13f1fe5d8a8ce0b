use std::fmt;

use serde::{Serialize, Serializer};

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error report, as serialized for callers outside Rust.
#[derive(Serialize)]
struct ErrorResponse {
   code: String,
   message: String,
}

/// One row of `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyViolation {
   pub referencing_table: String,
   pub referencing_row_id: i64,
   pub referenced_table: String,
   pub constraint_index: i64,
}

impl fmt::Display for ForeignKeyViolation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "ForeignKeyConstraintViolation:\n  Constraint index: {}\n  Referencing table: {}\n  Referencing rowId: {}\n  Referenced table: {}",
         self.constraint_index, self.referencing_table, self.referencing_row_id, self.referenced_table
      )
   }
}

/// Error types for the SQLite driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the connection pool or a raw statement.
   #[error(transparent)]
   Pool(#[from] sqlite_wal_pool::Error),

   /// Foreign keys were violated after the schema was created or migrated.
   ///
   /// `violations` holds at most the configured number of rows; `unreported`
   /// counts the rows past that cap.
   #[error("{message}")]
   ForeignKeyConstraintCheck {
      violations: Vec<ForeignKeyViolation>,
      unreported: usize,
      message: String,
   },

   /// Operation not allowed while the calling task has a transaction open.
   #[error("{0} cannot run while a transaction is active")]
   TransactionActive(&'static str),

   /// Explicit transaction calls made outside a task scope.
   #[error("no task context; wrap the caller in task_scope()")]
   NoTaskContext,

   /// A transaction was used from a task that does not own it.
   #[error("transaction {0} is owned by another task")]
   TransactionConfinement(String),

   /// A new outermost transaction was requested while one is open.
   #[error("transaction already active for this task")]
   TransactionAlreadyActive,

   /// Transaction has already been committed or rolled back.
   #[error("transaction has already been finalized (committed or rolled back)")]
   TransactionAlreadyFinalized,

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// An error with a secondary failure that happened while cleaning up after it.
   #[error("{error} (suppressed: {suppressed})")]
   WithSuppressed {
      error: Box<Error>,
      suppressed: Box<Error>,
   },

   /// Generic error, mostly raised by caller supplied schema code.
   #[error("{0}")]
   Other(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Pool(e) => match e {
            sqlite_wal_pool::Error::Sqlite { code, .. } => format!("SQLITE_{}", code),
            sqlite_wal_pool::Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
            sqlite_wal_pool::Error::InvalidConfig(_) => "INVALID_CONFIG".to_string(),
            _ => "CONNECTION_ERROR".to_string(),
         },
         Error::ForeignKeyConstraintCheck { .. } => "FOREIGN_KEY_CONSTRAINT_CHECK".to_string(),
         Error::TransactionActive(_) => "TRANSACTION_ACTIVE".to_string(),
         Error::NoTaskContext => "NO_TASK_CONTEXT".to_string(),
         Error::TransactionConfinement(_) => "TRANSACTION_CONFINEMENT".to_string(),
         Error::TransactionAlreadyActive => "TRANSACTION_ALREADY_ACTIVE".to_string(),
         Error::TransactionAlreadyFinalized => "TRANSACTION_ALREADY_FINALIZED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::WithSuppressed { error, .. } => error.error_code(),
         Error::Other(_) => "ERROR".to_string(),
      }
   }

   /// Attaches `suppressed` to this error without replacing it.
   pub fn with_suppressed(self, suppressed: Error) -> Error {
      Error::WithSuppressed {
         error: Box::new(self),
         suppressed: Box::new(suppressed),
      }
   }

   /// Builds the foreign key check error, rendering the first five violations.
   pub(crate) fn foreign_key_check(violations: Vec<ForeignKeyViolation>, unreported: usize) -> Error {
      const SHOWN: usize = 5;

      let not_shown = violations.len().saturating_sub(SHOWN);
      let disclaimer = if not_shown > 0 {
         format!(" ({not_shown} not shown)")
      } else {
         String::new()
      };
      let shown = violations
         .iter()
         .take(SHOWN)
         .map(ToString::to_string)
         .collect::<Vec<_>>()
         .join("\n\n");

      Error::ForeignKeyConstraintCheck {
         message: format!("The following foreign key constraints are violated{disclaimer}:\n\n{shown}"),
         violations,
         unreported,
      }
   }
}

impl Serialize for Error {
   fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
   where
      S: Serializer,
   {
      let response = ErrorResponse {
         code: self.error_code(),
         message: self.to_string(),
      };
      response.serialize(serializer)
   }
}
