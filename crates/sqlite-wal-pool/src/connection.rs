//! Physical SQLite connections and the factory that opens them
//!
//! Connections are opened through sqlx so that open flags, busy timeouts and
//! the bundled SQLite library all come from one place. Statement work then goes
//! straight to the raw handle: prepared statements have to be cached and handed
//! between calls, which the sqlx query API does not expose.

use std::ffi::c_int;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use libsqlite3_sys::{SQLITE_OK, sqlite3, sqlite3_changes, sqlite3_prepare_v2, sqlite3_stmt};
use sqlx::Connection as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::ConnectOptions;
use tracing::{debug, trace};

use crate::Result;
use crate::config::{JournalMode, SyncMode};
use crate::error::Error;
use crate::statement::{Statement, last_error};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
   #[cfg(test)]
   pub(crate) fn for_tests(n: u64) -> Self {
      ConnectionId(n)
   }
}

impl fmt::Display for ConnectionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "conn-{}", self.0)
   }
}

/// One open database session.
///
/// The pool hands a connection to one task at a time; a `Connection` is never
/// used by two tasks at once except through the passthrough pool, whose
/// underlying driver serializes access itself.
pub struct Connection {
   id: ConnectionId,
   inner: SqliteConnection,
   /// Raw handle cached at open time so statement work stays synchronous.
   raw: NonNull<sqlite3>,
}

// SAFETY: connections are opened in serialized (FULLMUTEX) mode, so SQLite guards
// the handle internally. The pool additionally hands each connection to a single
// task at a time, and `inner` is only touched again by `close`, which consumes self.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl fmt::Debug for Connection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Connection").field("id", &self.id).finish()
   }
}

impl Connection {
   /// Opens `name`, creating the file if needed.
   ///
   /// `":memory:"` opens a private in-memory database and `""` a private
   /// temporary one.
   pub async fn open(name: &str) -> Result<Self> {
      let options = SqliteConnectOptions::new()
         .filename(name)
         .create_if_missing(true)
         .serialized(true)
         .foreign_keys(false)
         .statement_cache_capacity(0);

      let inner = options.connect().await?;
      Self::from_sqlx(inner).await
   }

   /// Wraps a connection opened by the caller.
   pub async fn from_sqlx(mut inner: SqliteConnection) -> Result<Self> {
      let raw = {
         let mut handle = inner.lock_handle().await?;
         handle.as_raw_handle()
      };

      let conn = Self {
         id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
         inner,
         raw,
      };
      debug!(connection = %conn.id, "Connection opened");
      Ok(conn)
   }

   pub fn id(&self) -> ConnectionId {
      self.id
   }

   /// Prepares the next statement in `sql`, returning it with the number of
   /// bytes consumed. `None` means only whitespace or comments remained.
   fn prepare_next(&self, sql: &[u8]) -> Result<(Option<Statement>, usize)> {
      let mut stmt: *mut sqlite3_stmt = ptr::null_mut();
      let mut tail = ptr::null();

      // SAFETY: raw is open for the lifetime of self; sql is passed with an explicit
      // length so no NUL terminator is required, and tail points into that buffer.
      let rc = unsafe {
         sqlite3_prepare_v2(
            self.raw.as_ptr(),
            sql.as_ptr().cast(),
            sql.len() as c_int,
            &mut stmt,
            &mut tail,
         )
      };
      if rc != SQLITE_OK {
         return Err(unsafe { last_error(self.raw.as_ptr()) });
      }

      let consumed = if tail.is_null() {
         sql.len()
      } else {
         (tail as usize).saturating_sub(sql.as_ptr() as usize)
      };

      // SAFETY: stmt came from a successful sqlite3_prepare_v2 and nothing else owns it.
      let statement = NonNull::new(stmt).map(|raw| unsafe { Statement::from_raw(raw) });
      Ok((statement, consumed))
   }

   /// Prepares the first statement in `sql`.
   pub fn prepare(&self, sql: &str) -> Result<Statement> {
      match self.prepare_next(sql.as_bytes())? {
         (Some(statement), _) => {
            trace!(connection = %self.id, statement = %statement.id(), "Statement prepared");
            Ok(statement)
         }
         (None, _) => Err(Error::EmptyStatement(sql.to_string())),
      }
   }

   /// Runs every statement in `sql` to completion, discarding result rows.
   pub fn execute_batch(&self, sql: &str) -> Result<()> {
      let mut remaining = sql.as_bytes();
      while !remaining.is_empty() {
         let (statement, consumed) = self.prepare_next(remaining)?;
         if let Some(mut statement) = statement {
            statement.run()?;
         }
         if consumed == 0 {
            break;
         }
         remaining = &remaining[consumed.min(remaining.len())..];
      }
      Ok(())
   }

   /// First column of the first row, as text.
   pub fn query_text(&self, sql: &str) -> Result<Option<String>> {
      let mut statement = self.prepare(sql)?;
      if statement.step()? {
         Ok(statement.get_text(0))
      } else {
         Ok(None)
      }
   }

   /// First column of the first row, as an integer.
   pub fn query_i64(&self, sql: &str) -> Result<Option<i64>> {
      let mut statement = self.prepare(sql)?;
      if statement.step()? {
         Ok(statement.get_i64(0))
      } else {
         Ok(None)
      }
   }

   /// Rows changed by the most recent INSERT, UPDATE or DELETE.
   pub fn changes(&self) -> u64 {
      // SAFETY: raw is open for the lifetime of self.
      unsafe { sqlite3_changes(self.raw.as_ptr()) }.max(0) as u64
   }

   /// Applies connection settings in the order SQLite needs them.
   ///
   /// Foreign keys come last: changing the journal mode can reset them.
   pub fn configure(
      &self,
      journal_mode: JournalMode,
      sync_mode: SyncMode,
      foreign_keys: bool,
   ) -> Result<()> {
      let reported = self.query_text(&format!("PRAGMA journal_mode = {journal_mode}"))?;
      self.execute_batch(&format!("PRAGMA synchronous = {sync_mode}"))?;
      self.execute_batch(&format!(
         "PRAGMA foreign_keys = {}",
         if foreign_keys { "ON" } else { "OFF" }
      ))?;
      debug!(
         connection = %self.id,
         requested = %journal_mode,
         journal_mode = reported.as_deref().unwrap_or(""),
         synchronous = %sync_mode,
         foreign_keys,
         "Connection configured"
      );
      Ok(())
   }

   /// Closes the session. Every statement prepared on it must already be closed.
   pub async fn close(self) -> Result<()> {
      let id = self.id;
      self.inner.close().await?;
      debug!(connection = %id, "Connection closed");
      Ok(())
   }
}

/// Opens physical connections for a pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
   async fn open(&self, name: &str) -> Result<Connection>;

   /// Whether the underlying driver already pools and serializes access itself.
   ///
   /// Such drivers get the passthrough pool instead of the reader/writer pool.
   fn manages_concurrency(&self) -> bool {
      false
   }
}

/// Default factory, opening connections through sqlx.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxConnectionFactory;

#[async_trait]
impl ConnectionFactory for SqlxConnectionFactory {
   async fn open(&self, name: &str) -> Result<Connection> {
      Connection::open(name).await
   }
}
