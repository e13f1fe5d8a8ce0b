//! RAII guards for connections handed out by a pool

use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{OwnedMappedMutexGuard, OwnedSemaphorePermit};

use crate::connection::Connection;

/// RAII guard for the pool's writer connection
///
/// Only one exclusive guard exists at a time. Dropping the guard releases the
/// writer, so release happens exactly once on every path, errors and
/// cancellation included.
///
/// # Example
///
/// ```no_run
/// use sqlite_wal_pool::{ConnectionPool, DatabaseType, SqliteConfig, WalConnectionPool};
///
/// # async fn example() -> Result<(), sqlite_wal_pool::Error> {
/// let pool = WalConnectionPool::open(
///    &DatabaseType::File("test.db".into()),
///    &SqliteConfig::default(),
///    None,
/// )?;
/// let writer = pool.acquire_writer().await?;
/// writer.execute_batch("INSERT INTO users (name) VALUES ('Alice')")?;
/// // Writer is released when dropped
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct WriterGuard {
   inner: WriterInner,
}

#[derive(Debug)]
enum WriterInner {
   Exclusive(OwnedMappedMutexGuard<Option<Connection>, Connection>),
   Shared(Arc<Connection>),
}

impl WriterGuard {
   pub(crate) fn exclusive(guard: OwnedMappedMutexGuard<Option<Connection>, Connection>) -> Self {
      Self {
         inner: WriterInner::Exclusive(guard),
      }
   }

   pub(crate) fn shared(conn: Arc<Connection>) -> Self {
      Self {
         inner: WriterInner::Shared(conn),
      }
   }

   /// Releases the writer. Same as dropping the guard.
   pub fn release(self) {}
}

impl Deref for WriterGuard {
   type Target = Connection;

   fn deref(&self) -> &Self::Target {
      match &self.inner {
         WriterInner::Exclusive(guard) => guard,
         WriterInner::Shared(conn) => conn,
      }
   }
}

const RELEASED: &str = "reader connection used after it was returned to the pool";

/// Returns a pooled reader to its pool.
pub(crate) type ReturnReader = Box<dyn FnOnce(Connection) + Send + Sync>;

/// RAII guard for a reader connection
///
/// When the pool has no readers (or none became free in time) the guard holds
/// the writer instead. Dropping the guard returns the connection to wherever
/// it came from.
pub struct ReaderGuard {
   inner: ReaderInner,
}

enum ReaderInner {
   Pooled {
      // Only `None` while dropping
      conn: Option<Connection>,
      home: Option<ReturnReader>,
      permit: Option<OwnedSemaphorePermit>,
   },
   Writer(WriterGuard),
}

impl ReaderGuard {
   pub(crate) fn pooled(conn: Connection, permit: OwnedSemaphorePermit, home: ReturnReader) -> Self {
      Self {
         inner: ReaderInner::Pooled {
            conn: Some(conn),
            home: Some(home),
            permit: Some(permit),
         },
      }
   }

   pub(crate) fn writer(writer: WriterGuard) -> Self {
      Self {
         inner: ReaderInner::Writer(writer),
      }
   }

   /// Whether this reader fell back to the writer connection.
   pub fn is_writer(&self) -> bool {
      matches!(self.inner, ReaderInner::Writer(_))
   }

   /// Returns the reader to its pool. Same as dropping the guard.
   pub fn release(self) {}
}

impl std::fmt::Debug for ReaderGuard {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ReaderGuard")
         .field("connection", &self.id())
         .field("is_writer", &self.is_writer())
         .finish()
   }
}

impl Deref for ReaderGuard {
   type Target = Connection;

   fn deref(&self) -> &Self::Target {
      match &self.inner {
         ReaderInner::Pooled { conn, .. } => conn.as_ref().expect(RELEASED),
         ReaderInner::Writer(writer) => writer,
      }
   }
}

impl Drop for ReaderGuard {
   fn drop(&mut self) {
      if let ReaderInner::Pooled { conn, home, permit } = &mut self.inner
         && let Some(conn) = conn.take()
      {
         match home.take() {
            Some(home) => home(conn),
            None => drop(conn),
         }
         // The permit goes back only after the connection is back in the queue.
         drop(permit.take());
      }
   }
}
