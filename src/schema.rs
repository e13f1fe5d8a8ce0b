//! Schema definitions and the one-time initialization run before first use

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use sqlite_wal_pool::{Connection, SqliteConfig};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::configurable::ConfigurableDriver;
use crate::error::ForeignKeyViolation;
use crate::executor::Executor;
use crate::{Error, Result};

/// A database schema with a version persisted in `PRAGMA user_version`.
#[async_trait]
pub trait Schema: Send + Sync {
   /// Version the database is brought up to.
   fn version(&self) -> i64;

   /// Creates the schema in an empty database.
   async fn create(&self, driver: &Executor) -> Result<()>;

   /// Migrates a database at `old_version` up to `new_version`.
   ///
   /// With [`AfterVersion`] callbacks registered, a migration is split into
   /// consecutive ranges ending where each callback runs, and this is called
   /// once per range.
   async fn migrate(&self, driver: &Executor, old_version: i64, new_version: i64) -> Result<()>;
}

/// Future returned by an [`AfterVersion`] callback.
pub type MigrationFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

type MigrationFn = dyn for<'a> Fn(&'a Executor) -> MigrationFuture<'a> + Send + Sync;

/// Code run in the middle of a migration, once the database has been
/// migrated past `version` (that is, up to `version + 1`).
///
/// Callbacks run inside the migration transaction. They only run when the
/// migration actually crosses their version.
///
/// ```
/// use sqlite_wal_driver::AfterVersion;
///
/// let backfill = AfterVersion::new(2, |driver| {
///    Box::pin(async move {
///       driver
///          .execute(None, "UPDATE notes SET title = '' WHERE title IS NULL", 0, None)
///          .await
///          .map(|_| ())
///    })
/// });
/// assert_eq!(backfill.version(), 2);
/// ```
#[derive(Clone)]
pub struct AfterVersion {
   version: i64,
   callback: Arc<MigrationFn>,
}

impl AfterVersion {
   pub fn new<F>(version: i64, callback: F) -> Self
   where
      F: for<'a> Fn(&'a Executor) -> MigrationFuture<'a> + Send + Sync + 'static,
   {
      Self {
         version,
         callback: Arc::new(callback),
      }
   }

   pub fn version(&self) -> i64 {
      self.version
   }
}

impl fmt::Debug for AfterVersion {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AfterVersion").field("version", &self.version).finish()
   }
}

/// Hooks run once, the first time a driver is used.
///
/// `on_configure` runs before anything else. After a create or a migration
/// `on_create` or `on_update` runs, then `on_open` runs whether or not the
/// schema changed. The handles passed in must not escape the hook.
#[async_trait]
pub trait DriverCallbacks: Send + Sync {
   async fn on_configure(&self, _driver: &ConfigurableDriver<'_>) -> Result<()> {
      Ok(())
   }

   async fn on_create(&self, _driver: &Executor) -> Result<()> {
      Ok(())
   }

   async fn on_update(&self, _driver: &Executor, _old_version: i64, _new_version: i64) -> Result<()> {
      Ok(())
   }

   async fn on_open(&self, _driver: &Executor) -> Result<()> {
      Ok(())
   }
}

/// Callbacks that do nothing.
pub struct NoCallbacks;

impl DriverCallbacks for NoCallbacks {}

/// Options of [`SqliteConfig`] that shape initialization.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SchemaOptions {
   check_foreign_keys: bool,
   max_violations: usize,
   migrate_empty_schema: bool,
}

impl From<&SqliteConfig> for SchemaOptions {
   fn from(config: &SqliteConfig) -> Self {
      Self {
         check_foreign_keys: config.foreign_key_constraints_checked_after_create_or_update,
         max_violations: config.max_foreign_key_violations_reported,
         migrate_empty_schema: config.migrate_empty_schema,
      }
   }
}

/// Double-checked flag guarding first-use initialization.
///
/// The flag only flips after initialization succeeds. A failed attempt
/// leaves it down, and the next caller tries again.
#[derive(Default)]
pub(crate) struct SchemaGate {
   ready: AtomicBool,
   lock: Mutex<()>,
}

impl SchemaGate {
   pub(crate) async fn ensure_ready<F, Fut>(&self, init: F) -> Result<()>
   where
      F: FnOnce() -> Fut,
      Fut: Future<Output = Result<()>>,
   {
      if self.ready.load(Ordering::Acquire) {
         return Ok(());
      }

      let _lock = self.lock.lock().await;
      if self.ready.load(Ordering::Acquire) {
         return Ok(());
      }

      init().await?;
      self.ready.store(true, Ordering::Release);
      Ok(())
   }

   #[cfg(test)]
   fn is_ready(&self) -> bool {
      self.ready.load(Ordering::Acquire)
   }
}

/// Configures connections, then creates or migrates the schema and runs
/// the driver callbacks.
pub(crate) async fn initialize(
   executor: &Executor,
   schema: &dyn Schema,
   callbacks: &dyn DriverCallbacks,
   migration_callbacks: &[AfterVersion],
   options: SchemaOptions,
) -> Result<()> {
   callbacks
      .on_configure(&ConfigurableDriver::new(executor))
      .await?;
   // on_configure may have changed it
   let foreign_keys = executor.pool().settings().foreign_keys;

   let current = {
      let writer = executor.pool().acquire_writer().await?;
      writer.query_i64("PRAGMA user_version")?.unwrap_or(0)
   };
   let target = schema.version();
   let is_create = current == 0 && !options.migrate_empty_schema;

   if is_create || current < target {
      if is_create {
         debug!(version = target, "Creating schema");
      } else {
         debug!(from = current, to = target, "Migrating schema");
      }

      with_foreign_keys_disabled(executor, foreign_keys, async {
         executor
            .transaction(|_| async move {
               if is_create {
                  schema.create(executor).await?;
               } else {
                  migrate(executor, schema, current, target, migration_callbacks).await?;
               }

               executor.with_transaction_connection(|conn| {
                  if options.check_foreign_keys {
                     check_foreign_keys(conn, options.max_violations)?;
                  }
                  conn.execute_batch(&format!("PRAGMA user_version = {target}"))?;
                  Ok(())
               })
            })
            .await
      })
      .await?;

      if is_create {
         callbacks.on_create(executor).await?;
      } else {
         callbacks.on_update(executor, current, target).await?;
      }
   }

   callbacks.on_open(executor).await?;
   debug!(version = target, "Schema ready");
   Ok(())
}

/// Migrates from `from` to `to`, stopping to run every callback whose
/// version the migration crosses, lowest version first.
async fn migrate(
   executor: &Executor,
   schema: &dyn Schema,
   from: i64,
   to: i64,
   callbacks: &[AfterVersion],
) -> Result<()> {
   let mut crossed: Vec<&AfterVersion> = callbacks
      .iter()
      .filter(|callback| (from..to).contains(&callback.version))
      .collect();
   crossed.sort_by_key(|callback| callback.version);

   let mut reached = from;
   for callback in crossed {
      let next = callback.version + 1;
      if reached < next {
         schema.migrate(executor, reached, next).await?;
         reached = next;
      }
      debug!(version = callback.version, "Running migration callback");
      (callback.callback)(executor).await?;
   }

   if reached < to {
      schema.migrate(executor, reached, to).await?;
   }
   Ok(())
}

/// Runs `body` with foreign key enforcement off on the writer, turning it
/// back on afterwards even when `body` fails.
async fn with_foreign_keys_disabled(
   executor: &Executor,
   enabled: bool,
   body: impl Future<Output = Result<()>>,
) -> Result<()> {
   if !enabled {
      return body.await;
   }

   set_writer_foreign_keys(executor, false).await?;
   let result = body.await;
   let restored = set_writer_foreign_keys(executor, true).await;

   match (result, restored) {
      (Ok(()), restored) => restored,
      (Err(e), Ok(())) => Err(e),
      (Err(e), Err(suppressed)) => {
         warn!(error = %suppressed, "Re-enabling foreign keys failed after a failed schema change");
         Err(e.with_suppressed(suppressed))
      }
   }
}

async fn set_writer_foreign_keys(executor: &Executor, enabled: bool) -> Result<()> {
   let writer = executor.pool().acquire_writer().await?;
   let value = if enabled { "ON" } else { "OFF" };
   writer.execute_batch(&format!("PRAGMA foreign_keys = {value};"))?;
   Ok(())
}

/// Scans `PRAGMA foreign_key_check`, keeping at most `max` violations.
fn check_foreign_keys(conn: &Connection, max: usize) -> Result<()> {
   let mut check = conn.prepare("PRAGMA foreign_key_check;")?;
   let mut violations = Vec::new();
   let mut unreported = 0;

   while check.step()? {
      if violations.len() < max {
         violations.push(ForeignKeyViolation {
            referencing_table: check.get_text(0).unwrap_or_default(),
            referencing_row_id: check.get_i64(1).unwrap_or_default(),
            referenced_table: check.get_text(2).unwrap_or_default(),
            constraint_index: check.get_i64(3).unwrap_or_default(),
         });
      } else {
         unreported += 1;
      }
   }
   check.close();

   if violations.is_empty() {
      return Ok(());
   }
   debug!(
      reported = violations.len(),
      unreported, "Foreign key check found violations"
   );
   Err(Error::foreign_key_check(violations, unreported))
}
