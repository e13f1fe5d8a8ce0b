use sqlite_wal_pool::{Cursor, JournalMode, SyncMode};

use crate::Result;
use crate::executor::Executor;

/// Handle given to [`crate::DriverCallbacks::on_configure`] for setting up
/// connections before the schema is created or migrated.
///
/// Foreign key and synchronous changes reach every connection of the pool,
/// including readers opened later. A journal mode change goes through the
/// pool's transition, so readers are rebuilt for the new mode.
pub struct ConfigurableDriver<'a> {
   executor: &'a Executor,
}

impl<'a> ConfigurableDriver<'a> {
   pub(crate) fn new(executor: &'a Executor) -> Self {
      Self { executor }
   }

   pub async fn set_foreign_key_constraints_enabled(&self, enabled: bool) -> Result<()> {
      self.executor.transactions().ensure_idle("foreign key change")?;
      Ok(self.executor.pool().set_foreign_keys(enabled).await?)
   }

   pub async fn set_journal_mode(&self, mode: JournalMode) -> Result<()> {
      self.execute_pragma(&format!("journal_mode = {mode}")).await
   }

   pub async fn set_sync(&self, mode: SyncMode) -> Result<()> {
      self.executor.transactions().ensure_idle("synchronous change")?;
      Ok(self.executor.pool().set_sync(mode).await?)
   }

   /// Runs `PRAGMA {pragma};` on the writer.
   pub async fn execute_pragma(&self, pragma: &str) -> Result<()> {
      self
         .executor
         .execute(None, &format!("PRAGMA {pragma};"), 0, None)
         .await?;
      Ok(())
   }

   /// Runs `PRAGMA {pragma};` as a query and maps its rows.
   pub async fn execute_pragma_query<R, M>(&self, pragma: &str, mapper: M) -> Result<R>
   where
      M: FnOnce(&mut Cursor<'_>) -> Result<R>,
   {
      self
         .executor
         .execute_query(None, &format!("PRAGMA {pragma};"), 0, None, mapper)
         .await
   }
}
