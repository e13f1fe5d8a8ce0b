//! Pool for drivers that already manage their own concurrency

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::Result;
use crate::config::{DatabaseType, JournalMode, SqliteConfig, SyncMode};
use crate::connection::{Connection, ConnectionFactory};
use crate::error::Error;
use crate::pool::{
   CloseListener, Completion, ConnectionPool, JournalModeChange, PoolSettings, SettingsCell,
   foreign_keys_pragma,
};
use crate::write_guard::{ReaderGuard, WriterGuard};

/// Hands out one shared connection for every request.
///
/// Used when the [`ConnectionFactory`] reports that its driver pools and
/// serializes access internally. Acquire and release are no-ops around the
/// delegated connection; no exclusivity is enforced here.
pub struct PassthroughConnectionPool {
   close_listener: RwLock<Option<CloseListener>>,
   factory: Arc<dyn ConnectionFactory>,
   name: String,
   connection: AsyncMutex<Option<Arc<Connection>>>,
   settings: Arc<SettingsCell>,
   closed: AtomicBool,
}

impl PassthroughConnectionPool {
   pub fn open(
      database: &DatabaseType,
      config: &SqliteConfig,
      factory: Arc<dyn ConnectionFactory>,
   ) -> Result<Self> {
      config.validate()?;
      debug!(database = %database.name(), "Passthrough connection pool created");
      Ok(Self {
         close_listener: RwLock::new(None),
         factory,
         name: database.name(),
         connection: AsyncMutex::new(None),
         settings: Arc::new(SettingsCell::new(PoolSettings::new(database, config))),
         closed: AtomicBool::new(false),
      })
   }

   async fn connection(&self) -> Result<Arc<Connection>> {
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }

      let mut slot = self.connection.lock().await;
      if let Some(conn) = slot.as_ref() {
         return Ok(Arc::clone(conn));
      }

      let conn = self.factory.open(&self.name).await?;
      let settings = self.settings.get();
      conn.configure(settings.journal_mode, settings.sync_mode, settings.foreign_keys)?;

      let conn = Arc::new(conn);
      *slot = Some(Arc::clone(&conn));
      Ok(conn)
   }
}

#[async_trait]
impl ConnectionPool for PassthroughConnectionPool {
   async fn acquire_writer(&self) -> Result<WriterGuard> {
      Ok(WriterGuard::shared(self.connection().await?))
   }

   async fn acquire_reader(&self) -> Result<ReaderGuard> {
      Ok(ReaderGuard::writer(WriterGuard::shared(
         self.connection().await?,
      )))
   }

   async fn begin_journal_mode_change(&self) -> Result<JournalModeChange> {
      let writer = WriterGuard::shared(self.connection().await?);
      let settings = Arc::clone(&self.settings);
      let completion = Completion::new(move |reported| {
         if let Some(mode) = reported.and_then(|r| r.parse::<JournalMode>().ok()) {
            settings.update(|s| s.journal_mode = mode);
         }
      });
      Ok(JournalModeChange::new(completion, writer, None))
   }

   async fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
      let conn = self.connection().await?;
      conn.execute_batch(&foreign_keys_pragma(enabled))?;
      self.settings.update(|s| s.foreign_keys = enabled);
      Ok(())
   }

   async fn set_sync(&self, mode: SyncMode) -> Result<()> {
      let conn = self.connection().await?;
      conn.execute_batch(&format!("PRAGMA synchronous = {mode}"))?;
      self.settings.update(|s| s.sync_mode = mode);
      Ok(())
   }

   fn settings(&self) -> PoolSettings {
      *self.settings.get()
   }

   fn set_close_listener(&self, listener: CloseListener) {
      *self.close_listener.write() = Some(listener);
   }

   async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }

      let Some(conn) = self.connection.lock().await.take() else {
         return Ok(());
      };

      let listener = self.close_listener.read().clone();
      if let Some(listener) = listener {
         listener(conn.id());
      }

      match Arc::try_unwrap(conn) {
         Ok(conn) => {
            let id = conn.id();
            if let Err(e) = conn.close().await {
               warn!(connection = %id, error = %e, "Failed to close connection");
            }
         }
         Err(conn) => {
            warn!(
               connection = %conn.id(),
               "Connection still in use at close; it closes when the last guard drops"
            );
         }
      }
      Ok(())
   }
}
