//! Reader/writer connection pool with a WAL-aware reader queue

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::concurrency::ConcurrencyModel;
use crate::config::{DatabaseType, JournalMode, SqliteConfig, SyncMode};
use crate::connection::{Connection, ConnectionFactory, ConnectionId, SqlxConnectionFactory};
use crate::error::Error;
use crate::write_guard::{ReaderGuard, WriterGuard};

/// Called with a connection's id just before the pool closes it.
pub type CloseListener = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Settings every connection of a pool is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
   pub journal_mode: JournalMode,
   pub sync_mode: SyncMode,
   pub foreign_keys: bool,
   pub model: ConcurrencyModel,
}

impl PoolSettings {
   /// Derives the starting settings for a pool over `database`.
   ///
   /// Non-file databases are private to one connection, so they always get
   /// [`ConcurrencyModel::SingleReaderWriter`]. Otherwise the model's WAL flag
   /// starts out matching the configured journal mode.
   pub fn new(database: &DatabaseType, config: &SqliteConfig) -> Self {
      let model = if database.is_file_based() {
         config
            .concurrency_model
            .with_wal(config.journal_mode == JournalMode::Wal)
      } else {
         ConcurrencyModel::SingleReaderWriter
      };

      Self {
         journal_mode: config.journal_mode,
         sync_mode: config.sync_mode(),
         foreign_keys: config.foreign_key_constraints_enabled,
         model,
      }
   }
}

/// Immutable settings snapshot, swapped whole on every change.
pub(crate) struct SettingsCell(RwLock<Arc<PoolSettings>>);

impl SettingsCell {
   pub(crate) fn new(settings: PoolSettings) -> Self {
      Self(RwLock::new(Arc::new(settings)))
   }

   pub(crate) fn get(&self) -> Arc<PoolSettings> {
      Arc::clone(&self.0.read())
   }

   pub(crate) fn update(&self, update: impl FnOnce(&mut PoolSettings)) {
      let mut current = self.0.write();
      let mut next = **current;
      update(&mut next);
      *current = Arc::new(next);
   }
}

pub(crate) fn foreign_keys_pragma(enabled: bool) -> String {
   format!("PRAGMA foreign_keys = {}", if enabled { "ON" } else { "OFF" })
}

/// Strategy for handing out connections.
///
/// [`WalConnectionPool`] keeps one writer and a lazily filled reader queue;
/// [`crate::PassthroughConnectionPool`] forwards everything to a single
/// connection of a driver that pools internally.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
   /// Waits for the writer, opening it on first use.
   async fn acquire_writer(&self) -> Result<WriterGuard>;

   /// Waits for a reader, falling back to the writer when the model has no
   /// readers or none becomes free within the configured wait.
   async fn acquire_reader(&self) -> Result<ReaderGuard>;

   /// Starts a journal mode transition: readers are drained and closed, and
   /// the writer is held until the returned change completes or drops.
   async fn begin_journal_mode_change(&self) -> Result<JournalModeChange>;

   /// Sets `PRAGMA foreign_keys` on the writer and every opened reader.
   async fn set_foreign_keys(&self, enabled: bool) -> Result<()>;

   /// Sets `PRAGMA synchronous` on the writer and every opened reader.
   async fn set_sync(&self, mode: SyncMode) -> Result<()>;

   /// Current settings snapshot.
   fn settings(&self) -> PoolSettings;

   fn concurrency_model(&self) -> ConcurrencyModel {
      self.settings().model
   }

   /// Registers the listener told about connections before they close.
   fn set_close_listener(&self, listener: CloseListener);

   /// Closes every connection. Callers must make sure nothing is still using one.
   async fn close(&self) -> Result<()>;
}

impl dyn ConnectionPool {
   /// Runs a journal mode pragma through the transition protocol.
   ///
   /// `execute_on_writer` runs on the writer while no reader exists and returns
   /// its own value plus the journal mode text SQLite reported. Readers are
   /// rebuilt afterwards, sized by the model that text implies. If the closure
   /// fails, readers are rebuilt under the previous model and the error returned.
   pub async fn set_journal_mode<T, E, F>(&self, execute_on_writer: F) -> std::result::Result<T, E>
   where
      F: FnOnce(&Connection) -> std::result::Result<(T, String), E>,
      E: From<Error>,
   {
      let change = self.begin_journal_mode_change().await?;
      let (value, reported) = execute_on_writer(change.connection())?;
      change.complete(&reported);
      Ok(value)
   }
}

type CompletionFn = Box<dyn FnOnce(Option<&str>) + Send + Sync>;

/// Runs once with the reported journal mode, or with `None` when dropped first.
pub(crate) struct Completion(Option<CompletionFn>);

impl Completion {
   pub(crate) fn new(f: impl FnOnce(Option<&str>) + Send + Sync + 'static) -> Self {
      Self(Some(Box::new(f)))
   }

   fn run(&mut self, reported: Option<&str>) {
      if let Some(f) = self.0.take() {
         f(reported);
      }
   }
}

impl Drop for Completion {
   fn drop(&mut self) {
      self.run(None);
   }
}

/// An in-progress journal mode transition.
///
/// Holds the writer and the journal mode lock. Fields drop in order: readers
/// are rebuilt, then the writer is released, then the journal mode lock.
pub struct JournalModeChange {
   completion: Completion,
   writer: WriterGuard,
   _journal: Option<OwnedMutexGuard<()>>,
}

impl JournalModeChange {
   pub(crate) fn new(
      completion: Completion,
      writer: WriterGuard,
      journal: Option<OwnedMutexGuard<()>>,
   ) -> Self {
      Self {
         completion,
         writer,
         _journal: journal,
      }
   }

   /// The writer, to run the journal mode pragma on.
   pub fn connection(&self) -> &Connection {
      &self.writer
   }

   /// Finishes the transition with the journal mode SQLite reported.
   pub fn complete(mut self, reported: &str) {
      debug!(journal_mode = %reported, "Journal mode change completed");
      self.completion.run(Some(reported));
   }
}

enum ReaderSlot {
   Unopened,
   Open(Connection),
}

struct ReaderQueue {
   /// One permit per slot; replaced, never resized, when the model changes.
   permits: Arc<Semaphore>,
   capacity: usize,
   slots: VecDeque<ReaderSlot>,
}

impl ReaderQueue {
   fn with_capacity(capacity: usize) -> Self {
      Self {
         permits: Arc::new(Semaphore::new(capacity)),
         capacity,
         slots: (0..capacity).map(|_| ReaderSlot::Unopened).collect(),
      }
   }
}

struct PoolShared {
   // Declared first so a listener owning the statement cache drops before
   // any connection does.
   close_listener: RwLock<Option<CloseListener>>,
   factory: Arc<dyn ConnectionFactory>,
   name: String,
   writer: Arc<AsyncMutex<Option<Connection>>>,
   journal_lock: Arc<AsyncMutex<()>>,
   readers: Mutex<ReaderQueue>,
   settings: SettingsCell,
   reader_wait: Duration,
   closed: AtomicBool,
}

impl PoolShared {
   fn ensure_open(&self) -> Result<()> {
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }
      Ok(())
   }

   fn notify_close(&self, id: ConnectionId) {
      let listener = self.close_listener.read().clone();
      if let Some(listener) = listener {
         listener(id);
      }
   }

   /// Closes connections that are being discarded. Failures are logged, not returned.
   async fn discard(&self, connections: Vec<Connection>) {
      // Listeners run before any await so cached statements never outlive
      // their connection, even if this future is dropped part way.
      for conn in &connections {
         self.notify_close(conn.id());
      }
      for conn in connections {
         let id = conn.id();
         if let Err(e) = conn.close().await {
            warn!(connection = %id, error = %e, "Failed to close discarded connection");
         }
      }
   }

   async fn open_connection(&self) -> Result<Connection> {
      let conn = self.factory.open(&self.name).await?;
      let settings = self.settings.get();
      if let Err(e) = conn.configure(settings.journal_mode, settings.sync_mode, settings.foreign_keys) {
         self.discard(vec![conn]).await;
         return Err(e);
      }
      Ok(conn)
   }

   async fn acquire_writer(&self) -> Result<WriterGuard> {
      self.ensure_open()?;
      let mut slot = Arc::clone(&self.writer).lock_owned().await;
      self.ensure_open()?;

      if slot.is_none() {
         *slot = Some(self.open_connection().await?);
      }

      let guard = OwnedMutexGuard::try_map(slot, Option::as_mut).map_err(|_| Error::DatabaseClosed)?;
      Ok(WriterGuard::exclusive(guard))
   }

   fn return_reader(&self, conn: Connection) {
      let mut queue = self.readers.lock();
      if self.closed.load(Ordering::SeqCst) {
         drop(queue);
         self.notify_close(conn.id());
         debug!(connection = %conn.id(), "Reader returned after close, dropping it");
         return;
      }
      queue.slots.push_back(ReaderSlot::Open(conn));
   }

   /// Waits for every outstanding reader, then empties the queue and closes
   /// the opened readers. The queue is left with no permits.
   async fn drain_readers(&self) {
      let (permits, capacity) = {
         let queue = self.readers.lock();
         (Arc::clone(&queue.permits), queue.capacity)
      };

      let held = permits.acquire_many_owned(capacity as u32).await.ok();

      let slots = {
         let mut queue = self.readers.lock();
         queue.permits.close();
         queue.permits = Arc::new(Semaphore::new(0));
         queue.capacity = 0;
         std::mem::take(&mut queue.slots)
      };
      drop(held);

      let opened: Vec<Connection> = slots
         .into_iter()
         .filter_map(|slot| match slot {
            ReaderSlot::Open(conn) => Some(conn),
            ReaderSlot::Unopened => None,
         })
         .collect();
      debug!(count = opened.len(), "Closing readers");
      self.discard(opened).await;
   }

   fn finish_journal_mode_change(&self, reported: Option<&str>) {
      if let Some(reported) = reported {
         self.settings.update(|settings| {
            settings.model = settings.model.with_wal(reported.eq_ignore_ascii_case("wal"));
            if let Ok(mode) = reported.parse() {
               settings.journal_mode = mode;
            }
         });
      }

      let capacity = if self.closed.load(Ordering::SeqCst) {
         0
      } else {
         self.settings.get().model.reader_count()
      };

      let mut queue = self.readers.lock();
      queue.permits.close();
      *queue = ReaderQueue::with_capacity(capacity);
      debug!(readers = capacity, "Reader queue rebuilt");
   }

   /// Runs `sql` on the writer and every opened reader, then records the
   /// change so readers opened later pick it up.
   async fn broadcast(&self, sql: &str, update: impl FnOnce(&mut PoolSettings)) -> Result<()> {
      self.ensure_open()?;
      let _journal = self.journal_lock.lock().await;

      {
         let writer = self.acquire_writer().await?;
         writer.execute_batch(sql)?;
      }
      self.settings.update(update);

      let (permits, capacity) = {
         let queue = self.readers.lock();
         (Arc::clone(&queue.permits), queue.capacity)
      };
      let _held = permits.acquire_many_owned(capacity as u32).await.ok();

      let queue = self.readers.lock();
      for slot in &queue.slots {
         if let ReaderSlot::Open(conn) = slot {
            conn.execute_batch(sql)?;
         }
      }
      debug!(sql, "Pragma broadcast to all connections");
      Ok(())
   }
}

/// Connection pool with one writer and a lazily populated reader queue.
///
/// Reader connections are opened on first use, up to the concurrency model's
/// reader count. A journal mode change tears every reader down before the
/// writer's mode changes and rebuilds the queue after, sized for the new mode.
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
///
/// let reader = pool.acquire_reader().await?;
/// let count = reader.query_i64("SELECT COUNT(*) FROM sqlite_master")?;
/// drop(reader);
///
/// pool.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WalConnectionPool {
   shared: Arc<PoolShared>,
}

impl WalConnectionPool {
   /// Creates a pool over `database`. No connection is opened until first use.
   ///
   /// `factory` defaults to [`SqlxConnectionFactory`].
   pub fn open(
      database: &DatabaseType,
      config: &SqliteConfig,
      factory: Option<Arc<dyn ConnectionFactory>>,
   ) -> Result<Self> {
      config.validate()?;
      let settings = PoolSettings::new(database, config);
      let factory = factory.unwrap_or_else(|| Arc::new(SqlxConnectionFactory));

      debug!(
         database = %database.name(),
         readers = settings.model.reader_count(),
         journal_mode = %settings.journal_mode,
         "Connection pool created"
      );

      Ok(Self {
         shared: Arc::new(PoolShared {
            close_listener: RwLock::new(None),
            factory,
            name: database.name(),
            writer: Arc::new(AsyncMutex::new(None)),
            journal_lock: Arc::new(AsyncMutex::new(())),
            readers: Mutex::new(ReaderQueue::with_capacity(settings.model.reader_count())),
            settings: SettingsCell::new(settings),
            reader_wait: config.reader_fallback_timeout(),
            closed: AtomicBool::new(false),
         }),
      })
   }
}

#[async_trait]
impl ConnectionPool for WalConnectionPool {
   async fn acquire_writer(&self) -> Result<WriterGuard> {
      self.shared.acquire_writer().await
   }

   async fn acquire_reader(&self) -> Result<ReaderGuard> {
      let shared = &self.shared;

      loop {
         shared.ensure_open()?;

         if shared.settings.get().model.reader_count() == 0 {
            return Ok(ReaderGuard::writer(shared.acquire_writer().await?));
         }

         let permits = Arc::clone(&shared.readers.lock().permits);
         let permit = match tokio::time::timeout(shared.reader_wait, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            // The queue was replaced by a journal mode change; look again.
            Ok(Err(_)) => continue,
            Err(_) => {
               trace!("No reader became free in time, falling back to the writer");
               return Ok(ReaderGuard::writer(shared.acquire_writer().await?));
            }
         };

         let slot = shared.readers.lock().slots.pop_front();
         let conn = match slot {
            Some(ReaderSlot::Open(conn)) => conn,
            Some(ReaderSlot::Unopened) => {
               let restore = RestoreUnopened {
                  shared,
                  armed: true,
               };
               let conn = shared.open_connection().await?;
               restore.disarm();
               conn
            }
            None => continue,
         };

         let home = Arc::clone(shared);
         return Ok(ReaderGuard::pooled(
            conn,
            permit,
            Box::new(move |conn| home.return_reader(conn)),
         ));
      }
   }

   async fn begin_journal_mode_change(&self) -> Result<JournalModeChange> {
      let shared = &self.shared;
      shared.ensure_open()?;

      let journal = Arc::clone(&shared.journal_lock).lock_owned().await;
      debug!("Journal mode change started");

      let finisher = Arc::clone(shared);
      let completion = Completion::new(move |reported| {
         finisher.finish_journal_mode_change(reported);
      });

      shared.drain_readers().await;
      let writer = shared.acquire_writer().await?;

      Ok(JournalModeChange::new(completion, writer, Some(journal)))
   }

   async fn set_foreign_keys(&self, enabled: bool) -> Result<()> {
      self
         .shared
         .broadcast(&foreign_keys_pragma(enabled), |settings| {
            settings.foreign_keys = enabled;
         })
         .await
   }

   async fn set_sync(&self, mode: SyncMode) -> Result<()> {
      self
         .shared
         .broadcast(&format!("PRAGMA synchronous = {mode}"), |settings| {
            settings.sync_mode = mode;
         })
         .await
   }

   fn settings(&self) -> PoolSettings {
      *self.shared.settings.get()
   }

   fn set_close_listener(&self, listener: CloseListener) {
      *self.shared.close_listener.write() = Some(listener);
   }

   async fn close(&self) -> Result<()> {
      let shared = &self.shared;
      if shared.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }

      let slots = {
         let mut queue = shared.readers.lock();
         queue.permits.close();
         queue.capacity = 0;
         std::mem::take(&mut queue.slots)
      };
      let readers: Vec<Connection> = slots
         .into_iter()
         .filter_map(|slot| match slot {
            ReaderSlot::Open(conn) => Some(conn),
            ReaderSlot::Unopened => None,
         })
         .collect();
      shared.discard(readers).await;

      let writer = shared.writer.lock().await.take();
      if let Some(conn) = writer {
         // Flush the WAL into the database file before the last connection goes
         if shared.settings.get().journal_mode == JournalMode::Wal
            && let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
         {
            debug!(error = %e, "WAL checkpoint on close failed");
         }
         shared.discard(vec![conn]).await;
      }

      debug!(database = %shared.name, "Connection pool closed");
      Ok(())
   }
}

/// Puts an unopened slot back if opening its reader fails or is cancelled.
struct RestoreUnopened<'a> {
   shared: &'a PoolShared,
   armed: bool,
}

impl RestoreUnopened<'_> {
   fn disarm(mut self) {
      self.armed = false;
   }
}

impl Drop for RestoreUnopened<'_> {
   fn drop(&mut self) {
      if self.armed {
         self.shared.readers.lock().slots.push_front(ReaderSlot::Unopened);
      }
   }
}
