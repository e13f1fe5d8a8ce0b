//! The driver facade: first-use schema gate in front of the executor

use std::future::Future;
use std::sync::Arc;

use sqlite_query_observer::{QueryChangeStream, QueryListener, QueryObserver};
use sqlite_wal_pool::{
   ConnectionFactory, ConnectionPool, Cursor, DatabaseType, JournalMode, PassthroughConnectionPool,
   SqliteConfig, SqliteValue, StatementCache, SyncMode, WalConnectionPool,
};
use tracing::debug;

use crate::Result;
use crate::configurable::ConfigurableDriver;
use crate::executor::{Binder, Executor};
use crate::schema::{AfterVersion, DriverCallbacks, NoCallbacks, Schema, SchemaGate, SchemaOptions, initialize};
use crate::transactions::{TransactionCoordinator, TransactionHandle};

/// A SQLite driver with one writer, pooled WAL readers and task-pinned
/// transactions.
///
/// Nothing touches the database until the first statement or transaction.
/// That first call configures connections, creates or migrates the schema
/// and runs the [`DriverCallbacks`], while every concurrent caller waits.
///
/// # Example
///
/// ```no_run
/// use async_trait::async_trait;
/// use sqlite_wal_driver::{DatabaseType, Executor, Result, Schema, SqliteConfig, SqliteDriver};
///
/// struct Notes;
///
/// #[async_trait]
/// impl Schema for Notes {
///    fn version(&self) -> i64 {
///       1
///    }
///
///    async fn create(&self, driver: &Executor) -> Result<()> {
///       driver
///          .execute(None, "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", 0, None)
///          .await?;
///       Ok(())
///    }
///
///    async fn migrate(&self, _driver: &Executor, _old: i64, _new: i64) -> Result<()> {
///       Ok(())
///    }
/// }
///
/// # async fn example() -> Result<()> {
/// let driver = SqliteDriver::open(
///    DatabaseType::File("notes.db".into()),
///    Notes,
///    SqliteConfig::default(),
/// )?;
///
/// driver
///    .execute_values(Some(1), "INSERT INTO notes (body) VALUES (?)", &["hello".into()])
///    .await?;
/// driver.notify_listeners(["notes"]);
///
/// driver.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct SqliteDriver {
   executor: Executor,
   // Same pool and coordinator as `executor`, without statement caching
   init_executor: Executor,
   schema: Arc<dyn Schema>,
   callbacks: Arc<dyn DriverCallbacks>,
   migration_callbacks: Vec<AfterVersion>,
   gate: SchemaGate,
   options: SchemaOptions,
   observer: QueryObserver,
}

impl SqliteDriver {
   /// Creates a driver with no callbacks over the default connection pool.
   pub fn open(database: DatabaseType, schema: impl Schema + 'static, config: SqliteConfig) -> Result<Self> {
      Self::builder(database, schema).config(config).build()
   }

   pub fn builder(database: DatabaseType, schema: impl Schema + 'static) -> SqliteDriverBuilder {
      SqliteDriverBuilder::new(database, Arc::new(schema))
   }

   async fn ensure_schema_ready(&self) -> Result<()> {
      self
         .gate
         .ensure_ready(|| {
            initialize(
               &self.init_executor,
               self.schema.as_ref(),
               self.callbacks.as_ref(),
               &self.migration_callbacks,
               self.options,
            )
         })
         .await
   }

   /// The pool every statement of this driver runs on.
   pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
      self.executor.pool()
   }

   /// See [`Executor::execute`].
   pub async fn execute(
      &self,
      identifier: Option<i32>,
      sql: &str,
      parameters: usize,
      binder: Option<Binder<'_>>,
   ) -> Result<u64> {
      self.ensure_schema_ready().await?;
      self.executor.execute(identifier, sql, parameters, binder).await
   }

   /// See [`Executor::execute_query`].
   pub async fn execute_query<R, M>(
      &self,
      identifier: Option<i32>,
      sql: &str,
      parameters: usize,
      binder: Option<Binder<'_>>,
      mapper: M,
   ) -> Result<R>
   where
      M: FnOnce(&mut Cursor<'_>) -> Result<R>,
   {
      self.ensure_schema_ready().await?;
      self
         .executor
         .execute_query(identifier, sql, parameters, binder, mapper)
         .await
   }

   pub async fn execute_values(
      &self,
      identifier: Option<i32>,
      sql: &str,
      values: &[SqliteValue],
   ) -> Result<u64> {
      self.ensure_schema_ready().await?;
      self.executor.execute_values(identifier, sql, values).await
   }

   pub async fn query_values(
      &self,
      identifier: Option<i32>,
      sql: &str,
      values: &[SqliteValue],
   ) -> Result<Vec<Vec<SqliteValue>>> {
      self.ensure_schema_ready().await?;
      self.executor.query_values(identifier, sql, values).await
   }

   /// See [`Executor::new_transaction`].
   pub async fn new_transaction(&self) -> Result<TransactionHandle> {
      self.ensure_schema_ready().await?;
      self.executor.new_transaction().await
   }

   pub fn current_transaction(&self) -> Option<TransactionHandle> {
      self.executor.current_transaction()
   }

   pub fn end_transaction(&self, transaction: &TransactionHandle, successful: bool) -> Result<()> {
      self.executor.end_transaction(transaction, successful)
   }

   /// See [`Executor::transaction`].
   pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
   where
      F: FnOnce(TransactionHandle) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      self.ensure_schema_ready().await?;
      self.executor.transaction(body).await
   }

   /// See [`Executor::transaction_with`].
   pub async fn transaction_with<T, F, Fut>(&self, no_enclosing: bool, body: F) -> Result<T>
   where
      F: FnOnce(TransactionHandle) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      self.ensure_schema_ready().await?;
      self.executor.transaction_with(no_enclosing, body).await
   }

   pub async fn set_foreign_key_constraints_enabled(&self, enabled: bool) -> Result<()> {
      self.ensure_schema_ready().await?;
      ConfigurableDriver::new(&self.executor)
         .set_foreign_key_constraints_enabled(enabled)
         .await
   }

   pub async fn set_journal_mode(&self, mode: JournalMode) -> Result<()> {
      self.ensure_schema_ready().await?;
      ConfigurableDriver::new(&self.executor).set_journal_mode(mode).await
   }

   pub async fn set_sync(&self, mode: SyncMode) -> Result<()> {
      self.ensure_schema_ready().await?;
      ConfigurableDriver::new(&self.executor).set_sync(mode).await
   }

   pub fn observer(&self) -> &QueryObserver {
      &self.observer
   }

   pub fn add_listener<I, S>(&self, keys: I, listener: Arc<dyn QueryListener>)
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.observer.add_listener(keys, listener);
   }

   pub fn remove_listener<I, S>(&self, keys: I, listener: &Arc<dyn QueryListener>)
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      self.observer.remove_listener(keys, listener);
   }

   /// Tells every listener registered under any of `keys` that results changed.
   pub fn notify_listeners<I, S>(&self, keys: I)
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.observer.notify_listeners(keys);
   }

   pub fn subscribe<I, S>(&self, keys: I) -> QueryChangeStream
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.observer.subscribe(keys)
   }

   /// Closes every cached statement, then every connection.
   ///
   /// The caller must make sure nothing else is using the driver.
   pub async fn close(&self) -> Result<()> {
      if let Some(statements) = self.executor.statements() {
         statements.close_all();
      }
      self.executor.pool().close().await?;
      debug!("Driver closed");
      Ok(())
   }
}

/// Builder for [`SqliteDriver`].
pub struct SqliteDriverBuilder {
   database: DatabaseType,
   schema: Arc<dyn Schema>,
   config: SqliteConfig,
   callbacks: Arc<dyn DriverCallbacks>,
   migration_callbacks: Vec<AfterVersion>,
   factory: Option<Arc<dyn ConnectionFactory>>,
   pool: Option<Arc<dyn ConnectionPool>>,
}

impl SqliteDriverBuilder {
   fn new(database: DatabaseType, schema: Arc<dyn Schema>) -> Self {
      Self {
         database,
         schema,
         config: SqliteConfig::default(),
         callbacks: Arc::new(NoCallbacks),
         migration_callbacks: Vec::new(),
         factory: None,
         pool: None,
      }
   }

   pub fn config(mut self, config: SqliteConfig) -> Self {
      self.config = config;
      self
   }

   pub fn callbacks(mut self, callbacks: impl DriverCallbacks + 'static) -> Self {
      self.callbacks = Arc::new(callbacks);
      self
   }

   /// Adds a callback run during migrations that cross `callback`'s version.
   pub fn after_version(mut self, callback: AfterVersion) -> Self {
      self.migration_callbacks.push(callback);
      self
   }

   /// Opens connections through `factory`. A factory that manages
   /// concurrency itself gets a [`PassthroughConnectionPool`].
   pub fn factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
      self.factory = Some(factory);
      self
   }

   /// Uses `pool` as is, ignoring any factory.
   pub fn pool(mut self, pool: Arc<dyn ConnectionPool>) -> Self {
      self.pool = Some(pool);
      self
   }

   /// Validates the configuration and creates the pool. No connection is
   /// opened yet.
   pub fn build(self) -> Result<SqliteDriver> {
      self.config.validate()?;

      let pool: Arc<dyn ConnectionPool> = match (self.pool, self.factory) {
         (Some(pool), _) => pool,
         (None, Some(factory)) if factory.manages_concurrency() => Arc::new(
            PassthroughConnectionPool::open(&self.database, &self.config, factory)?,
         ),
         (None, factory) => Arc::new(WalConnectionPool::open(&self.database, &self.config, factory)?),
      };

      let statements = Arc::new(StatementCache::new(self.config.cache_size));
      let listener_cache = Arc::downgrade(&statements);
      pool.set_close_listener(Arc::new(move |connection| {
         if let Some(cache) = listener_cache.upgrade() {
            cache.close_connection(connection);
         }
      }));

      let transactions = Arc::new(TransactionCoordinator::default());
      debug!(
         database = %self.database.name(),
         cache_size = self.config.cache_size,
         "Driver created"
      );

      Ok(SqliteDriver {
         executor: Executor::new(Some(statements), Arc::clone(&transactions), Arc::clone(&pool)),
         init_executor: Executor::new(None, transactions, pool),
         schema: self.schema,
         callbacks: self.callbacks,
         migration_callbacks: self.migration_callbacks,
         gate: SchemaGate::default(),
         options: SchemaOptions::from(&self.config),
         observer: QueryObserver::default(),
      })
   }
}
