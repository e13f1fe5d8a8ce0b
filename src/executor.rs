//! Statement routing and execution

use std::future::Future;
use std::sync::Arc;

use sqlite_wal_pool::{
   Connection, ConnectionPool, Cursor, PragmaKind, SqliteValue, Statement, StatementCache, classify,
};
use tracing::trace;

use crate::transactions::{EndOnDrop, TransactionCoordinator, TransactionHandle, task_scope};
use crate::{Error, Result};

/// Binds parameters onto a prepared statement before it runs.
pub type Binder<'a> = &'a (dyn Fn(&mut Statement) -> Result<()> + Send + Sync);

/// Runs statements against a pool, routing each one to the right connection.
///
/// Statements of a task with an open transaction always run on that
/// transaction's connection. Otherwise queries go to a reader and everything
/// else to the writer, except for the pragmas [`classify`] singles out:
/// `journal_mode` assignments go through the pool's journal mode transition,
/// and `foreign_keys` and `synchronous` always run on the writer.
///
/// The executor handed to schema code and driver callbacks during first-use
/// initialization works the same way but never caches statements.
pub struct Executor {
   // Declared before `pool` so cached statements are finalized before the
   // connections they belong to can close.
   statements: Option<Arc<StatementCache>>,
   transactions: Arc<TransactionCoordinator>,
   pool: Arc<dyn ConnectionPool>,
}

impl Executor {
   pub(crate) fn new(
      statements: Option<Arc<StatementCache>>,
      transactions: Arc<TransactionCoordinator>,
      pool: Arc<dyn ConnectionPool>,
   ) -> Self {
      Self {
         statements,
         transactions,
         pool,
      }
   }

   pub(crate) fn statements(&self) -> Option<&Arc<StatementCache>> {
      self.statements.as_ref()
   }

   pub(crate) fn pool(&self) -> &Arc<dyn ConnectionPool> {
      &self.pool
   }

   pub(crate) fn transactions(&self) -> &TransactionCoordinator {
      &self.transactions
   }

   /// Runs a statement to completion and returns the number of rows it changed.
   ///
   /// `identifier` names the SQL text for the statement cache; equal
   /// identifiers must always carry equal SQL. `parameters` is the number of
   /// bind sites the binder fills. A `journal_mode` assignment returns 1.
   pub async fn execute(
      &self,
      identifier: Option<i32>,
      sql: &str,
      parameters: usize,
      binder: Option<Binder<'_>>,
   ) -> Result<u64> {
      match classify(sql) {
         PragmaKind::SetJournalMode => {
            self
               .set_journal_mode(sql, parameters, binder, |cursor| {
                  cursor.next()?;
                  Ok(())
               })
               .await?;
            Ok(1)
         }
         _ => {
            self
               .with_connection(true, |conn| {
                  self.run(conn, identifier, sql, parameters, binder, |statement| {
                     statement.run()?;
                     Ok(conn.changes())
                  })
               })
               .await
         }
      }
   }

   /// Runs a query and hands its rows to `mapper`.
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
      let write = match classify(sql) {
         PragmaKind::SetJournalMode => {
            return self.set_journal_mode(sql, parameters, binder, mapper).await;
         }
         PragmaKind::ForeignKeys | PragmaKind::Synchronous => true,
         PragmaKind::None => false,
      };

      self
         .with_connection(write, |conn| {
            self.run(conn, identifier, sql, parameters, binder, |statement| {
               mapper(&mut Cursor::new(statement))
            })
         })
         .await
   }

   /// [`Self::execute`] with positional values bound in order.
   pub async fn execute_values(
      &self,
      identifier: Option<i32>,
      sql: &str,
      values: &[SqliteValue],
   ) -> Result<u64> {
      let binder = |statement: &mut Statement| -> Result<()> { Ok(statement.bind_all(values)?) };
      self.execute(identifier, sql, values.len(), Some(&binder)).await
   }

   /// [`Self::execute_query`] collecting every row as values.
   pub async fn query_values(
      &self,
      identifier: Option<i32>,
      sql: &str,
      values: &[SqliteValue],
   ) -> Result<Vec<Vec<SqliteValue>>> {
      let binder = |statement: &mut Statement| -> Result<()> { Ok(statement.bind_all(values)?) };
      self
         .execute_query(identifier, sql, values.len(), Some(&binder), |cursor| {
            let mut rows = Vec::new();
            while cursor.next()? {
               rows.push(cursor.row());
            }
            Ok(rows)
         })
         .await
   }

   /// Opens a transaction for the calling task, nested when one is open.
   ///
   /// Must run inside [`task_scope`]; the transaction stays open until
   /// [`Self::end_transaction`].
   pub async fn new_transaction(&self) -> Result<TransactionHandle> {
      let tx = self.transactions.begin(self.pool.as_ref(), false).await?;
      Ok(TransactionHandle::new(tx))
   }

   /// The calling task's innermost open transaction.
   pub fn current_transaction(&self) -> Option<TransactionHandle> {
      self.transactions.current().map(TransactionHandle::new)
   }

   /// Ends a transaction opened with [`Self::new_transaction`].
   pub fn end_transaction(&self, transaction: &TransactionHandle, successful: bool) -> Result<()> {
      transaction.check_owner()?;
      self.transactions.end(&transaction.tx, successful)
   }

   /// Runs `body` in a transaction, committing when it returns `Ok` and no
   /// rollback was requested, rolling back otherwise.
   pub async fn transaction<T, F, Fut>(&self, body: F) -> Result<T>
   where
      F: FnOnce(TransactionHandle) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      self.transaction_with(false, body).await
   }

   /// Like [`Self::transaction`]; with `no_enclosing` it fails instead of
   /// nesting when the task already has a transaction open.
   ///
   /// Dropping the returned future before it completes rolls the
   /// transaction back.
   pub async fn transaction_with<T, F, Fut>(&self, no_enclosing: bool, body: F) -> Result<T>
   where
      F: FnOnce(TransactionHandle) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      task_scope(async move {
         let tx = self.transactions.begin(self.pool.as_ref(), no_enclosing).await?;
         let guard = EndOnDrop::new(&self.transactions, Arc::clone(&tx));

         let result = body(TransactionHandle::new(Arc::clone(&tx))).await;
         guard.disarm();

         let successful = result.is_ok();
         match (result, self.transactions.end(&tx, successful)) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(rollback_error)) => Err(Error::TransactionRollbackFailed {
               transaction_error: e.to_string(),
               rollback_error: rollback_error.to_string(),
            }),
         }
      })
      .await
   }

   /// Runs `f` on the calling task's transaction connection.
   pub(crate) fn with_transaction_connection<T>(
      &self,
      f: impl FnOnce(&Connection) -> Result<T>,
   ) -> Result<T> {
      match self.transactions.current() {
         Some(tx) => tx.with_connection(f),
         None => Err(Error::Other("no transaction is open for this task".to_string())),
      }
   }

   async fn with_connection<T>(&self, write: bool, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
      if let Some(tx) = self.transactions.current() {
         return tx.with_connection(f);
      }

      if write {
         let writer = self.pool.acquire_writer().await?;
         f(&writer)
      } else {
         let reader = self.pool.acquire_reader().await?;
         f(&reader)
      }
   }

   async fn set_journal_mode<R, M>(
      &self,
      sql: &str,
      parameters: usize,
      binder: Option<Binder<'_>>,
      mapper: M,
   ) -> Result<R>
   where
      M: FnOnce(&mut Cursor<'_>) -> Result<R>,
   {
      self.transactions.ensure_idle("journal mode change")?;

      self
         .pool
         .set_journal_mode(|writer| {
            let (value, captured) = run_statement(None, writer, None, sql, parameters, binder, |statement| {
               let mut cursor = Cursor::capturing(statement);
               let value = mapper(&mut cursor)?;
               Ok((value, cursor.finish()?))
            })?;

            // The pragma produced no row; ask the writer directly
            let reported = match captured {
               Some(reported) => reported,
               None => writer.query_text("PRAGMA journal_mode")?.unwrap_or_default(),
            };
            Ok::<_, Error>((value, reported))
         })
         .await
   }

   fn run<T>(
      &self,
      conn: &Connection,
      identifier: Option<i32>,
      sql: &str,
      parameters: usize,
      binder: Option<Binder<'_>>,
      body: impl FnOnce(&mut Statement) -> Result<T>,
   ) -> Result<T> {
      run_statement(self.statements.as_deref(), conn, identifier, sql, parameters, binder, body)
   }
}

/// Prepares (or checks out of the cache), binds and runs one statement.
///
/// A statement with an identifier goes back into the cache afterwards, reset
/// and with bindings cleared, even when running it failed. Anything else is
/// closed.
fn run_statement<T>(
   cache: Option<&StatementCache>,
   conn: &Connection,
   identifier: Option<i32>,
   sql: &str,
   parameters: usize,
   binder: Option<Binder<'_>>,
   body: impl FnOnce(&mut Statement) -> Result<T>,
) -> Result<T> {
   let cache = cache.filter(|cache| cache.is_enabled());
   let slot = identifier.zip(cache);

   let cached = slot.and_then(|(id, cache)| {
      let statement = cache.get(conn.id(), id)?;
      trace!(identifier = id, connection = %conn.id(), "Statement cache hit");
      Some(statement)
   });
   let mut statement = match cached {
      Some(statement) => statement,
      None => conn.prepare(sql)?,
   };

   let result = bind_and_run(&mut statement, parameters, binder, body);

   match slot {
      Some((id, cache)) => {
         if let Err(e) = statement.reset().and_then(|()| statement.clear_bindings()) {
            trace!(identifier = id, error = %e, "Reset before caching reported an error");
         }
         cache.put(conn.id(), id, statement);
      }
      None => statement.close(),
   }

   result
}

fn bind_and_run<T>(
   statement: &mut Statement,
   parameters: usize,
   binder: Option<Binder<'_>>,
   body: impl FnOnce(&mut Statement) -> Result<T>,
) -> Result<T> {
   let count = statement.parameter_count();
   if parameters > count {
      return Err(sqlite_wal_pool::Error::BindIndexOutOfRange {
         index: parameters - 1,
         count,
      }
      .into());
   }

   if let Some(binder) = binder {
      binder(statement)?;
   }
   body(statement)
}
