//! Transactions pinned to the writer connection for the task that opened them

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sqlite_wal_pool::{Connection, ConnectionId, ConnectionPool, WriterGuard};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::{Error, Result};

tokio::task_local! {
   static TASK: TaskToken;
}

/// Identifies one logical task for transaction ownership.
///
/// Assigned by [`task_scope`] and visible to every future polled inside that
/// scope, across suspension points. Spawned tasks do not inherit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskToken(u64);

impl TaskToken {
   fn next() -> Self {
      static NEXT: AtomicU64 = AtomicU64::new(1);
      Self(NEXT.fetch_add(1, Ordering::Relaxed))
   }

   /// The token of the scope the caller runs in, if any.
   pub fn current() -> Option<Self> {
      TASK.try_with(|token| *token).ok()
   }
}

/// Runs `fut` with a task token, so transactions opened inside it can be
/// found again by later statements of the same logical task.
///
/// Nested scopes keep the outer token.
pub async fn task_scope<F: Future>(fut: F) -> F::Output {
   match TaskToken::current() {
      Some(_) => fut.await,
      None => TASK.scope(TaskToken::next(), fut).await,
   }
}

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TransactionState {
   after_commit: Vec<Callback>,
   after_rollback: Vec<Callback>,
   rollback_requested: bool,
   child_rolled_back: bool,
   ended: bool,
}

/// The writer connection shared by an outer transaction and everything
/// nested in it. Emptied when the outer transaction ends.
type Pinned = Arc<Mutex<Option<WriterGuard>>>;

pub(crate) struct Transaction {
   id: Uuid,
   owner: TaskToken,
   enclosing: Option<Arc<Transaction>>,
   pinned: Pinned,
   state: Mutex<TransactionState>,
}

impl Transaction {
   fn new(owner: TaskToken, enclosing: Option<Arc<Transaction>>, pinned: Pinned) -> Arc<Self> {
      Arc::new(Self {
         id: Uuid::new_v4(),
         owner,
         enclosing,
         pinned,
         state: Mutex::new(TransactionState::default()),
      })
   }

   fn is_nested_in(&self, ancestor: &Arc<Transaction>) -> bool {
      let mut current = self.enclosing.as_ref();
      while let Some(tx) = current {
         if Arc::ptr_eq(tx, ancestor) {
            return true;
         }
         current = tx.enclosing.as_ref();
      }
      false
   }

   /// Runs `f` on the pinned connection.
   pub(crate) fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
      let pinned = self.pinned.lock();
      let writer = pinned.as_ref().ok_or(Error::TransactionAlreadyFinalized)?;
      f(writer)
   }
}

/// Tracks the innermost open transaction of every task.
#[derive(Default)]
pub(crate) struct TransactionCoordinator {
   active: Mutex<HashMap<TaskToken, Arc<Transaction>>>,
}

impl TransactionCoordinator {
   /// The calling task's innermost open transaction.
   pub(crate) fn current(&self) -> Option<Arc<Transaction>> {
      let token = TaskToken::current()?;
      self.active.lock().get(&token).cloned()
   }

   /// Fails when the calling task has a transaction open.
   pub(crate) fn ensure_idle(&self, operation: &'static str) -> Result<()> {
      match self.current() {
         Some(_) => Err(Error::TransactionActive(operation)),
         None => Ok(()),
      }
   }

   /// Opens a transaction for the calling task.
   ///
   /// Nested inside an open transaction it shares that transaction's
   /// connection and issues nothing; otherwise it takes the writer and runs
   /// `BEGIN IMMEDIATE`.
   pub(crate) async fn begin(
      &self,
      pool: &dyn ConnectionPool,
      no_enclosing: bool,
   ) -> Result<Arc<Transaction>> {
      let owner = TaskToken::current().ok_or(Error::NoTaskContext)?;

      let enclosing = self.active.lock().get(&owner).cloned();
      if let Some(enclosing) = enclosing {
         if no_enclosing {
            return Err(Error::TransactionAlreadyActive);
         }
         let tx = Transaction::new(owner, Some(Arc::clone(&enclosing)), Arc::clone(&enclosing.pinned));
         self.active.lock().insert(owner, Arc::clone(&tx));
         trace!(transaction = %tx.id, enclosing = %enclosing.id, "Nested transaction started");
         return Ok(tx);
      }

      let writer = pool.acquire_writer().await?;
      writer.execute_batch("BEGIN IMMEDIATE")?;

      let tx = Transaction::new(owner, None, Arc::new(Mutex::new(Some(writer))));
      self.active.lock().insert(owner, Arc::clone(&tx));
      debug!(transaction = %tx.id, "Transaction started");
      Ok(tx)
   }

   /// Ends `tx`. No ownership check; callers that take a handle from user
   /// code check it first.
   ///
   /// Only the outermost transaction issues `COMMIT` or `ROLLBACK`. A nested
   /// end hands its callbacks to the enclosing transaction and, when
   /// unsuccessful, dooms the whole nest to roll back. Transactions still
   /// open inside `tx` are ended unsuccessfully first.
   pub(crate) fn end(&self, tx: &Arc<Transaction>, successful: bool) -> Result<()> {
      self.unwind_nested(tx)?;

      let state = {
         let mut current = tx.state.lock();
         if current.ended {
            return Err(Error::TransactionAlreadyFinalized);
         }
         let state = std::mem::take(&mut *current);
         current.ended = true;
         state
      };
      let committed = successful && !state.rollback_requested && !state.child_rolled_back;

      if let Some(enclosing) = &tx.enclosing {
         let mut parent = enclosing.state.lock();
         if parent.ended {
            return Err(Error::TransactionAlreadyFinalized);
         }
         parent.child_rolled_back |= !committed;
         parent.after_commit.extend(state.after_commit);
         parent.after_rollback.extend(state.after_rollback);
         drop(parent);

         self.active.lock().insert(tx.owner, Arc::clone(enclosing));
         trace!(transaction = %tx.id, committed, "Nested transaction ended");
         return Ok(());
      }

      self.active.lock().remove(&tx.owner);
      let Some(writer) = tx.pinned.lock().take() else {
         return Err(Error::TransactionAlreadyFinalized);
      };

      let outcome = if committed {
         writer.execute_batch("COMMIT").map(|()| true).map_err(|commit_error| {
            if let Err(e) = writer.execute_batch("ROLLBACK") {
               error!(transaction = %tx.id, error = %e, "Rollback after failed commit also failed");
            }
            commit_error
         })
      } else {
         writer.execute_batch("ROLLBACK").map(|()| false)
      };
      // Release the writer before any callback runs
      drop(writer);

      match outcome {
         Ok(true) => {
            debug!(transaction = %tx.id, "Transaction committed");
            state.after_commit.into_iter().for_each(|f| f());
            Ok(())
         }
         Ok(false) => {
            debug!(transaction = %tx.id, "Transaction rolled back");
            state.after_rollback.into_iter().for_each(|f| f());
            Ok(())
         }
         Err(e) => {
            warn!(transaction = %tx.id, error = %e, "Transaction failed to end cleanly");
            state.after_rollback.into_iter().for_each(|f| f());
            Err(e.into())
         }
      }
   }

   fn unwind_nested(&self, tx: &Arc<Transaction>) -> Result<()> {
      loop {
         let innermost = match self.active.lock().get(&tx.owner) {
            Some(innermost) if innermost.is_nested_in(tx) => Arc::clone(innermost),
            _ => return Ok(()),
         };
         warn!(
            transaction = %tx.id,
            nested = %innermost.id,
            "Ending a transaction with a nested one still open, rolling the nested one back"
         );
         self.end(&innermost, false)?;
      }
   }
}

/// Rolls back a transaction whose scope is dropped before it ends.
pub(crate) struct EndOnDrop<'a> {
   coordinator: &'a TransactionCoordinator,
   tx: Arc<Transaction>,
   armed: bool,
}

impl<'a> EndOnDrop<'a> {
   pub(crate) fn new(coordinator: &'a TransactionCoordinator, tx: Arc<Transaction>) -> Self {
      Self {
         coordinator,
         tx,
         armed: true,
      }
   }

   pub(crate) fn disarm(mut self) {
      self.armed = false;
   }
}

impl Drop for EndOnDrop<'_> {
   fn drop(&mut self) {
      if self.armed {
         debug!(transaction = %self.tx.id, "Transaction scope dropped, rolling back");
         if let Err(e) = self.coordinator.end(&self.tx, false) {
            warn!(transaction = %self.tx.id, error = %e, "Rollback of dropped transaction failed");
         }
      }
   }
}

/// A transaction as seen by user code.
///
/// Every method is confined to the task that opened the transaction; calls
/// from any other task fail with [`Error::TransactionConfinement`].
#[derive(Clone)]
pub struct TransactionHandle {
   pub(crate) tx: Arc<Transaction>,
}

impl TransactionHandle {
   pub(crate) fn new(tx: Arc<Transaction>) -> Self {
      Self { tx }
   }

   pub fn id(&self) -> Uuid {
      self.tx.id
   }

   /// Whether this transaction runs inside another one.
   pub fn is_nested(&self) -> bool {
      self.tx.enclosing.is_some()
   }

   pub fn enclosing(&self) -> Option<TransactionHandle> {
      self.tx.enclosing.clone().map(TransactionHandle::new)
   }

   /// The connection every statement of this transaction runs on, until
   /// the outermost transaction ends.
   pub fn connection_id(&self) -> Option<ConnectionId> {
      self.tx.pinned.lock().as_ref().map(|writer| writer.id())
   }

   pub(crate) fn check_owner(&self) -> Result<()> {
      if TaskToken::current() != Some(self.tx.owner) {
         return Err(Error::TransactionConfinement(self.tx.id.to_string()));
      }
      Ok(())
   }

   fn with_open_state(&self, f: impl FnOnce(&mut TransactionState)) -> Result<()> {
      self.check_owner()?;
      let mut state = self.tx.state.lock();
      if state.ended {
         return Err(Error::TransactionAlreadyFinalized);
      }
      f(&mut state);
      Ok(())
   }

   /// Runs `f` once the outermost transaction commits.
   pub fn after_commit(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
      self.with_open_state(|state| state.after_commit.push(Box::new(f)))
   }

   /// Runs `f` once the outermost transaction rolls back.
   pub fn after_rollback(&self, f: impl FnOnce() + Send + 'static) -> Result<()> {
      self.with_open_state(|state| state.after_rollback.push(Box::new(f)))
   }

   /// Marks the transaction for rollback. The body keeps running; the
   /// rollback happens when the transaction ends.
   pub fn rollback(&self) -> Result<()> {
      self.with_open_state(|state| state.rollback_requested = true)
   }
}

impl std::fmt::Debug for TransactionHandle {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("TransactionHandle")
         .field("id", &self.tx.id)
         .field("nested", &self.is_nested())
         .finish()
   }
}
