use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlite_wal_driver::{
   ConnectionPool, DatabaseType, Error, Executor, Result, Schema, SqliteConfig, SqliteDriver,
   SqliteValue, task_scope,
};
use tempfile::TempDir;

struct ItemsSchema;

#[async_trait]
impl Schema for ItemsSchema {
   fn version(&self) -> i64 {
      1
   }

   async fn create(&self, driver: &Executor) -> Result<()> {
      driver
         .execute(None, "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)", 0, None)
         .await?;
      Ok(())
   }

   async fn migrate(&self, _driver: &Executor, _old: i64, _new: i64) -> Result<()> {
      Ok(())
   }
}

fn create_test_driver() -> (Arc<SqliteDriver>, TempDir) {
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let path = temp_dir.path().join("test.db");
   let driver = SqliteDriver::open(DatabaseType::File(path), ItemsSchema, SqliteConfig::default())
      .expect("Failed to create driver");
   (Arc::new(driver), temp_dir)
}

async fn insert_item(driver: &SqliteDriver, label: &str) -> Result<u64> {
   driver
      .execute_values(Some(1), "INSERT INTO items (label) VALUES (?)", &[label.into()])
      .await
}

async fn count_items(driver: &SqliteDriver) -> i64 {
   let rows = driver
      .query_values(Some(2), "SELECT COUNT(*) FROM items", &[])
      .await
      .unwrap();
   match rows[0][0] {
      SqliteValue::Integer(count) => count,
      ref other => panic!("unexpected count {other:?}"),
   }
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Arc<AtomicUsize>) {
   let count = Arc::new(AtomicUsize::new(0));
   let handle = Arc::clone(&count);
   (count, move || Arc::clone(&handle))
}

#[tokio::test]
async fn test_commit_runs_after_commit_callbacks() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();
   let (commits, commit_counter) = counter();
   let (rollbacks, rollback_counter) = counter();

   db.transaction(|tx| async move {
      insert_item(db, "a").await?;
      let c = commit_counter();
      tx.after_commit(move || {
         c.fetch_add(1, Ordering::SeqCst);
      })?;
      let r = rollback_counter();
      tx.after_rollback(move || {
         r.fetch_add(1, Ordering::SeqCst);
      })?;
      Ok(())
   })
   .await
   .unwrap();

   assert_eq!(commits.load(Ordering::SeqCst), 1);
   assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
   assert_eq!(count_items(db).await, 1);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_body_error_rolls_back() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();
   let (rollbacks, rollback_counter) = counter();

   let result: Result<()> = db
      .transaction(|tx| async move {
         insert_item(db, "a").await?;
         let r = rollback_counter();
         tx.after_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
         })?;
         Err(Error::Other("boom".into()))
      })
      .await;

   assert_eq!(result.unwrap_err().to_string(), "boom");
   assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
   assert_eq!(count_items(db).await, 0);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_rollback_request_keeps_body_running() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();

   let value = db
      .transaction(|tx| async move {
         insert_item(db, "a").await?;
         tx.rollback()?;
         insert_item(db, "b").await?;
         Ok(42)
      })
      .await
      .unwrap();

   assert_eq!(value, 42);
   assert_eq!(count_items(db).await, 0);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_nested_transactions_share_connection() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();

   db.transaction(|outer| async move {
      assert!(!outer.is_nested());
      let outer_connection = outer.connection_id();
      assert!(outer_connection.is_some());

      let outer_id = outer.id();
      db.transaction(|inner| async move {
         assert!(inner.is_nested());
         assert_eq!(inner.connection_id(), outer_connection);
         assert_eq!(inner.enclosing().map(|tx| tx.id()), Some(outer_id));
         assert_eq!(db.current_transaction().map(|tx| tx.id()), Some(inner.id()));
         insert_item(db, "inner").await?;
         Ok(())
      })
      .await?;

      assert_eq!(db.current_transaction().map(|tx| tx.id()), Some(outer_id));
      // Uncommitted rows are visible on the transaction's own connection
      assert_eq!(count_items(db).await, 1);
      Ok(())
   })
   .await
   .unwrap();

   assert!(db.current_transaction().is_none());
   assert_eq!(count_items(db).await, 1);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_inner_rollback_rolls_back_whole_nest() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();
   let (commits, commit_counter) = counter();
   let (rollbacks, rollback_counter) = counter();
   let pending_rollbacks = &rollbacks;

   db.transaction(|outer| async move {
      insert_item(db, "outer").await?;
      let c = commit_counter();
      outer.after_commit(move || {
         c.fetch_add(1, Ordering::SeqCst);
      })?;

      db.transaction(|inner| async move {
         insert_item(db, "inner").await?;
         let r = rollback_counter();
         inner.after_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
         })?;
         inner.rollback()?;
         Ok(())
      })
      .await?;

      // Deferred until the outermost transaction ends
      assert_eq!(pending_rollbacks.load(Ordering::SeqCst), 0);
      Ok(())
   })
   .await
   .unwrap();

   assert_eq!(commits.load(Ordering::SeqCst), 0);
   assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
   assert_eq!(count_items(db).await, 0);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_no_enclosing_refuses_to_nest() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();

   db.transaction(|_outer| async move {
      let err = db
         .transaction_with(true, |_inner| async move { Ok(()) })
         .await
         .unwrap_err();
      assert!(matches!(err, Error::TransactionAlreadyActive));
      insert_item(db, "still open").await?;
      Ok(())
   })
   .await
   .unwrap();

   assert_eq!(count_items(db).await, 1);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_handle_confined_to_owning_task() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();
   let shared = Arc::clone(&driver);

   db.transaction(|tx| async move {
      let foreign = tx.clone();
      let spawned = shared;
      let (callback, rollback, end, begin) = tokio::spawn(async move {
         (
            foreign.after_commit(|| {}),
            foreign.rollback(),
            spawned.end_transaction(&foreign, true),
            spawned.new_transaction().await,
         )
      })
      .await
      .unwrap();

      assert!(matches!(callback, Err(Error::TransactionConfinement(_))));
      assert!(matches!(rollback, Err(Error::TransactionConfinement(_))));
      assert!(matches!(end, Err(Error::TransactionConfinement(_))));
      assert!(matches!(begin, Err(Error::NoTaskContext)));

      insert_item(db, "kept").await?;
      Ok(())
   })
   .await
   .unwrap();

   assert_eq!(count_items(db).await, 1);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_other_tasks_read_committed_data() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();
   let reader = Arc::clone(&driver);

   db.transaction(|_tx| async move {
      insert_item(db, "pending").await?;

      let seen = tokio::spawn(async move { count_items(&reader).await }).await.unwrap();
      assert_eq!(seen, 0);
      Ok(())
   })
   .await
   .unwrap();

   assert_eq!(count_items(db).await, 1);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_explicit_transaction_lifecycle() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();

   task_scope(async move {
      let tx = db.new_transaction().await.unwrap();
      assert_eq!(db.current_transaction().map(|t| t.id()), Some(tx.id()));
      insert_item(db, "explicit").await.unwrap();

      db.end_transaction(&tx, true).unwrap();
      assert!(db.current_transaction().is_none());

      assert!(matches!(
         db.end_transaction(&tx, true),
         Err(Error::TransactionAlreadyFinalized)
      ));
      assert!(matches!(
         tx.after_commit(|| {}),
         Err(Error::TransactionAlreadyFinalized)
      ));
   })
   .await;

   assert_eq!(count_items(db).await, 1);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_explicit_unsuccessful_end_rolls_back() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();

   task_scope(async move {
      let tx = db.new_transaction().await.unwrap();
      insert_item(db, "discarded").await.unwrap();
      db.end_transaction(&tx, false).unwrap();
   })
   .await;

   assert_eq!(count_items(db).await, 0);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_ending_outer_transaction_rolls_back_open_nested_one() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();
   let (rollbacks, rollback_counter) = counter();

   task_scope(async move {
      let outer = db.new_transaction().await.unwrap();
      let inner = db.new_transaction().await.unwrap();
      insert_item(db, "left open").await.unwrap();
      let r = rollback_counter();
      inner
         .after_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
         })
         .unwrap();

      db.end_transaction(&outer, true).unwrap();
      assert!(db.current_transaction().is_none());
      assert!(matches!(
         db.end_transaction(&inner, true),
         Err(Error::TransactionAlreadyFinalized)
      ));
   })
   .await;

   assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
   assert_eq!(count_items(db).await, 0);
   let writer = tokio::time::timeout(Duration::from_secs(1), db.pool().acquire_writer()).await;
   assert!(matches!(writer, Ok(Ok(_))));
   drop(writer);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_new_transaction_needs_task_scope() {
   let (driver, _temp) = create_test_driver();

   let err = driver.new_transaction().await.unwrap_err();
   assert!(matches!(err, Error::NoTaskContext));
   assert_eq!(err.error_code(), "NO_TASK_CONTEXT");
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back_and_releases_writer() {
   let (driver, _temp) = create_test_driver();
   let db = driver.as_ref();
   let (rollbacks, rollback_counter) = counter();
   assert_eq!(count_items(db).await, 0);

   let stalled = db.transaction(|tx| async move {
      insert_item(db, "abandoned").await?;
      let r = rollback_counter();
      tx.after_rollback(move || {
         r.fetch_add(1, Ordering::SeqCst);
      })?;
      std::future::pending::<()>().await;
      Ok(())
   });
   assert!(tokio::time::timeout(Duration::from_millis(100), stalled).await.is_err());

   assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
   let writer = tokio::time::timeout(Duration::from_secs(1), db.pool().acquire_writer()).await;
   assert!(matches!(writer, Ok(Ok(_))));
   drop(writer);

   assert_eq!(count_items(db).await, 0);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_transactions_serialize_on_writer() {
   let (driver, _temp) = create_test_driver();

   let mut handles = Vec::new();
   for i in 0..10 {
      let driver = Arc::clone(&driver);
      handles.push(tokio::spawn(async move {
         let db = driver.as_ref();
         db.transaction(|_tx| async move {
            insert_item(db, &format!("item {i}")).await?;
            tokio::time::sleep(Duration::from_millis(2)).await;
            insert_item(db, &format!("item {i} again")).await?;
            Ok(())
         })
         .await
      }));
   }
   for handle in handles {
      handle.await.unwrap().unwrap();
   }

   assert_eq!(count_items(&driver).await, 20);
   driver.close().await.unwrap();
}
