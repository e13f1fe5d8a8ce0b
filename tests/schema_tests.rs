use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlite_wal_driver::{
   AfterVersion, ConfigurableDriver, ConnectionPool, DatabaseType, DriverCallbacks, Error, Executor,
   JournalMode, Result, Schema, SqliteConfig, SqliteDriver, SqliteValue,
};
use tempfile::TempDir;

/// Records every schema step and callback in the order they ran.
#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
   fn record(&self, event: impl Into<String>) {
      self.0.lock().push(event.into());
   }

   fn events(&self) -> Vec<String> {
      self.0.lock().clone()
   }

   fn count(&self, event: &str) -> usize {
      self.0.lock().iter().filter(|e| *e == event).count()
   }
}

struct Recorder(Journal);

#[async_trait]
impl DriverCallbacks for Recorder {
   async fn on_configure(&self, _driver: &ConfigurableDriver<'_>) -> Result<()> {
      self.0.record("configure");
      Ok(())
   }

   async fn on_create(&self, _driver: &Executor) -> Result<()> {
      self.0.record("on_create");
      Ok(())
   }

   async fn on_update(&self, _driver: &Executor, old: i64, new: i64) -> Result<()> {
      self.0.record(format!("on_update {old}->{new}"));
      Ok(())
   }

   async fn on_open(&self, _driver: &Executor) -> Result<()> {
      self.0.record("on_open");
      Ok(())
   }
}

/// Schema whose create and migrate run the given statements.
struct ScriptedSchema {
   version: i64,
   create: Vec<String>,
   migrate: Vec<String>,
   journal: Journal,
}

impl ScriptedSchema {
   fn new(version: i64, create: &[&str], journal: &Journal) -> Self {
      Self {
         version,
         create: create.iter().map(|s| s.to_string()).collect(),
         migrate: Vec::new(),
         journal: journal.clone(),
      }
   }

   fn with_migration(mut self, migrate: &[&str]) -> Self {
      self.migrate = migrate.iter().map(|s| s.to_string()).collect();
      self
   }
}

#[async_trait]
impl Schema for ScriptedSchema {
   fn version(&self) -> i64 {
      self.version
   }

   async fn create(&self, driver: &Executor) -> Result<()> {
      self.journal.record("create");
      for sql in &self.create {
         driver.execute(None, sql, 0, None).await?;
      }
      Ok(())
   }

   async fn migrate(&self, driver: &Executor, old: i64, new: i64) -> Result<()> {
      self.journal.record(format!("migrate {old}->{new}"));
      for sql in &self.migrate {
         driver.execute(None, sql, 0, None).await?;
      }
      Ok(())
   }
}

const PARENT_CHILD: [&str; 2] = [
   "CREATE TABLE parent (id INTEGER PRIMARY KEY)",
   "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id))",
];

fn open_driver(path: &Path, schema: ScriptedSchema, config: SqliteConfig, journal: &Journal) -> SqliteDriver {
   SqliteDriver::builder(DatabaseType::File(path.to_path_buf()), schema)
      .config(config)
      .callbacks(Recorder(journal.clone()))
      .build()
      .expect("Failed to create driver")
}

async fn user_version(driver: &SqliteDriver) -> Option<i64> {
   let writer = driver.pool().acquire_writer().await.unwrap();
   writer.query_i64("PRAGMA user_version").unwrap()
}

async fn table_count(driver: &SqliteDriver, name: &str) -> i64 {
   let writer = driver.pool().acquire_writer().await.unwrap();
   writer
      .query_i64(&format!(
         "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '{name}'"
      ))
      .unwrap()
      .unwrap_or(0)
}

#[tokio::test]
async fn test_create_runs_once_under_concurrent_first_use() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let schema = ScriptedSchema::new(1, &["CREATE TABLE users (id INTEGER PRIMARY KEY)"], &journal);
   let driver = Arc::new(open_driver(
      &temp_dir.path().join("test.db"),
      schema,
      SqliteConfig::default(),
      &journal,
   ));

   let mut handles = Vec::new();
   for _ in 0..100 {
      let driver = Arc::clone(&driver);
      handles.push(tokio::spawn(async move {
         driver
            .query_values(Some(1), "SELECT COUNT(*) FROM users", &[])
            .await
      }));
   }
   for handle in handles {
      let rows = handle.await.unwrap().unwrap();
      assert_eq!(rows, vec![vec![SqliteValue::Integer(0)]]);
   }

   assert_eq!(journal.events(), vec!["configure", "create", "on_create", "on_open"]);
   assert_eq!(user_version(&driver).await, Some(1));
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_migration_runs_update_callback() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("test.db");
   let journal = Journal::default();

   let v1 = ScriptedSchema::new(1, &["CREATE TABLE users (id INTEGER PRIMARY KEY)"], &journal);
   let driver = open_driver(&path, v1, SqliteConfig::default(), &journal);
   driver.query_values(None, "SELECT * FROM users", &[]).await.unwrap();
   driver.close().await.unwrap();

   let journal = Journal::default();
   let v2 = ScriptedSchema::new(2, &[], &journal)
      .with_migration(&["ALTER TABLE users ADD COLUMN name TEXT"]);
   let driver = open_driver(&path, v2, SqliteConfig::default(), &journal);
   driver
      .execute_values(None, "INSERT INTO users (name) VALUES (?)", &["Alice".into()])
      .await
      .unwrap();

   assert_eq!(
      journal.events(),
      vec!["configure", "migrate 1->2", "on_update 1->2", "on_open"]
   );
   assert_eq!(user_version(&driver).await, Some(2));
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_current_version_only_opens() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("test.db");

   let journal = Journal::default();
   let schema = ScriptedSchema::new(3, &["CREATE TABLE users (id INTEGER PRIMARY KEY)"], &journal);
   let driver = open_driver(&path, schema, SqliteConfig::default(), &journal);
   driver.query_values(None, "SELECT * FROM users", &[]).await.unwrap();
   driver.close().await.unwrap();

   let journal = Journal::default();
   let schema = ScriptedSchema::new(3, &["CREATE TABLE users (id INTEGER PRIMARY KEY)"], &journal);
   let driver = open_driver(&path, schema, SqliteConfig::default(), &journal);
   driver.query_values(None, "SELECT * FROM users", &[]).await.unwrap();

   assert_eq!(journal.events(), vec!["configure", "on_open"]);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_database_migrates_when_configured() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let schema = ScriptedSchema::new(3, &[], &journal)
      .with_migration(&["CREATE TABLE users (id INTEGER PRIMARY KEY)"]);
   let driver = open_driver(
      &temp_dir.path().join("test.db"),
      schema,
      SqliteConfig {
         migrate_empty_schema: true,
         ..Default::default()
      },
      &journal,
   );

   driver.query_values(None, "SELECT * FROM users", &[]).await.unwrap();

   assert_eq!(
      journal.events(),
      vec!["configure", "migrate 0->3", "on_update 0->3", "on_open"]
   );
   assert_eq!(user_version(&driver).await, Some(3));
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_foreign_key_violations_fail_create() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let mut script = PARENT_CHILD.to_vec();
   script.push("INSERT INTO child (id, parent_id) VALUES (1, 10), (2, 20)");
   let schema = ScriptedSchema::new(1, &script, &journal);
   let driver = open_driver(
      &temp_dir.path().join("test.db"),
      schema,
      SqliteConfig {
         foreign_key_constraints_enabled: true,
         ..Default::default()
      },
      &journal,
   );

   let err = driver
      .query_values(None, "SELECT * FROM child", &[])
      .await
      .unwrap_err();
   assert_eq!(
      err.to_string(),
      "The following foreign key constraints are violated:\n\n\
       ForeignKeyConstraintViolation:\n  Constraint index: 0\n  Referencing table: child\n  Referencing rowId: 1\n  Referenced table: parent\n\n\
       ForeignKeyConstraintViolation:\n  Constraint index: 0\n  Referencing table: child\n  Referencing rowId: 2\n  Referenced table: parent"
   );
   assert_eq!(err.error_code(), "FOREIGN_KEY_CONSTRAINT_CHECK");

   // Nothing from the failed create survives, and enforcement is back on
   assert_eq!(user_version(&driver).await, Some(0));
   assert_eq!(table_count(&driver, "child").await, 0);
   let writer = driver.pool().acquire_writer().await.unwrap();
   assert_eq!(writer.query_i64("PRAGMA foreign_keys").unwrap(), Some(1));
   drop(writer);

   assert_eq!(journal.events(), vec!["configure", "create"]);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_foreign_key_report_respects_cap() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let mut script = PARENT_CHILD.to_vec();
   script.push("INSERT INTO child (id, parent_id) VALUES (1, 10), (2, 20)");
   let schema = ScriptedSchema::new(1, &script, &journal);
   let driver = open_driver(
      &temp_dir.path().join("test.db"),
      schema,
      SqliteConfig {
         max_foreign_key_violations_reported: 1,
         ..Default::default()
      },
      &journal,
   );

   let err = driver
      .execute(None, "DELETE FROM child", 0, None)
      .await
      .unwrap_err();
   let Error::ForeignKeyConstraintCheck {
      violations,
      unreported,
      message,
   } = err
   else {
      panic!("expected a foreign key check error");
   };
   assert_eq!(violations.len(), 1);
   assert_eq!(violations[0].referencing_row_id, 1);
   assert_eq!(unreported, 1);
   assert!(message.starts_with("The following foreign key constraints are violated:\n\n"));
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_foreign_key_report_hides_rows_past_five() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let mut script = PARENT_CHILD.to_vec();
   script.push(
      "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 101) \
       INSERT INTO child (id, parent_id) SELECT x, x + 1000 FROM n",
   );
   let schema = ScriptedSchema::new(1, &script, &journal);
   let driver = open_driver(
      &temp_dir.path().join("test.db"),
      schema,
      SqliteConfig::default(),
      &journal,
   );

   let err = driver
      .query_values(None, "SELECT * FROM child", &[])
      .await
      .unwrap_err();
   let Error::ForeignKeyConstraintCheck {
      violations,
      unreported,
      message,
   } = err
   else {
      panic!("expected a foreign key check error");
   };
   assert_eq!(violations.len(), 100);
   assert_eq!(unreported, 1);
   assert!(message.starts_with("The following foreign key constraints are violated (95 not shown):\n\n"));
   assert_eq!(message.matches("ForeignKeyConstraintViolation:").count(), 5);
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_unchecked_violations_are_kept() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let mut script = PARENT_CHILD.to_vec();
   script.push("INSERT INTO child (id, parent_id) VALUES (1, 10)");
   let schema = ScriptedSchema::new(1, &script, &journal);
   let driver = open_driver(
      &temp_dir.path().join("test.db"),
      schema,
      SqliteConfig {
         foreign_key_constraints_checked_after_create_or_update: false,
         ..Default::default()
      },
      &journal,
   );

   let rows = driver.query_values(None, "SELECT id FROM child", &[]).await.unwrap();
   assert_eq!(rows, vec![vec![SqliteValue::Integer(1)]]);
   driver.close().await.unwrap();
}

/// Fails its first create, succeeds afterwards.
struct FlakySchema {
   attempts: AtomicUsize,
}

#[async_trait]
impl Schema for FlakySchema {
   fn version(&self) -> i64 {
      1
   }

   async fn create(&self, driver: &Executor) -> Result<()> {
      driver
         .execute(None, "CREATE TABLE users (id INTEGER PRIMARY KEY)", 0, None)
         .await?;
      if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
         return Err(Error::Other("disk hiccup".into()));
      }
      Ok(())
   }

   async fn migrate(&self, _driver: &Executor, _old: i64, _new: i64) -> Result<()> {
      Ok(())
   }
}

#[tokio::test]
async fn test_failed_initialization_retried_on_next_call() {
   let temp_dir = TempDir::new().unwrap();
   let driver = SqliteDriver::open(
      DatabaseType::File(temp_dir.path().join("test.db")),
      FlakySchema {
         attempts: AtomicUsize::new(0),
      },
      SqliteConfig::default(),
   )
   .unwrap();

   let err = driver
      .query_values(None, "SELECT * FROM users", &[])
      .await
      .unwrap_err();
   assert_eq!(err.to_string(), "disk hiccup");
   assert_eq!(user_version(&driver).await, Some(0));

   let rows = driver.query_values(None, "SELECT * FROM users", &[]).await.unwrap();
   assert!(rows.is_empty());
   assert_eq!(user_version(&driver).await, Some(1));
   driver.close().await.unwrap();
}

/// Switches the database out of WAL before the schema is created.
struct RollbackJournal(Journal);

#[async_trait]
impl DriverCallbacks for RollbackJournal {
   async fn on_configure(&self, driver: &ConfigurableDriver<'_>) -> Result<()> {
      driver.set_journal_mode(JournalMode::Delete).await?;
      let mode = driver
         .execute_pragma_query("journal_mode", |cursor| {
            cursor.next()?;
            Ok(cursor.get_text(0).unwrap_or_default())
         })
         .await?;
      self.0.record(format!("journal {mode}"));
      Ok(())
   }
}

#[tokio::test]
async fn test_configure_hook_changes_journal_mode() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let schema = ScriptedSchema::new(1, &["CREATE TABLE users (id INTEGER PRIMARY KEY)"], &journal);
   let driver = SqliteDriver::builder(DatabaseType::File(temp_dir.path().join("test.db")), schema)
      .callbacks(RollbackJournal(journal.clone()))
      .build()
      .unwrap();

   driver.query_values(None, "SELECT * FROM users", &[]).await.unwrap();

   assert_eq!(journal.events(), vec!["journal delete", "create"]);
   assert_eq!(journal.count("create"), 1);
   assert_eq!(driver.pool().settings().journal_mode, JournalMode::Delete);
   assert_eq!(driver.pool().concurrency_model().reader_count(), 0);
   driver.close().await.unwrap();
}

/// Turns foreign key enforcement on before the schema is created.
struct EnforceForeignKeys;

#[async_trait]
impl DriverCallbacks for EnforceForeignKeys {
   async fn on_configure(&self, driver: &ConfigurableDriver<'_>) -> Result<()> {
      driver.set_foreign_key_constraints_enabled(true).await
   }
}

#[tokio::test]
async fn test_foreign_keys_enabled_while_configuring_are_off_during_create() {
   let temp_dir = TempDir::new().unwrap();
   let journal = Journal::default();
   let mut script = PARENT_CHILD.to_vec();
   // Child first: only valid once the whole create has run
   script.push("INSERT INTO child (id, parent_id) VALUES (1, 1)");
   script.push("INSERT INTO parent (id) VALUES (1)");
   let schema = ScriptedSchema::new(1, &script, &journal);
   let driver = SqliteDriver::builder(DatabaseType::File(temp_dir.path().join("test.db")), schema)
      .callbacks(EnforceForeignKeys)
      .build()
      .unwrap();

   let rows = driver.query_values(None, "SELECT parent_id FROM child", &[]).await.unwrap();
   assert_eq!(rows, vec![vec![SqliteValue::Integer(1)]]);

   assert!(driver.pool().settings().foreign_keys);
   let writer = driver.pool().acquire_writer().await.unwrap();
   assert_eq!(writer.query_i64("PRAGMA foreign_keys").unwrap(), Some(1));
   drop(writer);

   let err = driver
      .execute(None, "INSERT INTO child (id, parent_id) VALUES (2, 99)", 0, None)
      .await
      .unwrap_err();
   assert!(err.to_string().contains("FOREIGN KEY constraint failed"));
   driver.close().await.unwrap();
}

fn marking_callback(version: i64, journal: &Journal) -> AfterVersion {
   let journal = journal.clone();
   AfterVersion::new(version, move |driver| {
      let journal = journal.clone();
      Box::pin(async move {
         journal.record(format!("after {version}"));
         driver
            .execute_values(None, "INSERT INTO marks (version) VALUES (?)", &[version.into()])
            .await
            .map(|_| ())
      })
   })
}

#[tokio::test]
async fn test_migration_callbacks_run_after_their_version() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("test.db");

   let journal = Journal::default();
   let v1 = ScriptedSchema::new(1, &["CREATE TABLE marks (version INTEGER NOT NULL)"], &journal);
   let driver = open_driver(&path, v1, SqliteConfig::default(), &journal);
   driver.query_values(None, "SELECT * FROM marks", &[]).await.unwrap();
   driver.close().await.unwrap();

   let journal = Journal::default();
   let v4 = ScriptedSchema::new(4, &[], &journal);
   let driver = SqliteDriver::builder(DatabaseType::File(path), v4)
      .callbacks(Recorder(journal.clone()))
      .after_version(marking_callback(2, &journal))
      .after_version(marking_callback(1, &journal))
      // Outside the 1..4 range being migrated
      .after_version(marking_callback(0, &journal))
      .after_version(marking_callback(4, &journal))
      .build()
      .unwrap();

   let rows = driver
      .query_values(None, "SELECT version FROM marks ORDER BY rowid", &[])
      .await
      .unwrap();
   assert_eq!(
      rows,
      vec![vec![SqliteValue::Integer(1)], vec![SqliteValue::Integer(2)]]
   );
   assert_eq!(
      journal.events(),
      vec![
         "configure",
         "migrate 1->2",
         "after 1",
         "migrate 2->3",
         "after 2",
         "migrate 3->4",
         "on_update 1->4",
         "on_open",
      ]
   );
   assert_eq!(user_version(&driver).await, Some(4));
   driver.close().await.unwrap();
}

#[tokio::test]
async fn test_failed_migration_callback_rolls_back_migration() {
   let temp_dir = TempDir::new().unwrap();
   let path = temp_dir.path().join("test.db");

   let journal = Journal::default();
   let v1 = ScriptedSchema::new(1, &["CREATE TABLE marks (version INTEGER NOT NULL)"], &journal);
   let driver = open_driver(&path, v1, SqliteConfig::default(), &journal);
   driver.query_values(None, "SELECT * FROM marks", &[]).await.unwrap();
   driver.close().await.unwrap();

   let journal = Journal::default();
   let v2 = ScriptedSchema::new(2, &[], &journal)
      .with_migration(&["ALTER TABLE marks ADD COLUMN note TEXT"]);
   let driver = SqliteDriver::builder(DatabaseType::File(path), v2)
      .after_version(AfterVersion::new(1, |_driver| {
         Box::pin(async { Err::<(), _>(Error::Other("backfill failed".into())) })
      }))
      .build()
      .unwrap();

   let err = driver
      .query_values(None, "SELECT * FROM marks", &[])
      .await
      .unwrap_err();
   assert_eq!(err.to_string(), "backfill failed");
   assert_eq!(journal.events(), vec!["migrate 1->2"]);
   assert_eq!(user_version(&driver).await, Some(1));

   let writer = driver.pool().acquire_writer().await.unwrap();
   let columns = writer
      .query_i64("SELECT COUNT(*) FROM pragma_table_info('marks') WHERE name = 'note'")
      .unwrap();
   assert_eq!(columns, Some(0));
   drop(writer);
   driver.close().await.unwrap();
}
