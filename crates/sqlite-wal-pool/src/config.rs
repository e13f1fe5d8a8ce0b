//! Configuration for SQLite connection pools

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::concurrency::ConcurrencyModel;
use crate::error::Error;

/// SQLite `journal_mode` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalMode {
   Delete,
   Truncate,
   Persist,
   Memory,
   Wal,
   Off,
}

impl JournalMode {
   pub fn as_str(&self) -> &'static str {
      match self {
         JournalMode::Delete => "DELETE",
         JournalMode::Truncate => "TRUNCATE",
         JournalMode::Persist => "PERSIST",
         JournalMode::Memory => "MEMORY",
         JournalMode::Wal => "WAL",
         JournalMode::Off => "OFF",
      }
   }
}

impl fmt::Display for JournalMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for JournalMode {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      match s.trim().to_ascii_uppercase().as_str() {
         "DELETE" => Ok(JournalMode::Delete),
         "TRUNCATE" => Ok(JournalMode::Truncate),
         "PERSIST" => Ok(JournalMode::Persist),
         "MEMORY" => Ok(JournalMode::Memory),
         "WAL" => Ok(JournalMode::Wal),
         "OFF" => Ok(JournalMode::Off),
         _ => Err(Error::UnknownJournalMode(s.to_string())),
      }
   }
}

/// SQLite `synchronous` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncMode {
   Off,
   Normal,
   Full,
   Extra,
}

impl SyncMode {
   pub fn as_str(&self) -> &'static str {
      match self {
         SyncMode::Off => "OFF",
         SyncMode::Normal => "NORMAL",
         SyncMode::Full => "FULL",
         SyncMode::Extra => "EXTRA",
      }
   }
}

impl fmt::Display for SyncMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for SyncMode {
   type Err = Error;

   fn from_str(s: &str) -> Result<Self> {
      match s.trim().to_ascii_uppercase().as_str() {
         "OFF" | "0" => Ok(SyncMode::Off),
         "NORMAL" | "1" => Ok(SyncMode::Normal),
         "FULL" | "2" => Ok(SyncMode::Full),
         "EXTRA" | "3" => Ok(SyncMode::Extra),
         _ => Err(Error::UnknownSyncMode(s.to_string())),
      }
   }
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseType {
   /// A database file, created if missing.
   File(PathBuf),
   /// A private in-memory database.
   Memory,
   /// A private on-disk temporary database, deleted when closed.
   Temporary,
}

impl DatabaseType {
   /// The name handed to the connection factory.
   pub fn name(&self) -> String {
      match self {
         DatabaseType::File(path) => path.to_string_lossy().into_owned(),
         DatabaseType::Memory => ":memory:".to_string(),
         DatabaseType::Temporary => String::new(),
      }
   }

   /// Whether a second connection would see the same data.
   ///
   /// In-memory and temporary databases are private to one connection.
   pub fn is_file_based(&self) -> bool {
      matches!(self, DatabaseType::File(_))
   }
}

/// Configuration for a SQLite driver and its connection pool
///
/// # Examples
///
/// ```
/// use sqlite_wal_pool::{JournalMode, SqliteConfig};
///
/// // Use defaults
/// let config = SqliteConfig::default();
/// assert_eq!(config.cache_size, 25);
///
/// // Override just a few fields
/// let config = SqliteConfig {
///     cache_size: 0,
///     journal_mode: JournalMode::Delete,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
   /// Prepared statements cached per connection. `0` disables caching.
   ///
   /// Default: 25
   pub cache_size: usize,

   /// Whether `PRAGMA foreign_keys` is on for every connection.
   ///
   /// Default: false
   pub foreign_key_constraints_enabled: bool,

   /// Run `PRAGMA foreign_key_check` after schema creation or migration.
   ///
   /// Default: true
   pub foreign_key_constraints_checked_after_create_or_update: bool,

   /// Cap on the violations collected by the post-migration check.
   ///
   /// Default: 100
   pub max_foreign_key_violations_reported: usize,

   /// Journal mode applied to each connection when it is opened.
   ///
   /// Default: WAL
   pub journal_mode: JournalMode,

   /// `None` picks NORMAL under WAL and FULL otherwise.
   ///
   /// Default: None
   pub sync_mode: Option<SyncMode>,

   /// Reader/writer policy. Non-file databases always use
   /// [`ConcurrencyModel::SingleReaderWriter`].
   ///
   /// Default: multiple readers with a single writer, 4 readers under WAL
   pub concurrency_model: ConcurrencyModel,

   /// Run migrations instead of create when the stored version is 0.
   ///
   /// Default: false
   pub migrate_empty_schema: bool,

   /// How long a reader request waits for a free reader before it falls
   /// back to the writer connection.
   ///
   /// Default: 100
   pub reader_fallback_timeout_ms: u64,
}

impl SqliteConfig {
   /// The effective synchronous mode.
   pub fn sync_mode(&self) -> SyncMode {
      match self.sync_mode {
         Some(mode) => mode,
         None if self.journal_mode == JournalMode::Wal => SyncMode::Normal,
         None => SyncMode::Full,
      }
   }

   pub fn reader_fallback_timeout(&self) -> Duration {
      Duration::from_millis(self.reader_fallback_timeout_ms)
   }

   /// Rejects values that cannot produce a working pool.
   pub fn validate(&self) -> Result<()> {
      self.concurrency_model.validate()?;
      if self.foreign_key_constraints_checked_after_create_or_update
         && self.max_foreign_key_violations_reported == 0
      {
         return Err(Error::InvalidConfig(
            "max_foreign_key_violations_reported must be at least 1".to_string(),
         ));
      }
      Ok(())
   }
}

impl Default for SqliteConfig {
   fn default() -> Self {
      Self {
         cache_size: 25,
         foreign_key_constraints_enabled: false,
         foreign_key_constraints_checked_after_create_or_update: true,
         max_foreign_key_violations_reported: 100,
         journal_mode: JournalMode::Wal,
         sync_mode: None,
         concurrency_model: ConcurrencyModel::default(),
         migrate_empty_schema: false,
         reader_fallback_timeout_ms: 100,
      }
   }
}
