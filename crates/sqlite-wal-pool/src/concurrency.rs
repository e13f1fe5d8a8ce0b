//! Concurrency policies for a pool of SQLite connections

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;

/// How many reader connections a pool keeps next to its writer.
///
/// Values are immutable. A journal mode change produces a new model through
/// [`ConcurrencyModel::with_wal`] and the pool swaps it in as a whole, so code
/// holding an older copy never sees its reader count move underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConcurrencyModel {
   /// Everything is serialized through the writer connection.
   SingleReaderWriter,

   /// A read-only pool of `reader_count` connections.
   MultipleReaders { reader_count: usize },

   /// One writer plus readers whose count depends on whether WAL is active.
   MultipleReadersSingleWriter {
      is_wal: bool,
      wal_count: usize,
      non_wal_count: usize,
   },
}

impl ConcurrencyModel {
   /// Number of reader connections. Zero means readers fall back to the writer.
   pub fn reader_count(&self) -> usize {
      match *self {
         ConcurrencyModel::SingleReaderWriter => 0,
         ConcurrencyModel::MultipleReaders { reader_count } => reader_count,
         ConcurrencyModel::MultipleReadersSingleWriter {
            is_wal,
            wal_count,
            non_wal_count,
         } => {
            if is_wal {
               wal_count
            } else {
               non_wal_count
            }
         }
      }
   }

   /// Size of an execution context bound to this model, writer slot included.
   pub fn execution_context_size(&self) -> usize {
      self.reader_count() + 1
   }

   /// Returns a copy with the WAL flag replaced.
   ///
   /// Only [`ConcurrencyModel::MultipleReadersSingleWriter`] depends on the
   /// journal mode; the other variants are returned unchanged.
   #[must_use]
   pub fn with_wal(self, wal: bool) -> Self {
      match self {
         ConcurrencyModel::MultipleReadersSingleWriter {
            wal_count,
            non_wal_count,
            ..
         } => ConcurrencyModel::MultipleReadersSingleWriter {
            is_wal: wal,
            wal_count,
            non_wal_count,
         },
         other => other,
      }
   }

   pub fn validate(&self) -> Result<()> {
      match *self {
         ConcurrencyModel::MultipleReaders { reader_count: 0 } => Err(Error::InvalidConfig(
            "MultipleReaders requires a reader count of at least 1".to_string(),
         )),
         _ => Ok(()),
      }
   }
}

impl Default for ConcurrencyModel {
   fn default() -> Self {
      ConcurrencyModel::MultipleReadersSingleWriter {
         is_wal: true,
         wal_count: 4,
         non_wal_count: 0,
      }
   }
}
