//! Prepared statements on a raw SQLite handle

use std::ffi::{CStr, c_int, c_void};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use libsqlite3_sys::{
   SQLITE_BLOB, SQLITE_DONE, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_NULL, SQLITE_OK, SQLITE_ROW,
   SQLITE_TEXT, SQLITE_TRANSIENT, sqlite3, sqlite3_bind_blob, sqlite3_bind_double,
   sqlite3_bind_int64, sqlite3_bind_null, sqlite3_bind_parameter_count, sqlite3_bind_text,
   sqlite3_clear_bindings, sqlite3_column_blob, sqlite3_column_bytes, sqlite3_column_count,
   sqlite3_column_double, sqlite3_column_int64, sqlite3_column_name, sqlite3_column_text,
   sqlite3_column_type, sqlite3_db_handle, sqlite3_errmsg, sqlite3_extended_errcode,
   sqlite3_finalize, sqlite3_reset, sqlite3_step, sqlite3_stmt,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::Result;
use crate::error::Error;

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one prepared statement instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementId(u64);

impl fmt::Display for StatementId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "stmt-{}", self.0)
   }
}

/// A value bound to, or read from, a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqliteValue {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl From<i64> for SqliteValue {
   fn from(value: i64) -> Self {
      SqliteValue::Integer(value)
   }
}

impl From<f64> for SqliteValue {
   fn from(value: f64) -> Self {
      SqliteValue::Real(value)
   }
}

impl From<bool> for SqliteValue {
   fn from(value: bool) -> Self {
      SqliteValue::Integer(value as i64)
   }
}

impl From<&str> for SqliteValue {
   fn from(value: &str) -> Self {
      SqliteValue::Text(value.to_string())
   }
}

impl From<String> for SqliteValue {
   fn from(value: String) -> Self {
      SqliteValue::Text(value)
   }
}

impl From<Vec<u8>> for SqliteValue {
   fn from(value: Vec<u8>) -> Self {
      SqliteValue::Blob(value)
   }
}

impl<T: Into<SqliteValue>> From<Option<T>> for SqliteValue {
   fn from(value: Option<T>) -> Self {
      value.map_or(SqliteValue::Null, Into::into)
   }
}

/// Builds an [`Error::Sqlite`] from the connection's last error.
///
/// # Safety
///
/// `db` must be a valid, open connection handle.
pub(crate) unsafe fn last_error(db: *mut sqlite3) -> Error {
   // SAFETY: the caller guarantees db is open; sqlite3_errmsg never returns null
   // for an open handle and the string stays valid until the next API call.
   unsafe {
      let code = sqlite3_extended_errcode(db);
      let message = CStr::from_ptr(sqlite3_errmsg(db))
         .to_string_lossy()
         .into_owned();
      Error::Sqlite { code, message }
   }
}

/// A prepared statement.
///
/// Bind indexes and column indexes are 0-based. The statement is finalized
/// when closed or dropped, and must not outlive the connection that prepared it;
/// the statement cache closes a connection's statements before the pool closes
/// the connection.
pub struct Statement {
   id: StatementId,
   raw: NonNull<sqlite3_stmt>,
   parameter_count: usize,
}

// SAFETY: a Statement is exclusively owned (checked out of the cache or held by a
// single call), and connections are opened in serialized mode, so the handle can
// move between threads between uses.
unsafe impl Send for Statement {}

impl fmt::Debug for Statement {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Statement")
         .field("id", &self.id)
         .field("parameter_count", &self.parameter_count)
         .finish()
   }
}

impl Statement {
   /// Takes ownership of a freshly prepared handle.
   ///
   /// # Safety
   ///
   /// `raw` must come from `sqlite3_prepare_v2` and not be finalized elsewhere.
   pub(crate) unsafe fn from_raw(raw: NonNull<sqlite3_stmt>) -> Self {
      // SAFETY: raw is a valid prepared statement per the caller contract.
      let parameter_count = unsafe { sqlite3_bind_parameter_count(raw.as_ptr()) }.max(0) as usize;
      Self {
         id: StatementId(NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed)),
         raw,
         parameter_count,
      }
   }

   pub fn id(&self) -> StatementId {
      self.id
   }

   /// Number of bind sites in the SQL text.
   pub fn parameter_count(&self) -> usize {
      self.parameter_count
   }

   fn error(&self) -> Error {
      // SAFETY: the statement is live, so its connection is open.
      unsafe { last_error(sqlite3_db_handle(self.raw.as_ptr())) }
   }

   fn check(&self, rc: c_int) -> Result<()> {
      if rc == SQLITE_OK {
         Ok(())
      } else {
         Err(self.error())
      }
   }

   fn bind_site(&self, index: usize) -> Result<c_int> {
      if index >= self.parameter_count {
         return Err(Error::BindIndexOutOfRange {
            index,
            count: self.parameter_count,
         });
      }
      Ok(index as c_int + 1)
   }

   pub fn bind_null(&mut self, index: usize) -> Result<()> {
      let site = self.bind_site(index)?;
      // SAFETY: raw is live and site is within 1..=parameter_count.
      let rc = unsafe { sqlite3_bind_null(self.raw.as_ptr(), site) };
      self.check(rc)
   }

   pub fn bind_i64(&mut self, index: usize, value: Option<i64>) -> Result<()> {
      let Some(value) = value else {
         return self.bind_null(index);
      };
      let site = self.bind_site(index)?;
      // SAFETY: raw is live and site is within range.
      let rc = unsafe { sqlite3_bind_int64(self.raw.as_ptr(), site, value) };
      self.check(rc)
   }

   pub fn bind_f64(&mut self, index: usize, value: Option<f64>) -> Result<()> {
      let Some(value) = value else {
         return self.bind_null(index);
      };
      let site = self.bind_site(index)?;
      // SAFETY: raw is live and site is within range.
      let rc = unsafe { sqlite3_bind_double(self.raw.as_ptr(), site, value) };
      self.check(rc)
   }

   pub fn bind_bool(&mut self, index: usize, value: Option<bool>) -> Result<()> {
      self.bind_i64(index, value.map(i64::from))
   }

   pub fn bind_text(&mut self, index: usize, value: Option<&str>) -> Result<()> {
      let Some(value) = value else {
         return self.bind_null(index);
      };
      let site = self.bind_site(index)?;
      // SAFETY: SQLITE_TRANSIENT makes SQLite copy the bytes before returning,
      // so the borrow only has to last for the call.
      let rc = unsafe {
         sqlite3_bind_text(
            self.raw.as_ptr(),
            site,
            value.as_ptr().cast(),
            value.len() as c_int,
            SQLITE_TRANSIENT(),
         )
      };
      self.check(rc)
   }

   pub fn bind_blob(&mut self, index: usize, value: Option<&[u8]>) -> Result<()> {
      let Some(value) = value else {
         return self.bind_null(index);
      };
      let site = self.bind_site(index)?;
      // SAFETY: SQLITE_TRANSIENT copies the bytes before returning.
      let rc = unsafe {
         sqlite3_bind_blob(
            self.raw.as_ptr(),
            site,
            value.as_ptr() as *const c_void,
            value.len() as c_int,
            SQLITE_TRANSIENT(),
         )
      };
      self.check(rc)
   }

   pub fn bind_value(&mut self, index: usize, value: &SqliteValue) -> Result<()> {
      match value {
         SqliteValue::Null => self.bind_null(index),
         SqliteValue::Integer(v) => self.bind_i64(index, Some(*v)),
         SqliteValue::Real(v) => self.bind_f64(index, Some(*v)),
         SqliteValue::Text(v) => self.bind_text(index, Some(v)),
         SqliteValue::Blob(v) => self.bind_blob(index, Some(v)),
      }
   }

   /// Binds `values` to the leading bind sites in order.
   pub fn bind_all(&mut self, values: &[SqliteValue]) -> Result<()> {
      for (index, value) in values.iter().enumerate() {
         self.bind_value(index, value)?;
      }
      Ok(())
   }

   /// Advances to the next row. Returns `false` once the statement is done.
   pub fn step(&mut self) -> Result<bool> {
      // SAFETY: raw is live and exclusively borrowed.
      match unsafe { sqlite3_step(self.raw.as_ptr()) } {
         SQLITE_ROW => Ok(true),
         SQLITE_DONE => Ok(false),
         _ => Err(self.error()),
      }
   }

   /// Steps until the statement is done, discarding any rows.
   pub fn run(&mut self) -> Result<()> {
      while self.step()? {}
      Ok(())
   }

   /// Rewinds the statement so it can be stepped again. Bindings are kept.
   pub fn reset(&mut self) -> Result<()> {
      // SAFETY: raw is live.
      let rc = unsafe { sqlite3_reset(self.raw.as_ptr()) };
      self.check(rc)
   }

   pub fn clear_bindings(&mut self) -> Result<()> {
      // SAFETY: raw is live.
      let rc = unsafe { sqlite3_clear_bindings(self.raw.as_ptr()) };
      self.check(rc)
   }

   pub fn column_count(&self) -> usize {
      // SAFETY: raw is live.
      unsafe { sqlite3_column_count(self.raw.as_ptr()) }.max(0) as usize
   }

   pub fn column_name(&self, index: usize) -> Option<String> {
      if index >= self.column_count() {
         return None;
      }
      // SAFETY: index is in range; the returned pointer is valid until the
      // statement is finalized or re-prepared, and we copy it immediately.
      let name = unsafe { sqlite3_column_name(self.raw.as_ptr(), index as c_int) };
      if name.is_null() {
         return None;
      }
      Some(
         unsafe { CStr::from_ptr(name) }
            .to_string_lossy()
            .into_owned(),
      )
   }

   fn column_type(&self, index: usize) -> c_int {
      // SAFETY: raw is live; out-of-range columns report SQLITE_NULL.
      unsafe { sqlite3_column_type(self.raw.as_ptr(), index as c_int) }
   }

   pub fn is_null(&self, index: usize) -> bool {
      self.column_type(index) == SQLITE_NULL
   }

   pub fn get_i64(&self, index: usize) -> Option<i64> {
      if self.is_null(index) {
         return None;
      }
      // SAFETY: raw is live and positioned on a row.
      Some(unsafe { sqlite3_column_int64(self.raw.as_ptr(), index as c_int) })
   }

   pub fn get_f64(&self, index: usize) -> Option<f64> {
      if self.is_null(index) {
         return None;
      }
      // SAFETY: raw is live and positioned on a row.
      Some(unsafe { sqlite3_column_double(self.raw.as_ptr(), index as c_int) })
   }

   pub fn get_bool(&self, index: usize) -> Option<bool> {
      self.get_i64(index).map(|v| v != 0)
   }

   pub fn get_text(&self, index: usize) -> Option<String> {
      if self.is_null(index) {
         return None;
      }
      // SAFETY: sqlite3_column_text is called before sqlite3_column_bytes as SQLite
      // requires; the buffer stays valid until the next step/reset and is copied here.
      unsafe {
         let text = sqlite3_column_text(self.raw.as_ptr(), index as c_int);
         let len = sqlite3_column_bytes(self.raw.as_ptr(), index as c_int).max(0) as usize;
         if text.is_null() {
            return Some(String::new());
         }
         let bytes = std::slice::from_raw_parts(text, len);
         Some(String::from_utf8_lossy(bytes).into_owned())
      }
   }

   pub fn get_blob(&self, index: usize) -> Option<Vec<u8>> {
      if self.is_null(index) {
         return None;
      }
      // SAFETY: as for get_text, blob before bytes, copied before the next step.
      unsafe {
         let blob = sqlite3_column_blob(self.raw.as_ptr(), index as c_int);
         let len = sqlite3_column_bytes(self.raw.as_ptr(), index as c_int).max(0) as usize;
         if blob.is_null() || len == 0 {
            return Some(Vec::new());
         }
         Some(std::slice::from_raw_parts(blob as *const u8, len).to_vec())
      }
   }

   pub fn get_value(&self, index: usize) -> SqliteValue {
      match self.column_type(index) {
         SQLITE_INTEGER => self.get_i64(index).map_or(SqliteValue::Null, SqliteValue::Integer),
         SQLITE_FLOAT => self.get_f64(index).map_or(SqliteValue::Null, SqliteValue::Real),
         SQLITE_TEXT => self.get_text(index).map_or(SqliteValue::Null, SqliteValue::Text),
         SQLITE_BLOB => self.get_blob(index).map_or(SqliteValue::Null, SqliteValue::Blob),
         _ => SqliteValue::Null,
      }
   }

   /// Finalizes the statement.
   pub fn close(self) {
      // Drop finalizes
   }
}

impl Drop for Statement {
   fn drop(&mut self) {
      // SAFETY: raw is owned by this Statement and finalized exactly once here.
      // The return code repeats the last step error, which was already reported.
      unsafe {
         sqlite3_finalize(self.raw.as_ptr());
      }
      trace!(statement = %self.id, "Statement finalized");
   }
}

/// Row cursor over a statement being queried.
///
/// A capturing cursor records the text of the first row's first column as it
/// is stepped onto; the pool uses it to learn the journal mode SQLite reports.
pub struct Cursor<'a> {
   statement: &'a mut Statement,
   capture: Option<Option<String>>,
   stepped: bool,
}

impl<'a> Cursor<'a> {
   pub fn new(statement: &'a mut Statement) -> Self {
      Self {
         statement,
         capture: None,
         stepped: false,
      }
   }

   pub fn capturing(statement: &'a mut Statement) -> Self {
      Self {
         statement,
         capture: Some(None),
         stepped: false,
      }
   }

   /// Moves to the next row, returning `false` when there are no more rows.
   pub fn next(&mut self) -> Result<bool> {
      self.stepped = true;
      let has_row = self.statement.step()?;
      if has_row
         && let Some(captured) = self.capture.as_mut()
         && captured.is_none()
      {
         *captured = Some(self.statement.get_text(0).unwrap_or_default());
      }
      Ok(has_row)
   }

   /// Text captured from the first row, when capturing and a row was reached.
   pub fn captured(&self) -> Option<&str> {
      self.capture.as_ref().and_then(|c| c.as_deref())
   }

   /// Whether the statement has been stepped through this cursor.
   pub fn has_stepped(&self) -> bool {
      self.stepped
   }

   /// Consumes the cursor, stepping onto the first row when nothing stepped
   /// it yet, and returns the captured text.
   ///
   /// A statement that was never stepped never ran, so this is what makes an
   /// unread `PRAGMA journal_mode = ...` take effect.
   pub fn finish(mut self) -> Result<Option<String>> {
      if !self.stepped {
         self.next()?;
      }
      Ok(self.capture.flatten())
   }

   pub fn column_count(&self) -> usize {
      self.statement.column_count()
   }

   pub fn column_name(&self, index: usize) -> Option<String> {
      self.statement.column_name(index)
   }

   pub fn is_null(&self, index: usize) -> bool {
      self.statement.is_null(index)
   }

   pub fn get_i64(&self, index: usize) -> Option<i64> {
      self.statement.get_i64(index)
   }

   pub fn get_f64(&self, index: usize) -> Option<f64> {
      self.statement.get_f64(index)
   }

   pub fn get_bool(&self, index: usize) -> Option<bool> {
      self.statement.get_bool(index)
   }

   pub fn get_text(&self, index: usize) -> Option<String> {
      self.statement.get_text(index)
   }

   pub fn get_blob(&self, index: usize) -> Option<Vec<u8>> {
      self.statement.get_blob(index)
   }

   pub fn get_value(&self, index: usize) -> SqliteValue {
      self.statement.get_value(index)
   }

   /// Every column of the current row.
   pub fn row(&self) -> Vec<SqliteValue> {
      (0..self.column_count()).map(|i| self.get_value(i)).collect()
   }

   /// Identity of the underlying prepared statement.
   pub fn statement_id(&self) -> StatementId {
      self.statement.id()
   }
}
