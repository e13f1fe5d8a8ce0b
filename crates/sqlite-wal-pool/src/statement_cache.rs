//! Per-connection LRU cache of prepared statements
//!
//! Entries are checked out rather than borrowed: [`StatementCache::get`] removes
//! the statement, and the caller puts it back when done. Two in-flight calls can
//! therefore never share one prepared statement. Every statement leaving the
//! cache other than through `get` (replaced, evicted, or flushed) is closed.

use std::collections::HashMap;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::connection::ConnectionId;
use crate::statement::Statement;

/// A statement the cache can close when it drops it.
pub trait CachedStatement: Send {
   fn close(self);
}

impl CachedStatement for Statement {
   fn close(self) {
      Statement::close(self)
   }
}

/// Statement cache shared by every connection of a pool.
///
/// One coarse lock guards the caches of all connections.
pub struct StatementCache<S: CachedStatement = Statement> {
   capacity: Option<NonZeroUsize>,
   caches: Mutex<HashMap<ConnectionId, LruCache<i32, S>>>,
}

impl<S: CachedStatement> StatementCache<S> {
   /// A cache holding up to `capacity` statements per connection; `0` disables it.
   pub fn new(capacity: usize) -> Self {
      Self {
         capacity: NonZeroUsize::new(capacity),
         caches: Mutex::new(HashMap::new()),
      }
   }

   pub fn is_enabled(&self) -> bool {
      self.capacity.is_some()
   }

   /// Checks out the statement cached under `id` for `connection`.
   pub fn get(&self, connection: ConnectionId, id: i32) -> Option<S> {
      let statement = self
         .caches
         .lock()
         .get_mut(&connection)
         .and_then(|cache| cache.pop(&id));
      trace!(
         connection = %connection,
         id,
         hit = statement.is_some(),
         "Statement cache lookup"
      );
      statement
   }

   /// Returns a statement to the cache.
   ///
   /// A statement already cached under the same id (two calls raced on it) is
   /// closed and replaced; the least recently used entry is closed when the
   /// connection's cache is full. With caching disabled the statement is closed.
   pub fn put(&self, connection: ConnectionId, id: i32, statement: S) {
      let Some(capacity) = self.capacity else {
         statement.close();
         return;
      };

      let displaced = self
         .caches
         .lock()
         .entry(connection)
         .or_insert_with(|| LruCache::new(capacity))
         .push(id, statement);

      // Closed outside the lock
      if let Some((displaced_id, displaced)) = displaced {
         trace!(connection = %connection, id = displaced_id, "Closing displaced statement");
         displaced.close();
      }
   }

   /// Closes every statement cached for `connection`.
   ///
   /// Must run before the connection itself is closed.
   pub fn close_connection(&self, connection: ConnectionId) {
      let cache = self.caches.lock().remove(&connection);
      if let Some(mut cache) = cache {
         while let Some((_, statement)) = cache.pop_lru() {
            statement.close();
         }
      }
   }

   /// Closes every cached statement of every connection.
   pub fn close_all(&self) {
      let caches = std::mem::take(&mut *self.caches.lock());
      for (_, mut cache) in caches {
         while let Some((_, statement)) = cache.pop_lru() {
            statement.close();
         }
      }
   }

   /// Statements currently cached for `connection`.
   pub fn len(&self, connection: ConnectionId) -> usize {
      self.caches.lock().get(&connection).map_or(0, LruCache::len)
   }
}

impl<S: CachedStatement> Drop for StatementCache<S> {
   fn drop(&mut self) {
      self.close_all();
   }
}

#[cfg(test)]
mod tests {
   use std::sync::Arc;
   use std::sync::atomic::{AtomicUsize, Ordering};

   use super::*;

   struct FakeStatement {
      serial: usize,
      closed: Arc<AtomicUsize>,
   }

   impl CachedStatement for FakeStatement {
      fn close(self) {
         self.closed.fetch_add(1, Ordering::SeqCst);
      }
   }

   fn statements(count: usize) -> (Vec<FakeStatement>, Arc<AtomicUsize>) {
      let closed = Arc::new(AtomicUsize::new(0));
      let made = (0..count)
         .map(|serial| FakeStatement {
            serial,
            closed: Arc::clone(&closed),
         })
         .collect();
      (made, closed)
   }

   fn conn(n: u64) -> ConnectionId {
      ConnectionId::for_tests(n)
   }

   #[test]
   fn test_put_then_get_returns_same_statement() {
      let cache = StatementCache::new(2);
      let (mut made, closed) = statements(1);
      cache.put(conn(1), 7, made.remove(0));

      let statement = cache.get(conn(1), 7).unwrap();
      assert_eq!(statement.serial, 0);
      assert_eq!(closed.load(Ordering::SeqCst), 0);

      // Checked out: a second lookup misses
      assert!(cache.get(conn(1), 7).is_none());
   }

   #[test]
   fn test_eviction_closes_least_recently_used() {
      let cache = StatementCache::new(1);
      let (mut made, closed) = statements(2);
      let second = made.pop().unwrap();
      let first = made.pop().unwrap();

      cache.put(conn(1), 2, first);
      cache.put(conn(1), 3, second);

      assert_eq!(closed.load(Ordering::SeqCst), 1);
      assert!(cache.get(conn(1), 2).is_none());
      assert_eq!(cache.get(conn(1), 3).unwrap().serial, 1);
   }

   #[test]
   fn test_duplicate_put_closes_previous() {
      let cache = StatementCache::new(4);
      let (mut made, closed) = statements(2);
      let second = made.pop().unwrap();
      let first = made.pop().unwrap();

      cache.put(conn(1), 5, first);
      cache.put(conn(1), 5, second);

      assert_eq!(closed.load(Ordering::SeqCst), 1);
      assert_eq!(cache.get(conn(1), 5).unwrap().serial, 1);
   }

   #[test]
   fn test_connections_have_separate_caches() {
      let cache = StatementCache::new(1);
      let (mut made, closed) = statements(2);
      let second = made.pop().unwrap();
      let first = made.pop().unwrap();

      cache.put(conn(1), 1, first);
      cache.put(conn(2), 1, second);

      assert_eq!(closed.load(Ordering::SeqCst), 0);
      assert_eq!(cache.get(conn(1), 1).unwrap().serial, 0);
      assert_eq!(cache.get(conn(2), 1).unwrap().serial, 1);
   }

   #[test]
   fn test_disabled_cache_closes_immediately() {
      let cache = StatementCache::new(0);
      let (mut made, closed) = statements(1);
      assert!(!cache.is_enabled());

      cache.put(conn(1), 1, made.remove(0));
      assert_eq!(closed.load(Ordering::SeqCst), 1);
      assert!(cache.get(conn(1), 1).is_none());
   }

   #[test]
   fn test_close_connection_and_close_all() {
      let cache = StatementCache::new(4);
      let (made, closed) = statements(4);
      for (i, statement) in made.into_iter().enumerate() {
         cache.put(conn(1 + (i as u64 % 2)), i as i32, statement);
      }

      cache.close_connection(conn(1));
      assert_eq!(closed.load(Ordering::SeqCst), 2);
      assert_eq!(cache.len(conn(1)), 0);
      assert_eq!(cache.len(conn(2)), 2);

      cache.close_all();
      assert_eq!(closed.load(Ordering::SeqCst), 4);
   }

   #[test]
   fn test_drop_closes_remaining() {
      let (mut made, closed) = statements(1);
      {
         let cache = StatementCache::new(4);
         cache.put(conn(1), 1, made.remove(0));
      }
      assert_eq!(closed.load(Ordering::SeqCst), 1);
   }
}
