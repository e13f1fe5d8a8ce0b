//! Listener registry keyed by query or table name.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use crate::change::QueryChange;
use crate::listener::QueryListener;
use crate::stream::QueryChangeStream;

/// Capacity of the broadcast channel behind [`QueryObserver::subscribe`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Registry of query listeners plus a broadcast channel of changes.
///
/// A listener registered under several keys runs once per notification even
/// when more than one of its keys changed. Listeners are invoked outside the
/// registry lock, so a listener may add or remove listeners itself.
pub struct QueryObserver {
   listeners: Mutex<IndexMap<String, Vec<Arc<dyn QueryListener>>>>,
   change_tx: broadcast::Sender<QueryChange>,
}

impl QueryObserver {
   pub fn new(channel_capacity: usize) -> Self {
      let (change_tx, _) = broadcast::channel(channel_capacity.max(1));
      Self {
         listeners: Mutex::new(IndexMap::new()),
         change_tx,
      }
   }

   /// Registers `listener` under every key. Registering the same listener
   /// twice under one key has no effect.
   pub fn add_listener<I, S>(&self, keys: I, listener: Arc<dyn QueryListener>)
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      let mut listeners = self.listeners.lock();
      for key in keys {
         let key = key.into();
         let registered = listeners.entry(key.clone()).or_default();
         if !registered.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            trace!(key = %key, "Query listener added");
            registered.push(Arc::clone(&listener));
         }
      }
   }

   /// Removes `listener` from every key. Keys left without listeners are dropped.
   pub fn remove_listener<I, S>(&self, keys: I, listener: &Arc<dyn QueryListener>)
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      let mut listeners = self.listeners.lock();
      for key in keys {
         let key = key.as_ref();
         if let Some(registered) = listeners.get_mut(key) {
            registered.retain(|l| !Arc::ptr_eq(l, listener));
            if registered.is_empty() {
               listeners.shift_remove(key);
            }
         }
      }
   }

   /// Runs every listener registered under any of `keys`, then broadcasts
   /// the change to subscribers.
   pub fn notify_listeners<I, S>(&self, keys: I)
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      let keys: Vec<String> = keys.into_iter().map(Into::into).collect();

      let to_notify = {
         let listeners = self.listeners.lock();
         let mut to_notify: Vec<Arc<dyn QueryListener>> = Vec::new();
         for key in &keys {
            for listener in listeners.get(key).into_iter().flatten() {
               if !to_notify.iter().any(|l| Arc::ptr_eq(l, listener)) {
                  to_notify.push(Arc::clone(listener));
               }
            }
         }
         to_notify
      };

      trace!(keys = ?keys, listeners = to_notify.len(), "Notifying query listeners");
      for listener in to_notify {
         listener.query_results_changed();
      }

      // No receivers is not an error
      let _ = self.change_tx.send(QueryChange::new(keys));
   }

   /// Number of listeners registered under `key`.
   pub fn listener_count(&self, key: &str) -> usize {
      self.listeners.lock().get(key).map_or(0, Vec::len)
   }

   /// Keys that currently have listeners, in registration order.
   pub fn keys(&self) -> Vec<String> {
      self.listeners.lock().keys().cloned().collect()
   }

   /// Subscribes to changes as a `Stream`.
   ///
   /// With no keys the stream yields every change; otherwise only changes
   /// naming at least one of `keys`.
   pub fn subscribe<I, S>(&self, keys: I) -> QueryChangeStream
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      let keys = keys.into_iter().map(Into::into).collect();
      QueryChangeStream::new(self.change_tx.subscribe(), keys)
   }
}

impl Default for QueryObserver {
   fn default() -> Self {
      Self::new(DEFAULT_CHANNEL_CAPACITY)
   }
}
