use std::time::Instant;

/// Notification that data behind one or more keys changed.
#[derive(Debug, Clone)]
pub struct QueryChange {
   /// Keys passed to [`crate::QueryObserver::notify_listeners`], in call order.
   pub keys: Vec<String>,
   pub timestamp: Instant,
}

impl QueryChange {
   pub fn new(keys: Vec<String>) -> Self {
      Self {
         keys,
         timestamp: Instant::now(),
      }
   }
}
