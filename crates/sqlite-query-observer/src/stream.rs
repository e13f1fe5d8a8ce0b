use std::collections::HashSet;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::change::QueryChange;

/// Changes reported to a [`crate::QueryObserver`], as a `Stream`.
///
/// A stream subscribed with keys only yields changes naming one of them. A
/// subscriber that falls behind the channel skips what it missed and keeps
/// going; [`Self::missed`] counts the skipped changes.
pub struct QueryChangeStream {
   changes: BroadcastStream<QueryChange>,
   // Empty means every change
   keys: HashSet<String>,
   missed: u64,
}

impl QueryChangeStream {
   pub(crate) fn new(rx: broadcast::Receiver<QueryChange>, keys: HashSet<String>) -> Self {
      Self {
         changes: BroadcastStream::new(rx),
         keys,
         missed: 0,
      }
   }

   /// Changes dropped because this subscriber fell behind, whether or not
   /// they named one of its keys.
   pub fn missed(&self) -> u64 {
      self.missed
   }

   fn wants(&self, change: &QueryChange) -> bool {
      self.keys.is_empty() || change.keys.iter().any(|key| self.keys.contains(key))
   }
}

impl Stream for QueryChangeStream {
   type Item = QueryChange;

   fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let this = self.get_mut();
      loop {
         match ready!(Pin::new(&mut this.changes).poll_next(cx)) {
            Some(Ok(change)) if this.wants(&change) => return Poll::Ready(Some(change)),
            Some(Ok(_)) => {}
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
               this.missed += skipped;
               warn!(skipped, "Query change subscriber fell behind");
            }
            None => return Poll::Ready(None),
         }
      }
   }
}
