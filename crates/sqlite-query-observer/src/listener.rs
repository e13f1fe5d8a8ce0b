/// Callback told that results behind one of its keys may have changed.
///
/// Implemented for every `Fn() + Send + Sync` closure, so most callers just
/// register a closure wrapped in an `Arc`.
pub trait QueryListener: Send + Sync {
   fn query_results_changed(&self);
}

impl<F> QueryListener for F
where
   F: Fn() + Send + Sync,
{
   fn query_results_changed(&self) {
      self()
   }
}
