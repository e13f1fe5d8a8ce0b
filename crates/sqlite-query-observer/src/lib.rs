//! Query listener registry for SQLite drivers.
//!
//! Listeners register under logical keys (table or query names). When a
//! driver reports that data behind some keys changed, every listener
//! registered under any of them runs once, and the change is also broadcast
//! to [`QueryChangeStream`] subscribers.
//!
//! The registry is purely advisory: nothing here is consulted for
//! correctness, and a notification never blocks on a slow subscriber.

pub mod change;
pub mod listener;
pub mod observer;
pub mod stream;

pub use change::QueryChange;
pub use listener::QueryListener;
pub use observer::{DEFAULT_CHANNEL_CAPACITY, QueryObserver};
pub use stream::QueryChangeStream;
