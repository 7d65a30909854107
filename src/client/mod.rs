//! Client handle, builder, lifecycle and event dispatch
//!
//! # Architecture
//!
//! - [`builder`] - chained configuration setters and the consuming `build()`
//! - [`state`] - pure lifecycle transitions and reconnect policy
//! - [`callback`] - user notification hooks
//! - [`handle`] - the `Client` operations
//! - `dispatcher` - per-client tasks that write requests and deliver events
//!
//! Each client owns two bounded queues: outbound requests drained in order by
//! a writer task, and inbound events drained by a dispatcher task that runs
//! every callback for that client.

pub mod builder;
pub mod callback;
mod dispatcher;
pub mod handle;
pub mod state;

pub use builder::ClientBuilder;
pub use callback::{Callback, TopicHandler};
pub use handle::Client;
pub use state::{ConnectionState, ReconnectConfig};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock ignoring poisoning; no critical section here leaves data half-written
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
