//! Roster store: the [`Pool`], a concurrent in-RAM registry of manifests keyed
//! by apiVersion/kind/name, with fire-and-forget observer notification.
//!
//! Every apply or delete stores the change first and then dispatches one
//! blocking task per registered observer on the pool's tokio runtime. Callers
//! never wait for observers; [`Pool::wait`] and [`Pool::settled`] are the
//! completion barrier. Like a wait group they release waiters as soon as the
//! in-flight count has drained to zero once, even if new notifications start
//! right after. Observers cannot be cancelled or timed out.

#![forbid(unsafe_code)]

mod inflight;
mod pool;

pub use pool::{Observer, ObserverId, Payload, Pool, PoolError};
