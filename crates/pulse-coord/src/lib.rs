//! # pulse-coord
//!
//! Coordination primitives used alongside stream connections.
//!
//! - [`CoordinationLock`]: keyed mutual exclusion with stale-entry recovery
//!   ([`CoordinationLock::with_lock`], [`CoordinationLock::try_acquire`]) and
//!   in-flight request sharing ([`CoordinationLock::dedupe`])
//! - [`Throttled`]: at most one invocation per window, leading and/or trailing
//! - [`Debounced`]: invoke after a quiet period, bounded by an optional `max_wait`
//!
//! All timing uses `tokio::time`, so tests can run on a paused clock.
//! Rate-shaped handles spawn their timers on the current Tokio runtime and
//! must be called from within one.

#![deny(unsafe_code)]

mod dedupe;
mod lock;
mod timer;

pub mod debounce;
pub mod throttle;

pub use debounce::{DebounceOptions, Debounced};
pub use lock::{ConflictCallback, CoordinationLock, LockGuard, LockOptions};
pub use throttle::{ThrottleOptions, Throttled};
