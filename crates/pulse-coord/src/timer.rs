//! Single-shot timer slot shared by the rate shapers.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

/// A cancellable one-shot timer.
///
/// Each schedule gets a generation number. A firing whose generation no
/// longer matches was cancelled or superseded and must be ignored.
#[derive(Default)]
pub(crate) struct Timer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl Timer {
    /// Schedule `on_fire(owner, generation)` after `delay`, replacing any pending timer.
    ///
    /// The task holds only a weak reference, so dropping the owner cancels
    /// the effect of the timer.
    pub(crate) fn schedule<T, F>(&mut self, owner: &Arc<T>, delay: Duration, on_fire: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>, u64) + Send + 'static,
    {
        self.clear();
        let generation = self.generation;
        let owner: Weak<T> = Arc::downgrade(owner);
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(owner) = owner.upgrade() {
                on_fire(owner, generation);
            }
        }));
    }

    /// Cancel the pending timer, if any.
    pub(crate) fn clear(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether a timer is pending.
    pub(crate) fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    /// Claim a firing. Returns `false` for a stale generation.
    pub(crate) fn fired(&mut self, generation: u64) -> bool {
        if self.handle.is_none() || generation != self.generation {
            return false;
        }
        self.handle = None;
        self.generation = self.generation.wrapping_add(1);
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.clear();
    }
}
