//! In-flight request sharing.
//!
//! Concurrent [`CoordinationLock::dedupe`] calls with the same key and
//! result type await one shared operation. The operation is spawned onto the
//! runtime so it settles even if every caller stops waiting, and its table
//! entry is removed as it settles, before any caller observes the result.
//! A panicking operation also removes its entry; callers already joined see
//! the panic, later callers start fresh.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use parking_lot::Mutex;
use pulse_core::metrics::DEDUPE_JOINS_TOTAL;
use tracing::debug;

use crate::lock::{CoordinationLock, LockInner};

type SharedOp<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;
type Slot = (String, TypeId);

struct PendingEntry {
    generation: u64,
    /// A `SharedOp<T, E>` for the slot's result type.
    future: Box<dyn Any + Send + Sync>,
}

/// Key → in-flight operation.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<Slot, PendingEntry>>,
}

impl PendingTable {
    fn settle(&self, slot: &Slot, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(slot).is_some_and(|e| e.generation == generation) {
            let _ = entries.remove(slot);
        }
    }

    fn contains_key(&self, key: &str) -> bool {
        self.entries.lock().keys().any(|(k, _)| k == key)
    }
}

impl CoordinationLock {
    /// Run `op` once for all concurrent callers sharing `key`.
    ///
    /// If an operation with the same key and result type is already in
    /// flight, this awaits it instead of calling `op`. Every caller receives a
    /// clone of the same outcome, success or failure.
    pub async fn dedupe<T, E, F, Fut>(&self, key: &str, op: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let slot: Slot = (key.to_string(), TypeId::of::<Result<T, E>>());
        let shared = self.join_or_start(slot, op);
        shared.await
    }

    /// Whether a deduplicated operation for `key` is in flight.
    pub fn in_flight(&self, key: &str) -> bool {
        self.inner.pending.contains_key(key)
    }

    fn join_or_start<T, E, F, Fut>(&self, slot: Slot, op: F) -> SharedOp<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut entries = self.inner.pending.entries.lock();
        if let Some(existing) = entries
            .get(&slot)
            .and_then(|e| e.future.downcast_ref::<SharedOp<T, E>>())
        {
            counter!(DEDUPE_JOINS_TOTAL).increment(1);
            debug!(key = %slot.0, "joining in-flight operation");
            return existing.clone();
        }

        let generation = self.inner.next_token();
        let inner: Arc<LockInner> = Arc::clone(&self.inner);
        let settle_slot = slot.clone();
        // The table holds a clone of the shared future, so a panic must
        // settle here rather than through drop.
        let shared: SharedOp<T, E> = async move {
            let outcome = AssertUnwindSafe(async move { op().await })
                .catch_unwind()
                .await;
            inner.pending.settle(&settle_slot, generation);
            match outcome {
                Ok(outcome) => outcome,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        .boxed()
        .shared();

        debug!(key = %slot.0, "starting deduplicated operation");
        let _ = entries.insert(
            slot,
            PendingEntry {
                generation,
                future: Box::new(shared.clone()),
            },
        );
        drop(entries);

        drop(tokio::spawn(shared.clone()));
        shared
    }
}
