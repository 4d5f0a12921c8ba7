//! Keyed mutual exclusion with stale-entry recovery.
//!
//! A [`CoordinationLock`] is an explicit lock domain. Clones share the same
//! tables; independent instances never interfere. At most one live entry
//! exists per key. An entry older than its timeout is treated as abandoned
//! and replaced by the next acquirer.
//!
//! When an entry is replaced, the displaced holder's eventual release is a
//! no-op: each entry carries a token, and a [`LockGuard`] only removes the
//! entry it created.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use pulse_core::errors::LockError;
use pulse_core::metrics::{LOCK_CONFLICTS_TOTAL, LOCK_STALE_REPLACEMENTS_TOTAL};
use pulse_settings::LockSettings;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dedupe::PendingTable;

/// Default lock timeout when none is configured.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Callback fired with the contended key when `with_lock` is rejected.
pub type ConflictCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct LockEntry {
    acquired_at: Instant,
    timeout: Duration,
    token: u64,
}

impl LockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.acquired_at) >= self.timeout
    }
}

pub(crate) struct LockInner {
    default_timeout: Duration,
    entries: Mutex<HashMap<String, LockEntry>>,
    pub(crate) pending: PendingTable,
    next_token: AtomicU64,
}

impl LockInner {
    pub(crate) fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn release(&self, key: &str, token: u64) {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.token == token => {
                let _ = entries.remove(key);
                debug!(key, "lock released");
            }
            Some(_) => debug!(key, "lock was replaced after expiry, release ignored"),
            None => debug!(key, "lock already gone, release ignored"),
        }
    }
}

/// Options for [`CoordinationLock::with_lock`].
#[derive(Clone, Default)]
pub struct LockOptions {
    /// Entry lifetime and operation deadline. Falls back to the lock's default.
    pub timeout: Option<Duration>,
    /// Fired when the key is already held.
    pub on_conflict: Option<ConflictCallback>,
}

impl LockOptions {
    /// Options with the lock's default timeout and no conflict callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the conflict callback.
    #[must_use]
    pub fn on_conflict(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_conflict = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for LockOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockOptions")
            .field("timeout", &self.timeout)
            .field("on_conflict", &self.on_conflict.is_some())
            .finish()
    }
}

/// Keyed lock and deduplication domain.
#[derive(Clone)]
pub struct CoordinationLock {
    pub(crate) inner: Arc<LockInner>,
}

impl CoordinationLock {
    /// Create a lock domain whose entries expire after `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LockInner {
                default_timeout,
                entries: Mutex::new(HashMap::new()),
                pending: PendingTable::default(),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Create a lock domain from settings.
    pub fn from_settings(settings: &LockSettings) -> Self {
        Self::new(Duration::from_millis(settings.timeout_ms))
    }

    /// The timeout used when none is given.
    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Try to take `key` without waiting.
    ///
    /// Returns `None` if a live entry holds the key. An expired entry is
    /// replaced. The returned guard releases the key on drop.
    pub fn try_acquire(&self, key: &str, timeout: Option<Duration>) -> Option<LockGuard> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let now = Instant::now();
        let token = self.inner.next_token();

        let mut entries = self.inner.entries.lock();
        if let Some(existing) = entries.get(key) {
            if !existing.is_expired(now) {
                return None;
            }
            counter!(LOCK_STALE_REPLACEMENTS_TOTAL).increment(1);
            warn!(
                key,
                held_ms = now.saturating_duration_since(existing.acquired_at).as_millis() as u64,
                timeout_ms = existing.timeout.as_millis() as u64,
                "replacing stale lock"
            );
        }
        let _ = entries.insert(
            key.to_string(),
            LockEntry {
                acquired_at: now,
                timeout,
                token,
            },
        );
        drop(entries);

        debug!(key, timeout_ms = timeout.as_millis() as u64, "lock acquired");
        Some(LockGuard {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            token,
            released: false,
        })
    }

    /// Run `op` while holding `key`.
    ///
    /// If the key is held by a live entry, `op` is not called, the conflict
    /// callback fires, and [`LockError::InProgress`] is returned. Otherwise
    /// `op` runs with the lock timeout as its deadline; on expiry it is
    /// dropped and [`LockError::TimedOut`] is returned. The key is released
    /// on every exit path, including when this future is dropped.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        options: &LockOptions,
        op: F,
    ) -> Result<T, LockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let timeout = options.timeout.unwrap_or(self.inner.default_timeout);
        let Some(guard) = self.try_acquire(key, Some(timeout)) else {
            counter!(LOCK_CONFLICTS_TOTAL).increment(1);
            debug!(key, "lock conflict, operation rejected");
            if let Some(callback) = &options.on_conflict {
                callback(key);
            }
            return Err(LockError::InProgress {
                key: key.to_string(),
            });
        };

        let outcome = tokio::time::timeout(timeout, op()).await;
        guard.release();

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(LockError::Operation(e)),
            Err(_) => {
                warn!(key, timeout_ms = timeout.as_millis() as u64, "locked operation timed out");
                Err(LockError::TimedOut {
                    key: key.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Whether `key` is held by a live (unexpired) entry.
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Keys held by live entries, sorted.
    pub fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl Default for CoordinationLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl fmt::Debug for CoordinationLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationLock")
            .field("default_timeout", &self.inner.default_timeout)
            .field("held", &self.inner.entries.lock().len())
            .finish_non_exhaustive()
    }
}

/// Ownership of one lock entry. Releases the key on drop.
pub struct LockGuard {
    inner: Arc<LockInner>,
    key: String,
    token: u64,
    released: bool,
}

impl LockGuard {
    /// The held key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.release(&self.key, self.token);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish_non_exhaustive()
    }
}
