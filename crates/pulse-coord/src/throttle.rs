//! Throttle: at most one invocation per window.
//!
//! The first call in an idle period opens a window. With `leading`, it is
//! invoked immediately. Calls inside the window only replace the pending
//! arguments. With `trailing`, the latest pending arguments are invoked when
//! the window closes, and that invocation opens the next window.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pulse_settings::RateSettings;

use crate::timer::Timer;

/// Throttle window and edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// Window length.
    pub wait: Duration,
    /// Invoke the first call of a window immediately.
    pub leading: bool,
    /// Invoke the latest call of a window when it closes.
    pub trailing: bool,
}

impl ThrottleOptions {
    /// Both edges enabled.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            leading: true,
            trailing: true,
        }
    }

    /// Options from settings (`throttleMs`, both edges).
    pub fn from_settings(settings: &RateSettings) -> Self {
        Self::new(Duration::from_millis(settings.throttle_ms))
    }

    /// Set the leading edge.
    #[must_use]
    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Set the trailing edge.
    #[must_use]
    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }
}

struct ThrottleState<A> {
    pending: Option<A>,
    window: Timer,
}

struct ThrottleInner<A> {
    options: ThrottleOptions,
    callback: Box<dyn Fn(A) + Send + Sync>,
    state: Mutex<ThrottleState<A>>,
}

impl<A: Send + 'static> ThrottleInner<A> {
    fn open_window(self: &Arc<Self>, state: &mut ThrottleState<A>) {
        state.window.schedule(self, self.options.wait, |inner, generation| {
            inner.window_closed(generation);
        });
    }

    fn window_closed(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if !state.window.fired(generation) {
            return;
        }
        let Some(args) = state.pending.take() else {
            return;
        };
        self.open_window(&mut state);
        drop(state);
        (self.callback)(args);
    }
}

/// A throttled callback. Clones share state.
pub struct Throttled<A> {
    inner: Arc<ThrottleInner<A>>,
}

impl<A: Send + 'static> Throttled<A> {
    /// Wrap `callback`.
    pub fn new(options: ThrottleOptions, callback: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                options,
                callback: Box::new(callback),
                state: Mutex::new(ThrottleState {
                    pending: None,
                    window: Timer::default(),
                }),
            }),
        }
    }

    /// Request an invocation with `args`.
    pub fn call(&self, args: A) {
        let mut state = self.inner.state.lock();
        if state.window.is_active() {
            if self.inner.options.trailing {
                state.pending = Some(args);
            }
            return;
        }

        self.inner.open_window(&mut state);
        if self.inner.options.leading {
            drop(state);
            (self.inner.callback)(args);
        } else if self.inner.options.trailing {
            state.pending = Some(args);
        }
    }

    /// Drop the pending trailing call and close the window.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.pending = None;
        state.window.clear();
    }

    /// Invoke the pending trailing call now. No-op when nothing is pending.
    ///
    /// The flushed invocation opens a fresh window, like a trailing edge.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        let Some(args) = state.pending.take() else {
            return;
        };
        self.inner.open_window(&mut state);
        drop(state);
        (self.inner.callback)(args);
    }

    /// Whether a trailing call is waiting for the window to close.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// The configured options.
    pub fn options(&self) -> ThrottleOptions {
        self.inner.options
    }
}

impl<A> Clone for Throttled<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for Throttled<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttled")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Instant, sleep};

    type Log = Arc<Mutex<Vec<(u64, u32)>>>;

    fn recorder(start: Instant) -> (Log, impl Fn(u32) + Send + Sync + 'static) {
        let log: Log = Arc::default();
        let sink = Arc::clone(&log);
        (log, move |n| sink.lock().push((start.elapsed().as_millis() as u64, n)))
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn assert_at(actual: &[(u64, u32)], expected: &[(u64, u32)]) {
        assert_eq!(actual.len(), expected.len(), "invocations: {actual:?}");
        for ((at, n), (want_at, want_n)) in actual.iter().zip(expected) {
            assert_eq!(n, want_n, "invocations: {actual:?}");
            assert!(at.abs_diff(*want_at) <= 2, "invocations: {actual:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn leading_and_trailing() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)), f);

        throttled.call(1);
        sleep(ms(100)).await;
        throttled.call(2);
        sleep(ms(500)).await;
        throttled.call(3);
        sleep(ms(1000)).await;

        assert_at(&log.lock(), &[(0, 1), (500, 2), (1000, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_coalesced_to_latest() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)), f);

        for n in 1..=5 {
            throttled.call(n);
            sleep(ms(50)).await;
        }
        sleep(ms(1000)).await;

        assert_at(&log.lock(), &[(0, 1), (500, 5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn leading_only_drops_mid_window_calls() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)).trailing(false), f);

        throttled.call(1);
        sleep(ms(100)).await;
        throttled.call(2);
        assert!(!throttled.is_pending());
        sleep(ms(500)).await;
        throttled.call(3);
        sleep(ms(1000)).await;

        assert_at(&log.lock(), &[(0, 1), (600, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_only_defers_first_call() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)).leading(false), f);

        throttled.call(1);
        sleep(ms(100)).await;
        throttled.call(2);
        sleep(ms(1000)).await;

        assert_at(&log.lock(), &[(500, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_trailing() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)), f);

        throttled.call(1);
        throttled.call(2);
        assert!(throttled.is_pending());
        throttled.cancel();
        assert!(!throttled.is_pending());
        sleep(ms(1000)).await;

        assert_at(&log.lock(), &[(0, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_invokes_pending_now() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)), f);

        throttled.call(1);
        sleep(ms(100)).await;
        throttled.call(2);
        throttled.flush();
        sleep(ms(1000)).await;

        assert_at(&log.lock(), &[(0, 1), (100, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn call_after_flush_waits_for_window() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)), f);

        throttled.call(1);
        sleep(ms(100)).await;
        throttled.call(2);
        throttled.flush();
        sleep(ms(10)).await;
        throttled.call(3);
        assert!(throttled.is_pending());
        sleep(ms(1000)).await;

        assert_at(&log.lock(), &[(0, 1), (100, 2), (600, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_flush_are_noops_when_idle() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)), f);
        throttled.cancel();
        throttled.flush();
        sleep(ms(1000)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_cancels_trailing() {
        let (log, f) = recorder(Instant::now());
        let throttled = Throttled::new(ThrottleOptions::new(ms(500)), f);
        throttled.call(1);
        throttled.call(2);
        drop(throttled);
        sleep(ms(1000)).await;
        assert_at(&log.lock(), &[(0, 1)]);
    }

    #[test]
    fn options_from_settings() {
        let options = ThrottleOptions::from_settings(&RateSettings::default());
        assert_eq!(options.wait, ms(500));
        assert!(options.leading && options.trailing);
    }
}
