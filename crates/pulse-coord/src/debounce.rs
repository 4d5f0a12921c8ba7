//! Debounce: invoke once calls stop arriving.
//!
//! An invocation happens after `wait` has passed with no further calls,
//! using the latest arguments. `leading` additionally invokes the first
//! call of a burst. `max_wait` bounds how long a burst may defer the call.
//!
//! Elapsed times are computed with `checked_duration_since`. A timestamp in
//! the future (negative delta) counts as "due now".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pulse_settings::RateSettings;
use tokio::time::Instant;

use crate::timer::Timer;

/// Debounce wait and edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebounceOptions {
    /// Quiet period.
    pub wait: Duration,
    /// Invoke the first call of a burst immediately.
    pub leading: bool,
    /// Invoke the latest call once the burst ends.
    pub trailing: bool,
    /// Longest a call may be deferred. Never shorter than `wait`.
    pub max_wait: Option<Duration>,
}

impl DebounceOptions {
    /// Trailing edge only, no max wait.
    pub fn new(wait: Duration) -> Self {
        Self {
            wait,
            leading: false,
            trailing: true,
            max_wait: None,
        }
    }

    /// Options from settings (`debounceMs`, `debounceMaxWaitMs`).
    pub fn from_settings(settings: &RateSettings) -> Self {
        let options = Self::new(Duration::from_millis(settings.debounce_ms));
        match settings.debounce_max_wait_ms {
            Some(ms) => options.max_wait(Duration::from_millis(ms)),
            None => options,
        }
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

    /// Set the max wait.
    #[must_use]
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    fn effective_max_wait(&self) -> Option<Duration> {
        self.max_wait.map(|m| m.max(self.wait))
    }
}

struct DebounceState<A> {
    last_args: Option<A>,
    last_call: Option<Instant>,
    last_invoke: Option<Instant>,
    timer: Timer,
}

struct DebounceInner<A> {
    options: DebounceOptions,
    callback: Box<dyn Fn(A) + Send + Sync>,
    state: Mutex<DebounceState<A>>,
}

/// `None` when `then` is after `now`.
fn since(now: Instant, then: Instant) -> Option<Duration> {
    now.checked_duration_since(then)
}

impl<A: Send + 'static> DebounceInner<A> {
    fn should_invoke(&self, state: &DebounceState<A>, now: Instant) -> bool {
        let Some(last_call) = state.last_call else {
            return true;
        };
        let Some(since_call) = since(now, last_call) else {
            return true;
        };
        if since_call >= self.options.wait {
            return true;
        }
        self.options.effective_max_wait().is_some_and(|max_wait| {
            state
                .last_invoke
                .and_then(|t| since(now, t))
                .is_none_or(|since_invoke| since_invoke >= max_wait)
        })
    }

    fn remaining_wait(&self, state: &DebounceState<A>, now: Instant) -> Duration {
        let since_call = state.last_call.and_then(|t| since(now, t)).unwrap_or_default();
        let waiting = self.options.wait.saturating_sub(since_call);
        match self.options.effective_max_wait() {
            Some(max_wait) => {
                let since_invoke = state.last_invoke.and_then(|t| since(now, t)).unwrap_or_default();
                waiting.min(max_wait.saturating_sub(since_invoke))
            }
            None => waiting,
        }
    }

    fn start_timer(self: &Arc<Self>, state: &mut DebounceState<A>, delay: Duration) {
        state.timer.schedule(self, delay, |inner, generation| inner.timer_expired(generation));
    }

    /// Take the pending arguments and mark an invocation at `now`.
    fn take_invocation(state: &mut DebounceState<A>, now: Instant) -> Option<A> {
        let args = state.last_args.take()?;
        state.last_invoke = Some(now);
        Some(args)
    }

    fn trailing_edge(&self, state: &mut DebounceState<A>, now: Instant) -> Option<A> {
        state.timer.clear();
        if self.options.trailing {
            Self::take_invocation(state, now)
        } else {
            state.last_args = None;
            None
        }
    }

    fn timer_expired(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if !state.timer.fired(generation) {
            return;
        }
        let now = Instant::now();
        if self.should_invoke(&state, now) {
            let due = self.trailing_edge(&mut state, now);
            drop(state);
            if let Some(args) = due {
                (self.callback)(args);
            }
        } else {
            let delay = self.remaining_wait(&state, now);
            self.start_timer(&mut state, delay);
        }
    }
}

/// A debounced callback. Clones share state.
pub struct Debounced<A> {
    inner: Arc<DebounceInner<A>>,
}

impl<A: Send + 'static> Debounced<A> {
    /// Wrap `callback`.
    pub fn new(options: DebounceOptions, callback: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                options,
                callback: Box::new(callback),
                state: Mutex::new(DebounceState {
                    last_args: None,
                    last_call: None,
                    last_invoke: None,
                    timer: Timer::default(),
                }),
            }),
        }
    }

    /// Request an invocation with `args`.
    pub fn call(&self, args: A) {
        let inner = &self.inner;
        let now = Instant::now();
        let mut state = inner.state.lock();
        let invoking = inner.should_invoke(&state, now);
        state.last_args = Some(args);
        state.last_call = Some(now);

        let mut due = None;
        if invoking {
            if !state.timer.is_active() {
                // Leading edge of a new burst.
                state.last_invoke = Some(now);
                inner.start_timer(&mut state, inner.options.wait);
                if inner.options.leading {
                    due = DebounceInner::take_invocation(&mut state, now);
                }
            } else if inner.options.max_wait.is_some() {
                // max_wait elapsed under continuous calls.
                inner.start_timer(&mut state, inner.options.wait);
                due = DebounceInner::take_invocation(&mut state, now);
            }
        } else if !state.timer.is_active() {
            inner.start_timer(&mut state, inner.options.wait);
        }
        drop(state);

        if let Some(args) = due {
            (inner.callback)(args);
        }
    }

    /// Discard the pending call. No-op when nothing is pending.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        state.timer.clear();
        state.last_args = None;
        state.last_call = None;
        state.last_invoke = None;
    }

    /// Invoke the pending call now. No-op when nothing is pending.
    pub fn flush(&self) {
        let mut state = self.inner.state.lock();
        if !state.timer.is_active() {
            return;
        }
        let due = self.inner.trailing_edge(&mut state, Instant::now());
        drop(state);
        if let Some(args) = due {
            (self.inner.callback)(args);
        }
    }

    /// Whether a call is waiting for its quiet period.
    pub fn is_pending(&self) -> bool {
        let state = self.inner.state.lock();
        state.timer.is_active() && state.last_args.is_some()
    }

    /// The configured options.
    pub fn options(&self) -> DebounceOptions {
        self.inner.options
    }
}

impl<A> Clone for Debounced<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> fmt::Debug for Debounced<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debounced")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}
