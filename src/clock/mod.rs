//! Abstracted time source: real and virtual implementations of [`Clock`].
//!
//! Processors that need to wait, tick, or schedule delayed work (windows,
//! throttling, debouncing, retry backoff, the circuit breaker's recovery
//! timeout) never call `tokio::time` directly. They take a `C: Clock` and
//! go through it, so tests can swap in [`VirtualClock`] and drive every
//! timing-sensitive subsystem deterministically.

mod instant;
mod real;
mod virtual_clock;

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

pub use instant::Instant;
pub use real::RealClock;
pub use virtual_clock::VirtualClock;

/// Four operations, real and virtual implementations, per the historical
/// `streamz` design this crate generalizes: `now`, `after`, `ticker`,
/// `after_func`.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Current (potentially virtual) time.
    fn now(&self) -> Instant;

    /// A future that resolves once after `duration` elapses.
    fn after(&self, duration: Duration) -> Pin<Box<dyn Future<Output = Instant> + Send>>;

    /// A periodic tick source. Ticks are delivered on `Ticker::recv`; call
    /// `Ticker::stop` (or drop it) to stop scheduling further ticks.
    fn ticker(&self, period: Duration) -> Ticker;

    /// Invoke `f` on a worker task after `duration` elapses. The returned
    /// [`StoppableTimer`] can cancel the invocation, but only if `stop` wins
    /// the race against the timer firing -- see [`StoppableTimer::stop`].
    fn after_func<F>(&self, duration: Duration, f: F) -> StoppableTimer
    where
        F: FnOnce() + Send + 'static;
}

/// Handle returned by [`Clock::after_func`].
///
/// `stop` and the timer's own firing both attempt to win a single
/// compare-and-swap on an `active` flag. Whichever wins decides the
/// outcome; there is no window where both the callback runs *and* a
/// preceding `stop()` call is told it succeeded. This specifically avoids
/// the historical bug where a callback already scheduled (but not yet
/// polled) would still fire after `stop()` returned, producing duplicate
/// session-window emissions.
#[derive(Clone)]
pub struct StoppableTimer {
    active: Arc<std::sync::atomic::AtomicBool>,
}

impl StoppableTimer {
    pub(crate) fn new(active: Arc<std::sync::atomic::AtomicBool>) -> Self {
        StoppableTimer { active }
    }

    /// Attempt to prevent the callback from running. Returns `true` if this
    /// call won the race and the callback will never run; returns `false`
    /// if the callback had already fired (or another `stop()` call already
    /// won).
    pub fn stop(&self) -> bool {
        self.active
            .compare_exchange(
                true,
                false,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_ok()
    }
}

/// Periodic tick source returned by [`Clock::ticker`].
pub struct Ticker {
    receiver: tokio::sync::mpsc::UnboundedReceiver<Instant>,
    stop: Box<dyn Fn() + Send + Sync>,
}

impl Ticker {
    pub(crate) fn new(
        receiver: tokio::sync::mpsc::UnboundedReceiver<Instant>,
        stop: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Ticker {
            receiver,
            stop: Box::new(stop),
        }
    }

    /// Await the next tick. Returns `None` once the ticker has been stopped
    /// and all buffered ticks have been consumed.
    pub async fn recv(&mut self) -> Option<Instant> {
        self.receiver.recv().await
    }

    /// Stop scheduling further ticks. Already-buffered ticks can still be
    /// drained via `recv`.
    pub fn stop(&self) {
        (self.stop)()
    }
}
