use std::{
    future::Future,
    pin::Pin,
    sync::{atomic::AtomicBool, Arc, LazyLock},
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use super::{instant::Instant, Clock, StoppableTimer, Ticker};

/// Process-wide epoch that real clocks measure elapsed time against, so
/// that `Instant` stays a plain duration rather than wrapping
/// `std::time::Instant` (which cannot be constructed for arbitrary values,
/// unlike `VirtualClock`'s instants).
static EPOCH: LazyLock<std::time::Instant> = LazyLock::new(std::time::Instant::now);

/// Wall-clock backed [`Clock`] for production use.
#[derive(Clone, Default)]
pub struct RealClock;

impl RealClock {
    pub fn new() -> Self {
        RealClock
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::from_duration_since_epoch(EPOCH.elapsed())
    }

    fn after(&self, duration: Duration) -> Pin<Box<dyn Future<Output = Instant> + Send>> {
        let clock = self.clone();
        Box::pin(async move {
            tokio::time::sleep(duration).await;
            clock.now()
        })
    }

    fn ticker(&self, period: Duration) -> Ticker {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let clock = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if tx.send(clock.now()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ticker::new(rx, move || cancel.cancel())
    }

    fn after_func<F>(&self, duration: Duration, f: F) -> StoppableTimer
    where
        F: FnOnce() + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let fire_active = active.clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if fire_active
                .compare_exchange(
                    true,
                    false,
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                )
                .is_ok()
            {
                f();
            }
        });
        StoppableTimer::new(active)
    }
}
