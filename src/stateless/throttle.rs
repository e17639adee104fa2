use std::{
    num::NonZeroU32,
    ops::Add,
    time::Duration,
};

use governor::{nanos::Nanos, Quota, RateLimiter};
use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// `governor`'s `clock::Reference` bound wants arithmetic and a
/// `saturating_sub`; this crate's own [`Instant`] only exposes the
/// saturating operations it needs internally, so bridge with a thin
/// newtype rather than widen `Instant`'s public surface for one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct GovernorInstant(Instant);

impl Add<Nanos> for GovernorInstant {
    type Output = GovernorInstant;

    fn add(self, rhs: Nanos) -> GovernorInstant {
        let rhs: Duration = rhs.into();
        GovernorInstant(self.0 + rhs)
    }
}

impl governor::clock::Reference for GovernorInstant {
    fn duration_since(&self, earlier: Self) -> Nanos {
        self.0.saturating_duration_since(earlier.0).into()
    }

    fn saturating_sub(&self, duration: Nanos) -> Self {
        let duration: Duration = duration.into();
        let since_epoch = self.0.duration_since_epoch();
        GovernorInstant(Instant::from_duration_since_epoch(
            since_epoch.saturating_sub(duration),
        ))
    }
}

/// Bridges this crate's [`Clock`] into `governor::clock::Clock`, the same
/// pattern convex-backend's runtime crate uses to drive `governor`'s token
/// bucket off its own virtualizable clock instead of `std::time` directly.
#[derive(Clone)]
struct GovernorClock<C> {
    clock: C,
}

impl<C: Clock> governor::clock::Clock for GovernorClock<C> {
    type Instant = GovernorInstant;

    fn now(&self) -> GovernorInstant {
        GovernorInstant(self.clock.now())
    }
}

type Limiter<C> = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    GovernorClock<C>,
    governor::middleware::NoOpMiddleware<GovernorInstant>,
>;

/// Rate-limit successes to `rate` per second with up to `burst` tokens of
/// slack, via a `governor` token bucket bridged to this crate's `Clock`.
/// Error Results bypass the limiter and pass straight through -- they
/// don't consume or wait on tokens.
pub struct Throttle<T, C: Clock = RealClock> {
    name: String,
    rate: NonZeroU32,
    burst: NonZeroU32,
    capacity: usize,
    clock: C,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Throttle<T, RealClock> {
    pub fn new(rate: NonZeroU32) -> Self {
        Throttle {
            name: "throttle".to_owned(),
            rate,
            burst: rate,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> Throttle<T, C> {
    pub fn with_burst(mut self, burst: NonZeroU32) -> Self {
        self.burst = burst;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Throttle<T, C2> {
        Throttle {
            name: self.name,
            rate: self.rate,
            burst: self.burst,
            capacity: self.capacity,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> Processor<T, T> for Throttle<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let name = self.name.clone();
        let clock = self.clock.clone();
        let quota = Quota::per_second(self.rate).allow_burst(self.burst);
        let limiter: Limiter<C> = RateLimiter::direct_with_clock(
            quota,
            GovernorClock {
                clock: clock.clone(),
            },
        );

        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    if result.is_success() {
                        loop {
                            match limiter.check() {
                                Ok(()) => break,
                                Err(not_until) => {
                                    let wait = not_until
                                        .wait_time_from(GovernorInstant(clock.now()));
                                    tokio::select! {
                                        biased;
                                        _ = cancel.cancelled() => return,
                                        _ = clock.after(wait) => {},
                                    }
                                },
                            }
                        }
                    }
                    if !send_or_cancel(&tx, result, &cancel).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::VirtualClock, processor::channel};

    #[tokio::test]
    async fn forwards_within_burst_and_waits_beyond_it() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let throttle = Throttle::new(NonZeroU32::new(1).unwrap())
            .with_burst(NonZeroU32::new(2).unwrap())
            .with_clock(clock.clone());
        let mut out = throttle.process(cancel.clone(), rx);

        for v in [1, 2, 3] {
            tx.send(Result::success(v)).await.unwrap();
        }

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value().unwrap(), 1);
        let second = out.recv().await.unwrap();
        assert_eq!(*second.value().unwrap(), 2);

        // The third exceeds burst capacity; it won't arrive until the
        // clock advances enough to refill a token.
        assert!(out.try_recv().is_err());
        clock.advance(Duration::from_secs(1)).await;
        let third = out.recv().await.unwrap();
        assert_eq!(*third.value().unwrap(), 3);

        drop(tx);
    }
}
