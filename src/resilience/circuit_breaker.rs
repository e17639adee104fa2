use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock},
    error::ErrorKind,
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result, StreamError,
};

/// The three states a [`CircuitBreaker`] can be in.
///
/// `Closed` -> (`failure_threshold` ratio reached, once `min_requests` have
/// been tallied) -> `Open` -> (`recovery_timeout` elapses) -> `HalfOpen` ->
/// (`half_open_probe_count` consecutive successful probes) -> `Closed`, or
/// (any probe failure) -> back to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    requests: u32,
    failures: u32,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
    half_open_successes: u32,
}

type AsyncFn<T, U> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = anyhow::Result<U>> + Send>> + Send + Sync>;

/// Wraps a fallible async operation `f: T -> U` with a three-state circuit
/// breaker.
///
/// While `Closed`, successes and failures are tallied; once `min_requests`
/// have been observed, a failure ratio `>= failure_threshold` opens the
/// breaker. While `Open`, every item is short-circuited to an
/// `ErrorKind::CircuitOpen` error without ever calling `f`, until
/// `recovery_timeout` elapses and the breaker moves to `HalfOpen`. In
/// `HalfOpen`, a single probe is admitted at a time (concurrent arrivals are
/// short-circuited); `half_open_probe_count` consecutive successes re-closes
/// the breaker and resets its tally, while any single failure reopens it.
pub struct CircuitBreaker<T, U, C: Clock = RealClock> {
    name: String,
    f: AsyncFn<T, U>,
    failure_threshold: f64,
    min_requests: u32,
    recovery_timeout: Duration,
    half_open_probe_count: u32,
    capacity: usize,
    clock: C,
    _marker: PhantomData<fn(T) -> U>,
}

impl<T: Send + 'static, U: Send + 'static> CircuitBreaker<T, U, RealClock> {
    pub fn new<Fut>(f: impl Fn(T) -> Fut + Send + Sync + 'static) -> Self
    where
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        CircuitBreaker {
            name: "circuit_breaker".to_owned(),
            f: Arc::new(move |v| Box::pin(f(v))),
            failure_threshold: 0.5,
            min_requests: 100,
            recovery_timeout: Duration::from_secs(30),
            half_open_probe_count: 5,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static, U: Send + 'static, C: Clock> CircuitBreaker<T, U, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_failure_threshold(mut self, ratio: f64) -> Self {
        assert!((0.0..=1.0).contains(&ratio), "failure_threshold must be in 0.0..=1.0");
        self.failure_threshold = ratio;
        self
    }

    pub fn with_min_requests(mut self, min_requests: u32) -> Self {
        self.min_requests = min_requests;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_probe_count(mut self, count: u32) -> Self {
        assert!(count > 0, "half_open_probe_count must be at least 1");
        self.half_open_probe_count = count;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> CircuitBreaker<T, U, C2> {
        CircuitBreaker {
            name: self.name,
            f: self.f,
            failure_threshold: self.failure_threshold,
            min_requests: self.min_requests,
            recovery_timeout: self.recovery_timeout,
            half_open_probe_count: self.half_open_probe_count,
            capacity: self.capacity,
            clock,
            _marker: PhantomData,
        }
    }
}

/// What to do with an arriving item, decided while holding the lock.
enum Admission {
    Call { is_probe: bool },
    ShortCircuit,
}

impl<T: Send + 'static, U: Send + 'static, C: Clock> Processor<T, U> for CircuitBreaker<T, U, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<U> {
        let (tx, rx): (Sender<U>, Receiver<U>) = channel(self.capacity);
        let f = self.f.clone();
        let failure_threshold = self.failure_threshold;
        let min_requests = self.min_requests;
        let recovery_timeout = self.recovery_timeout;
        let half_open_probe_count = self.half_open_probe_count;
        let clock = self.clock.clone();
        let name = self.name.clone();
        let span_name = self.name.clone();
        let inner = Arc::new(Mutex::new(Inner {
            state: BreakerState::Closed,
            requests: 0,
            failures: 0,
            opened_at: None,
            half_open_probe_in_flight: false,
            half_open_successes: 0,
        }));

        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let v = match result {
                        Result::Error(e, m) => {
                            let out = Result::Error(e.retype(), m);
                            if !send_or_cancel(&tx, out, &cancel).await {
                                break;
                            }
                            continue;
                        }
                        Result::Value(v, _) => v,
                    };

                    let admission = {
                        let mut state = inner.lock();
                        match state.state {
                            BreakerState::Closed => Admission::Call { is_probe: false },
                            BreakerState::Open => {
                                let opened_at =
                                    state.opened_at.expect("Open state always has opened_at");
                                if clock.now().saturating_duration_since(opened_at) >= recovery_timeout {
                                    state.state = BreakerState::HalfOpen;
                                    state.half_open_successes = 0;
                                    state.half_open_probe_in_flight = true;
                                    Admission::Call { is_probe: true }
                                } else {
                                    Admission::ShortCircuit
                                }
                            }
                            BreakerState::HalfOpen => {
                                if state.half_open_probe_in_flight {
                                    Admission::ShortCircuit
                                } else {
                                    state.half_open_probe_in_flight = true;
                                    Admission::Call { is_probe: true }
                                }
                            }
                        }
                    };

                    let is_probe = match admission {
                        Admission::ShortCircuit => {
                            let err = StreamError::new(
                                (),
                                anyhow::anyhow!("circuit breaker open"),
                                name.clone(),
                                ErrorKind::CircuitOpen,
                                clock.now(),
                            )
                            .retype::<U>();
                            if !send_or_cancel(&tx, Result::from_stream_error(err), &cancel).await {
                                break;
                            }
                            continue;
                        }
                        Admission::Call { is_probe } => is_probe,
                    };

                    let outcome = f(v).await;
                    let out = {
                        let mut state = inner.lock();
                        match outcome {
                            Ok(u) => {
                                if is_probe {
                                    state.half_open_probe_in_flight = false;
                                    state.half_open_successes += 1;
                                    if state.half_open_successes >= half_open_probe_count {
                                        state.state = BreakerState::Closed;
                                        state.requests = 0;
                                        state.failures = 0;
                                    }
                                } else {
                                    state.requests += 1;
                                }
                                Result::success(u)
                            }
                            Err(cause) => {
                                if is_probe {
                                    state.half_open_probe_in_flight = false;
                                    state.half_open_successes = 0;
                                    state.state = BreakerState::Open;
                                    state.opened_at = Some(clock.now());
                                } else {
                                    state.requests += 1;
                                    state.failures += 1;
                                    if state.requests >= min_requests
                                        && (state.failures as f64 / state.requests as f64)
                                            >= failure_threshold
                                    {
                                        state.state = BreakerState::Open;
                                        state.opened_at = Some(clock.now());
                                    }
                                }
                                let err = StreamError::new(
                                    (),
                                    cause,
                                    name.clone(),
                                    ErrorKind::ProcessorInternal,
                                    clock.now(),
                                )
                                .retype::<U>();
                                Result::from_stream_error(err)
                            }
                        }
                    };
                    if !send_or_cancel(&tx, out, &cancel).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %span_name)),
        );

        rx
    }
}
