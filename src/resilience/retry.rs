use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::Instrument;

use crate::{
    clock::{Clock, RealClock},
    error::{ErrorKind, StreamError},
    metadata::{keys, Metadata},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

type AsyncFn<T, U> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = anyhow::Result<U>> + Send>> + Send + Sync>;
type ShouldRetry<U> = Arc<dyn Fn(&StreamError<U>, u32) -> bool + Send + Sync>;

/// Retry on timeouts, connection errors, and generic transient markers;
/// never retry authentication, authorization, validation, or not-found
/// failures. `Retry` always tags its own attempts with
/// `ErrorKind::ProcessorInternal` (the failure came from the wrapped
/// closure, not from cancellation or a circuit breaker), so the kind alone
/// can't distinguish a dropped connection from a bad-credentials error --
/// this inspects the wrapped cause's message instead.
fn default_should_retry<U>(err: &StreamError<U>, _attempt: u32) -> bool {
    let msg = format!("{:#}", err.cause()).to_lowercase();

    const NON_RETRYABLE: &[&str] = &[
        "unauthorized",
        "unauthenticated",
        "authentication",
        "authorization",
        "forbidden",
        "permission denied",
        "invalid credentials",
        "validation",
        "invalid input",
        "not found",
    ];
    if NON_RETRYABLE.iter().any(|marker| msg.contains(marker)) {
        return false;
    }

    const RETRYABLE: &[&str] = &[
        "timeout",
        "timed out",
        "connection",
        "connect",
        "temporary",
        "temporarily",
        "unavailable",
        "rate limit",
    ];
    RETRYABLE.iter().any(|marker| msg.contains(marker))
}

/// Wraps a fallible async operation `f: T -> U` with bounded retries and
/// exponential backoff.
///
/// Attempt `n` (1-indexed; attempt 1 never delays) waits
/// `min(base_delay * 2^(n-1), max_delay)` before calling `f` again, unless
/// `with_jitter` is set, in which case the actual delay is drawn uniformly
/// from `50%..=100%` of the computed value. The wait always races
/// cancellation. A custom `should_retry(&StreamError<U>, attempt) -> bool`
/// overrides the default classifier
/// ([`ErrorKind::is_transient_by_default`]); once `max_attempts` is
/// exhausted, or the classifier declines, the last error is emitted with
/// `ErrorKind::RetryExhausted` and `retry_count` metadata set to the number
/// of attempts made.
pub struct Retry<T, U, C: Clock = RealClock> {
    name: String,
    f: AsyncFn<T, U>,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    seed: Option<u64>,
    should_retry: ShouldRetry<U>,
    capacity: usize,
    clock: C,
    _marker: PhantomData<fn(T) -> U>,
}

impl<T: Clone + Send + 'static, U: Send + 'static> Retry<T, U, RealClock> {
    pub fn new<Fut>(f: impl Fn(T) -> Fut + Send + Sync + 'static) -> Self
    where
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        Retry {
            name: "retry".to_owned(),
            f: Arc::new(move |v| Box::pin(f(v))),
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
            seed: None,
            should_retry: Arc::new(default_should_retry::<U>),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static, U: Send + 'static, C: Clock> Retry<T, U, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Seed the jitter RNG for reproducible tests. Has no effect unless
    /// `with_jitter(true)`.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_should_retry(
        mut self,
        should_retry: impl Fn(&StreamError<U>, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(should_retry);
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Retry<T, U, C2> {
        Retry {
            name: self.name,
            f: self.f,
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
            seed: self.seed,
            should_retry: self.should_retry,
            capacity: self.capacity,
            clock,
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static, U: Send + 'static, C: Clock> Processor<T, U> for Retry<T, U, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<U> {
        let (tx, rx): (Sender<U>, Receiver<U>) = channel(self.capacity);
        let f = self.f.clone();
        let max_attempts = self.max_attempts;
        let base_delay = self.base_delay;
        let max_delay = self.max_delay;
        let jitter = self.jitter;
        let seed = self.seed;
        let should_retry = self.should_retry.clone();
        let clock = self.clock.clone();
        let name = self.name.clone();
        let span_name = self.name.clone();

        tokio::spawn(
            async move {
                let mut rng = match seed {
                    Some(seed) => ChaCha8Rng::seed_from_u64(seed),
                    None => ChaCha8Rng::from_rng(&mut rand::rng()),
                };

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

                    let mut attempt = 1;
                    let out = loop {
                        let outcome = f(v.clone()).await;
                        match outcome {
                            Ok(u) => break Result::success(u),
                            Err(cause) => {
                                let err = StreamError::new(
                                    v.clone(),
                                    cause,
                                    name.clone(),
                                    ErrorKind::ProcessorInternal,
                                    clock.now(),
                                );

                                let retry = attempt < max_attempts && should_retry(&err, attempt);
                                if !retry {
                                    let exhausted = StreamError::new(
                                        v.clone(),
                                        anyhow::anyhow!("{:#}", err.cause()),
                                        name.clone(),
                                        ErrorKind::RetryExhausted,
                                        clock.now(),
                                    )
                                    .retype::<U>();
                                    let metadata = Metadata::empty()
                                        .with(keys::RETRY_COUNT, i64::from(attempt));
                                    break Result::Error(exhausted, metadata);
                                }

                                let exp = 2u32.saturating_pow(attempt - 1);
                                let computed = base_delay.saturating_mul(exp).min(max_delay);
                                let delay = if jitter {
                                    let frac = rng.random_range(0.5..=1.0);
                                    computed.mul_f64(frac)
                                } else {
                                    computed
                                };

                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => return,
                                    _ = clock.after(delay) => {}
                                }

                                attempt += 1;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_on_a_later_attempt_without_exhausting() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let retry = Retry::new(move |v: i32| {
            let attempts = attempts2.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(anyhow::anyhow!("temporary failure"))
                } else {
                    Ok(v * 10)
                }
            }
        })
        .max_attempts(5)
        .with_base_delay(Duration::from_millis(10))
        .with_should_retry(|_, _| true)
        .with_clock(clock.clone());
        let mut out = retry.process(cancel.clone(), rx);

        tx.send(Result::success(4)).await.unwrap();

        // Drive the virtual clock past however many backoff waits are
        // needed; each failed attempt awaits one `clock.after`.
        for _ in 0..5 {
            tokio::task::yield_now().await;
            clock.advance(Duration::from_secs(10)).await;
        }

        let got = out.recv().await.unwrap();
        assert_eq!(*got.value().unwrap(), 40);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        drop(tx);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts_and_tags_retry_count() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let retry = Retry::new(|_: i32| async move { Err::<i32, _>(anyhow::anyhow!("nope")) })
            .max_attempts(3)
            .with_base_delay(Duration::from_millis(10))
            .with_should_retry(|_, _| true)
            .with_clock(clock.clone());
        let mut out = retry.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
            clock.advance(Duration::from_secs(10)).await;
        }

        let got = out.recv().await.unwrap();
        assert_eq!(got.error().unwrap().kind(), ErrorKind::RetryExhausted);
        assert_eq!(
            got.get_int_metadata(keys::RETRY_COUNT).found().unwrap(),
            3
        );

        drop(tx);
    }

    #[tokio::test]
    async fn a_non_retryable_classification_skips_the_backoff() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let retry = Retry::new(move |_: i32| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(anyhow::anyhow!("authentication failed"))
            }
        })
        .max_attempts(5)
        .with_should_retry(|_, _| false);
        let mut out = retry.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        let got = out.recv().await.unwrap();
        assert!(got.is_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drop(tx);
    }

    #[tokio::test]
    async fn default_classifier_retries_transient_causes_and_not_auth_or_validation() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let retry = Retry::new(move |_: i32| {
            let attempts = attempts2.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(anyhow::anyhow!("connection reset by peer"))
            }
        })
        .max_attempts(3)
        .with_base_delay(Duration::from_millis(10))
        .with_clock(clock.clone());
        let mut out = retry.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
            clock.advance(Duration::from_secs(10)).await;
        }
        let got = out.recv().await.unwrap();
        assert_eq!(got.error().unwrap().kind(), ErrorKind::RetryExhausted);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        drop(tx);

        let (tx2, rx2) = channel::<i32>(8);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let retry2 = Retry::new(move |_: i32| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(anyhow::anyhow!("validation failed: missing field"))
            }
        })
        .max_attempts(5);
        let mut out2 = retry2.process(cancel.clone(), rx2);

        tx2.send(Result::success(1)).await.unwrap();
        let got2 = out2.recv().await.unwrap();
        assert!(got2.is_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        drop(tx2);
    }
}
