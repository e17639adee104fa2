use std::{
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock},
    error::{ErrorKind, StreamError},
    metadata::Metadata,
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

const DEFAULT_DLQ_CAPACITY: usize = 100;

type AsyncFn<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>> + Send + Sync>;
type ShouldRetry<T> = Arc<dyn Fn(&StreamError<T>, u32) -> bool + Send + Sync>;
type OnFailure<T> = Arc<dyn Fn(&T) + Send + Sync>;
type OnRetry<T> = Arc<dyn Fn(&T, u32, &StreamError<T>) + Send + Sync>;

/// A permanently-failed item, carrying everything needed to inspect or
/// replay it out of band.
pub struct DlqItem<T> {
    pub item: Option<T>,
    pub cause: anyhow::Error,
    pub processor: String,
    pub timestamp: Instant,
    pub attempts: u32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DlqStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

fn default_should_retry<T>(err: &StreamError<T>, _attempt: u32) -> bool {
    err.kind().is_transient_by_default()
}

/// Wraps a fallible async operation `f: T -> T`, routing anything that
/// still fails after retries to a dedicated failed-items channel instead of
/// stalling (or silently dropping from) the main output.
///
/// Failures are retried up to `max_retries` times (classified by an
/// optional `should_retry`, defaulting to
/// [`ErrorKind::is_transient_by_default`]) before being wrapped into a
/// [`DlqItem`] and sent to the channel returned alongside the main output.
/// `on_failure` fires once per item that reaches the DLQ; `on_retry` fires
/// before each retry attempt. With `continue_on_error` (the default), the
/// worker keeps processing survivors after a DLQ-routed item; with
/// `continue_on_error(false)` it stops entirely (closing both outputs) on
/// the first one. A full DLQ channel still just blocks, like every other
/// send in this crate -- there is no silent-drop mode.
pub struct DeadLetterQueue<T, C: Clock = RealClock> {
    name: String,
    f: AsyncFn<T>,
    max_retries: u32,
    retry_delay: Duration,
    should_retry: ShouldRetry<T>,
    continue_on_error: bool,
    on_failure: Option<OnFailure<T>>,
    on_retry: Option<OnRetry<T>>,
    capacity: usize,
    dlq_capacity: usize,
    clock: C,
    counters: Arc<Counters>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Clone + Send + 'static> DeadLetterQueue<T, RealClock> {
    pub fn new<Fut>(f: impl Fn(T) -> Fut + Send + Sync + 'static) -> Self
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        DeadLetterQueue {
            name: "dead_letter_queue".to_owned(),
            f: Arc::new(move |v| Box::pin(f(v))),
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
            should_retry: Arc::new(default_should_retry::<T>),
            continue_on_error: true,
            on_failure: None,
            on_retry: None,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            dlq_capacity: DEFAULT_DLQ_CAPACITY,
            clock: RealClock::new(),
            counters: Arc::new(Counters::default()),
            _marker: PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static, C: Clock> DeadLetterQueue<T, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_should_retry(
        mut self,
        should_retry: impl Fn(&StreamError<T>, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Arc::new(should_retry);
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn on_failure(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(f));
        self
    }

    pub fn on_retry(mut self, f: impl Fn(&T, u32, &StreamError<T>) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_dlq_capacity(mut self, capacity: usize) -> Self {
        self.dlq_capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> DeadLetterQueue<T, C2> {
        DeadLetterQueue {
            name: self.name,
            f: self.f,
            max_retries: self.max_retries,
            retry_delay: self.retry_delay,
            should_retry: self.should_retry,
            continue_on_error: self.continue_on_error,
            on_failure: self.on_failure,
            on_retry: self.on_retry,
            capacity: self.capacity,
            dlq_capacity: self.dlq_capacity,
            clock,
            counters: self.counters,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A snapshot of the processed/succeeded/failed/retried counters,
    /// readable at any time -- including while `process` is still running.
    pub fn stats(&self) -> DlqStats {
        DlqStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
        }
    }

    /// Unlike [`crate::Processor`], this returns two channels: the main
    /// output and a channel of items that ended up in the dead letter
    /// queue. That makes it a multi-output primitive in the same family as
    /// `FanOut`/`Router`, not a single-output `Processor`.
    pub fn process(
        &self,
        cancel: CancellationToken,
        mut input: Receiver<T>,
    ) -> (Receiver<T>, Receiver<DlqItem<T>>) {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let (dlq_tx, dlq_rx) = channel::<DlqItem<T>>(self.dlq_capacity);
        let f = self.f.clone();
        let max_retries = self.max_retries;
        let retry_delay = self.retry_delay;
        let should_retry = self.should_retry.clone();
        let continue_on_error = self.continue_on_error;
        let on_failure = self.on_failure.clone();
        let on_retry = self.on_retry.clone();
        let clock = self.clock.clone();
        let name = self.name.clone();
        let span_name = self.name.clone();
        let counters = self.counters.clone();

        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    counters.processed.fetch_add(1, Ordering::Relaxed);
                    let (v, metadata) = match result {
                        Result::Error(e, m) => {
                            // Already failed upstream: there is no item for
                            // `f` to retry with, straight to the DLQ.
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            let cause = anyhow::anyhow!("{}", e.cause());
                            let item = e.into_item();
                            if let Some(on_failure) = &on_failure {
                                if let Some(item) = &item {
                                    on_failure(item);
                                }
                            }
                            let dlq_item = DlqItem {
                                item,
                                cause,
                                processor: name.clone(),
                                timestamp: clock.now(),
                                attempts: 0,
                                metadata: m,
                            };
                            if !send_dlq(&dlq_tx, dlq_item, &cancel).await {
                                break;
                            }
                            if !continue_on_error {
                                break;
                            }
                            continue;
                        }
                        Result::Value(v, m) => (v, m),
                    };

                    let mut attempt = 0;
                    let outcome = loop {
                        match f(v.clone()).await {
                            Ok(u) => break Ok(u),
                            Err(cause) => {
                                let probe = StreamError::new(
                                    v.clone(),
                                    anyhow::anyhow!("{cause:#}"),
                                    name.clone(),
                                    ErrorKind::ProcessorInternal,
                                    clock.now(),
                                );
                                let can_retry =
                                    attempt < max_retries && should_retry(&probe, attempt + 1);
                                if !can_retry {
                                    break Err(cause);
                                }
                                attempt += 1;
                                counters.retried.fetch_add(1, Ordering::Relaxed);
                                if let Some(on_retry) = &on_retry {
                                    on_retry(&v, attempt, &probe);
                                }

                                tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => return,
                                    _ = clock.after(retry_delay) => {}
                                }
                            }
                        }
                    };

                    match outcome {
                        Ok(u) => {
                            counters.succeeded.fetch_add(1, Ordering::Relaxed);
                            if !send_or_cancel(&tx, Result::Value(u, metadata), &cancel).await {
                                break;
                            }
                        }
                        Err(cause) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            if let Some(on_failure) = &on_failure {
                                on_failure(&v);
                            }
                            let dlq_item = DlqItem {
                                item: Some(v),
                                cause,
                                processor: name.clone(),
                                timestamp: clock.now(),
                                attempts: attempt,
                                metadata,
                            };
                            if !send_dlq(&dlq_tx, dlq_item, &cancel).await {
                                break;
                            }
                            if !continue_on_error {
                                break;
                            }
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %span_name)),
        );

        (rx, dlq_rx)
    }
}

async fn send_dlq<T>(
    tx: &tokio::sync::mpsc::Sender<DlqItem<T>>,
    item: DlqItem<T>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        outcome = tx.send(item) => outcome.is_ok(),
    }
}
