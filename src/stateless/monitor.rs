use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use tracing::Instrument;

use crate::{
    clock::{Clock, RealClock},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// A snapshot handed to a `Monitor`'s callback each tick.
#[derive(Debug, Clone, Copy)]
pub struct MonitorStats {
    pub success_count: u64,
    pub error_count: u64,
    pub elapsed: Duration,
}

/// A transparent passthrough stage -- every item is forwarded unchanged --
/// that periodically reports running success/error counts to `callback`.
/// Purely observational: `Monitor` never drops or reorders items.
pub struct Monitor<T, C: Clock = RealClock> {
    name: String,
    interval: Duration,
    callback: Arc<dyn Fn(MonitorStats) + Send + Sync>,
    capacity: usize,
    clock: C,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Monitor<T, RealClock> {
    pub fn new(interval: Duration, callback: impl Fn(MonitorStats) + Send + Sync + 'static) -> Self {
        Monitor {
            name: "monitor".to_owned(),
            interval,
            callback: Arc::new(callback),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> Monitor<T, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Monitor<T, C2> {
        Monitor {
            name: self.name,
            interval: self.interval,
            callback: self.callback,
            capacity: self.capacity,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> Processor<T, T> for Monitor<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let name = self.name.clone();
        let success_count = Arc::new(AtomicU64::new(0));
        let error_count = Arc::new(AtomicU64::new(0));
        let start = self.clock.now();
        let done = CancellationToken::new();

        let forward_success = success_count.clone();
        let forward_error = error_count.clone();
        let forward_cancel = cancel.clone();
        let forward_done = done.clone();
        let forward_name = name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &forward_cancel).await {
                    match &result {
                        Result::Value(..) => {
                            forward_success.fetch_add(1, Ordering::Relaxed);
                        },
                        Result::Error(..) => {
                            forward_error.fetch_add(1, Ordering::Relaxed);
                        },
                    }
                    if !send_or_cancel(&tx, result, &forward_cancel).await {
                        break;
                    }
                }
                forward_done.cancel();
            }
            .instrument(tracing::info_span!("processor", name = %forward_name)),
        );

        let clock = self.clock.clone();
        let interval = self.interval;
        let callback = self.callback.clone();
        let ticker_name = name.clone();
        tokio::spawn(
            async move {
                let name = ticker_name;
                let mut ticker = clock.ticker(interval);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = done.cancelled() => break,
                        tick = ticker.recv() => {
                            if tick.is_none() {
                                break;
                            }
                            let stats = MonitorStats {
                                success_count: success_count.load(Ordering::Relaxed),
                                error_count: error_count.load(Ordering::Relaxed),
                                elapsed: clock.now().saturating_duration_since(start),
                            };
                            let callback = callback.clone();
                            if let Err(panic) = AssertUnwindSafe(async { callback(stats) })
                                .catch_unwind()
                                .await
                            {
                                let msg = panic
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| panic.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "non-string panic payload".to_owned());
                                tracing::error!(processor = %name, panic = %msg, "monitor callback panicked");
                            }
                        }
                    }
                }
                ticker.stop();
            }
            .instrument(tracing::info_span!("processor.monitor", name = %name)),
        );

        rx
    }
}
