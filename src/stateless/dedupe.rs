use std::{collections::HashMap, hash::Hash, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock},
    error::ErrorKind,
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Suppress a success whose key (from `key_fn`) was already seen within
/// the trailing `ttl` window. Error Results always pass through and never
/// update or consult the dedupe table. A background sweep (driven by
/// `clock.ticker`, at `max(ttl / 4, 10ms)`) evicts stale keys so the table
/// doesn't grow without bound across a long-running stream.
pub struct Dedupe<T, K, C: Clock = RealClock> {
    name: String,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
    ttl: Duration,
    capacity: usize,
    clock: C,
}

impl<T: Send + 'static, K: Eq + Hash + Send + 'static> Dedupe<T, K, RealClock> {
    pub fn new(ttl: Duration, key_fn: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        Dedupe {
            name: "dedupe".to_owned(),
            key_fn: Arc::new(key_fn),
            ttl,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
        }
    }
}

impl<T: Send + 'static, K: Eq + Hash + Send + 'static, C: Clock> Dedupe<T, K, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Dedupe<T, K, C2> {
        Dedupe {
            name: self.name,
            key_fn: self.key_fn,
            ttl: self.ttl,
            capacity: self.capacity,
            clock,
        }
    }
}

impl<T: Send + 'static, K: Eq + Hash + Send + 'static, C: Clock> Processor<T, T>
    for Dedupe<T, K, C>
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let key_fn = self.key_fn.clone();
        let ttl = self.ttl;
        let clock = self.clock.clone();
        let name = self.name.clone();
        let sweep_period = (ttl / 4).max(Duration::from_millis(10));

        tokio::spawn(
            async move {
                let mut seen: HashMap<K, Instant> = HashMap::new();
                let mut sweeper = clock.ticker(sweep_period);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = recv_or_cancel(&mut input, &cancel) => {
                            let Some(result) = result else { break };
                            let outgoing = match result {
                                Result::Error(e, m) => Some(Result::Error(e, m)),
                                Result::Value(v, m) => {
                                    let key_fn = key_fn.clone();
                                    match AssertUnwindSafe(async { key_fn(&v) }).catch_unwind().await {
                                        Ok(key) => {
                                            let now = clock.now();
                                            let duplicate = seen
                                                .get(&key)
                                                .is_some_and(|&last| now.saturating_duration_since(last) < ttl);
                                            seen.insert(key, now);
                                            if duplicate {
                                                None
                                            } else {
                                                Some(Result::Value(v, m))
                                            }
                                        },
                                        Err(panic) => {
                                            let msg = panic
                                                .downcast_ref::<&str>()
                                                .map(|s| s.to_string())
                                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                                .unwrap_or_else(|| "non-string panic payload".to_owned());
                                            tracing::error!(processor = %name, panic = %msg, "dedupe key_fn panicked");
                                            Some(
                                                Result::error_with_kind(
                                                    v,
                                                    anyhow::anyhow!("{msg}"),
                                                    name.clone(),
                                                    ErrorKind::ProcessorInternal,
                                                    clock.now(),
                                                )
                                                .with_metadata_map(m),
                                            )
                                        },
                                    }
                                },
                            };
                            if let Some(outgoing) = outgoing {
                                if !send_or_cancel(&tx, outgoing, &cancel).await {
                                    break;
                                }
                            }
                        }
                        tick = sweeper.recv() => {
                            let Some(now) = tick else { continue };
                            seen.retain(|_, &mut last| now.saturating_duration_since(last) < ttl);
                        }
                    }
                }
                sweeper.stop();
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}
