use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt;
use tracing::Instrument;

use crate::{
    clock::{Clock, RealClock},
    error::ErrorKind,
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

/// Route each success to one of `partitions` output channels by a stable
/// hash of `key_fn(value)`, so repeated runs over the same keys land on the
/// same partition. A single dispatcher loop reads `input` sequentially and
/// does the per-partition `send`, which is what keeps each partition's
/// output in arrival order -- there is no per-partition worker racing
/// another for the same slot.
///
/// Unlike the other `stateless` processors, `Partition` fans out to more
/// than one output, so it does not implement `Processor`; call `process`
/// directly for the `Vec` of per-partition receivers.
pub struct Partition<T, K, C: Clock = RealClock> {
    name: String,
    key_fn: Arc<dyn Fn(&T) -> K + Send + Sync>,
    partitions: usize,
    capacity: usize,
    clock: C,
}

impl<T: Send + 'static, K: Hash> Partition<T, K, RealClock> {
    pub fn new(partitions: usize, key_fn: impl Fn(&T) -> K + Send + Sync + 'static) -> Self {
        assert!(partitions > 0, "Partition requires at least one partition");
        Partition {
            name: "partition".to_owned(),
            key_fn: Arc::new(key_fn),
            partitions,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
        }
    }
}

impl<T: Send + 'static, K: Hash, C: Clock> Partition<T, K, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Partition<T, K, C2> {
        Partition {
            name: self.name,
            key_fn: self.key_fn,
            partitions: self.partitions,
            capacity: self.capacity,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Vec<Receiver<T>> {
        let mut senders: Vec<Sender<T>> = Vec::with_capacity(self.partitions);
        let mut receivers: Vec<Receiver<T>> = Vec::with_capacity(self.partitions);
        for _ in 0..self.partitions {
            let (tx, rx) = channel(self.capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        let key_fn = self.key_fn.clone();
        let partitions = self.partitions;
        let clock = self.clock.clone();
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let (result, index) = match result {
                        Result::Error(e, m) => {
                            // Errors carry no key; route deterministically to
                            // partition 0 so they're never silently dropped.
                            (Result::Error(e, m), 0)
                        },
                        Result::Value(v, m) => {
                            let key_fn = key_fn.clone();
                            match AssertUnwindSafe(async { key_fn(&v) }).catch_unwind().await {
                                Ok(key) => {
                                    let mut hasher = DefaultHasher::new();
                                    key.hash(&mut hasher);
                                    let index = (hasher.finish() as usize) % partitions;
                                    (Result::Value(v, m), index)
                                },
                                Err(panic) => {
                                    let msg = panic
                                        .downcast_ref::<&str>()
                                        .map(|s| s.to_string())
                                        .or_else(|| panic.downcast_ref::<String>().cloned())
                                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                                    tracing::error!(processor = %name, panic = %msg, "partition key_fn panicked");
                                    let err = Result::error_with_kind(
                                        v,
                                        anyhow::anyhow!("{msg}"),
                                        name.clone(),
                                        ErrorKind::ProcessorInternal,
                                        clock.now(),
                                    )
                                    .with_metadata_map(m);
                                    (err, 0)
                                },
                            }
                        },
                    };
                    if !send_or_cancel(&senders[index], result, &cancel).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );

        receivers
    }
}
