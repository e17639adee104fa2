use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tracing::Instrument;

use crate::{
    clock::{Clock, RealClock},
    error::{ErrorKind, StreamError},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Apply `f` on success, propagating errors unchanged (re-typed per
/// `Result::map_into`). Metadata is preserved in both branches. A panic
/// inside `f` is caught and logged and becomes an error Result (the
/// offending `T` can't be turned back into a `U`, so it's dropped, matching
/// `StreamError::retype`).
pub struct Mapper<T, U, C: Clock = RealClock> {
    name: String,
    f: Arc<dyn Fn(T) -> U + Send + Sync>,
    capacity: usize,
    clock: C,
}

impl<T: Send + 'static, U: Send + 'static> Mapper<T, U, RealClock> {
    pub fn new(f: impl Fn(T) -> U + Send + Sync + 'static) -> Self {
        Mapper {
            name: "mapper".to_owned(),
            f: Arc::new(f),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
        }
    }
}

impl<T: Send + 'static, U: Send + 'static, C: Clock> Mapper<T, U, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Mapper<T, U, C2> {
        Mapper {
            name: self.name,
            f: self.f,
            capacity: self.capacity,
            clock,
        }
    }
}

impl<T: Send + 'static, U: Send + 'static, C: Clock> Processor<T, U> for Mapper<T, U, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<U> {
        let (tx, rx): (Sender<U>, Receiver<U>) = channel(self.capacity);
        let f = self.f.clone();
        let clock = self.clock.clone();
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let mapped: Result<U> = match result {
                        Result::Error(e, m) => Result::Error(e.retype(), m),
                        Result::Value(v, m) => {
                            let f = f.clone();
                            match AssertUnwindSafe(async { f(v) }).catch_unwind().await {
                                Ok(u) => Result::Value(u, m),
                                Err(panic) => {
                                    let msg = panic
                                        .downcast_ref::<&str>()
                                        .map(|s| s.to_string())
                                        .or_else(|| panic.downcast_ref::<String>().cloned())
                                        .unwrap_or_else(|| "non-string panic payload".to_owned());
                                    tracing::error!(processor = %name, panic = %msg, "mapper function panicked");
                                    Result::from_stream_error(
                                        StreamError::new(
                                            (),
                                            anyhow::anyhow!("{msg}"),
                                            name.clone(),
                                            ErrorKind::ProcessorInternal,
                                            clock.now(),
                                        )
                                        .retype::<U>(),
                                    )
                                    .with_metadata_map(m)
                                }
                            }
                        }
                    };
                    if !send_or_cancel(&tx, mapped, &cancel).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}
