use tracing::Instrument;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Discard the first `count` successes, then forward everything after.
/// Error Results are never counted against `count` and always pass
/// through, even while still skipping.
pub struct Skip<T> {
    name: String,
    count: usize,
    capacity: usize,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Skip<T> {
    pub fn new(count: usize) -> Self {
        Skip {
            name: "skip".to_owned(),
            count,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl<T: Send + 'static> Processor<T, T> for Skip<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let mut remaining = self.count;
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    if result.is_success() && remaining > 0 {
                        remaining -= 1;
                        continue;
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
