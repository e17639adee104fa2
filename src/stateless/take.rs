use tracing::Instrument;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Forward only the first `count` successes, then stop -- including
/// ceasing to read from `input` at all, so an unbounded upstream isn't kept
/// alive past the point this stage has lost interest in it. Error Results
/// encountered before the count is reached still pass through and don't
/// count against `count`.
pub struct Take<T> {
    name: String,
    count: usize,
    capacity: usize,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Take<T> {
    pub fn new(count: usize) -> Self {
        Take {
            name: "take".to_owned(),
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

impl<T: Send + 'static> Processor<T, T> for Take<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let mut remaining = self.count;
        let name = self.name.clone();
        tokio::spawn(
            async move {
                if remaining == 0 {
                    return;
                }
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let is_success = result.is_success();
                    if !send_or_cancel(&tx, result, &cancel).await {
                        return;
                    }
                    if is_success {
                        remaining -= 1;
                        if remaining == 0 {
                            return;
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}
