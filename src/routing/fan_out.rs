use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

/// Deliver every item to all `outputs` outputs.
///
/// Backpressure policy (documented, not configurable): a single dispatcher
/// loop sends the item to every output in turn and awaits each send before
/// moving to the next output, so a slow or undrained output stalls
/// delivery to *every* output, not just its own. This gives the simplest
/// terminate-together semantics -- all outputs see exactly the same
/// prefix of the stream at any instant -- at the cost of one slow
/// consumer throttling every other consumer. A variant with independent
/// per-output queues (so a slow consumer only falls behind on its own
/// channel) is not implemented; pick `Buffer` in front of an output if
/// that decoupling is needed.
pub struct FanOut<T> {
    name: String,
    outputs: usize,
    capacity: usize,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Clone + Send + 'static> FanOut<T> {
    pub fn new(outputs: usize) -> Self {
        assert!(outputs > 0, "FanOut requires at least one output");
        FanOut {
            name: "fan_out".to_owned(),
            outputs,
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

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Vec<Receiver<T>> {
        let mut senders: Vec<Sender<T>> = Vec::with_capacity(self.outputs);
        let mut receivers: Vec<Receiver<T>> = Vec::with_capacity(self.outputs);
        for _ in 0..self.outputs {
            let (tx, rx) = channel(self.capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        tokio::spawn(async move {
            while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                let last = senders.len() - 1;
                for sender in &senders[..last] {
                    if !send_or_cancel(sender, result.clone(), &cancel).await {
                        return;
                    }
                }
                if !send_or_cancel(&senders[last], result, &cancel).await {
                    return;
                }
            }
        });

        receivers
    }
}
