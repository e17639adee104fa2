use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    processor::{channel, send_or_cancel, CancellationToken, Receiver, Sender, DEFAULT_CHANNEL_CAPACITY},
    Result,
};

/// Merge several input channels into one. Each input's own relative order
/// is preserved on the merged output, but items from different inputs are
/// interleaved in whatever order they happen to arrive. The output closes
/// once every input has closed, not when the first one does.
pub struct FanIn<T> {
    name: String,
    capacity: usize,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> FanIn<T> {
    pub fn new() -> Self {
        FanIn {
            name: "fan_in".to_owned(),
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

    pub fn process(&self, cancel: CancellationToken, inputs: Vec<Receiver<T>>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        tokio::spawn(async move {
            let streams = inputs.into_iter().map(ReceiverStream::new);
            let mut merged = futures::stream::select_all(streams);
            while let Some(result) = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = merged.next() => item,
            } {
                if !send_or_cancel(&tx, result, &cancel).await {
                    break;
                }
            }
        });
        rx
    }
}

impl<T: Send + 'static> Default for FanIn<T> {
    fn default() -> Self {
        FanIn::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::channel;

    #[tokio::test]
    async fn merges_inputs_preserving_each_inputs_own_order() {
        let cancel = CancellationToken::new();
        let (tx_a, rx_a) = channel::<i32>(8);
        let (tx_b, rx_b) = channel::<i32>(8);
        let fan_in = FanIn::new();
        let mut out = fan_in.process(cancel.clone(), vec![rx_a, rx_b]);

        tx_a.send(Result::success(1)).await.unwrap();
        tx_a.send(Result::success(2)).await.unwrap();
        tx_b.send(Result::success(10)).await.unwrap();
        tx_b.send(Result::success(20)).await.unwrap();
        drop(tx_a);
        drop(tx_b);

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        while let Some(r) = out.recv().await {
            let v = *r.value().unwrap();
            if v < 10 {
                from_a.push(v);
            } else {
                from_b.push(v);
            }
        }
        assert_eq!(from_a, vec![1, 2]);
        assert_eq!(from_b, vec![10, 20]);
    }

    #[tokio::test]
    async fn output_closes_only_once_all_inputs_close() {
        let cancel = CancellationToken::new();
        let (tx_a, rx_a) = channel::<i32>(8);
        let (tx_b, rx_b) = channel::<i32>(8);
        let fan_in = FanIn::new();
        let mut out = fan_in.process(cancel.clone(), vec![rx_a, rx_b]);

        tx_a.send(Result::success(1)).await.unwrap();
        drop(tx_a);
        let first = out.recv().await.unwrap();
        assert_eq!(*first.value().unwrap(), 1);

        // rx_b is still open; the merged output must not have closed.
        assert!(out.try_recv().is_err());

        drop(tx_b);
        assert!(out.recv().await.is_none());
    }
}
