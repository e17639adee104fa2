use tracing::Instrument;

use crate::{
    processor::{channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender},
    Processor, Result,
};

/// Group every `size` consecutive successes into a `Vec<T>`. A short final
/// chunk is still emitted when the input closes. Error Results pass
/// through immediately rather than joining a chunk, so a single bad item
/// never delays the whole batch it arrived in.
pub struct Chunk<T> {
    name: String,
    size: usize,
    capacity: usize,
}

impl<T: Send + 'static> Chunk<T> {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "Chunk size must be at least 1");
        Chunk {
            name: "chunk".to_owned(),
            size,
            capacity: crate::processor::DEFAULT_CHANNEL_CAPACITY,
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

impl<T: Send + 'static> Processor<T, Vec<T>> for Chunk<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<Vec<T>> {
        let (tx, rx): (Sender<Vec<T>>, Receiver<Vec<T>>) = channel(self.capacity);
        let size = self.size;
        let name = self.name.clone();
        tokio::spawn(
            async move {
                let mut pending: Vec<T> = Vec::with_capacity(size);
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    match result {
                        Result::Error(e, m) => {
                            if !send_or_cancel(&tx, Result::Error(e.retype(), m), &cancel).await {
                                return;
                            }
                        },
                        Result::Value(v, _) => {
                            pending.push(v);
                            if pending.len() == size {
                                let chunk = std::mem::replace(&mut pending, Vec::with_capacity(size));
                                if !send_or_cancel(&tx, Result::success(chunk), &cancel).await {
                                    return;
                                }
                            }
                        },
                    }
                }
                if !pending.is_empty() {
                    let _ = send_or_cancel(&tx, Result::success(pending), &cancel).await;
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::channel;

    #[tokio::test]
    async fn groups_into_fixed_chunks_with_short_final() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let chunker = Chunk::new(2);
        let mut out = chunker.process(cancel.clone(), rx);

        for v in [1, 2, 3, 4, 5] {
            tx.send(Result::success(v)).await.unwrap();
        }
        drop(tx);

        let first = out.recv().await.unwrap();
        assert_eq!(first.value().unwrap(), &vec![1, 2]);
        let second = out.recv().await.unwrap();
        assert_eq!(second.value().unwrap(), &vec![3, 4]);
        let third = out.recv().await.unwrap();
        assert_eq!(third.value().unwrap(), &vec![5]);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn errors_pass_through_without_joining_a_chunk() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let chunker = Chunk::new(2);
        let mut out = chunker.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        tx.send(Result::error(
            2,
            anyhow::anyhow!("boom"),
            "test",
            crate::clock::VirtualClock::new().now(),
        ))
        .await
        .unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert!(first.is_error());
        let second = out.recv().await.unwrap();
        assert_eq!(second.value().unwrap(), &vec![1]);
    }
}
