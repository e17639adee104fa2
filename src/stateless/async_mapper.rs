use std::{collections::BTreeMap, future::Future, pin::Pin, sync::Arc};

use tracing::Instrument;

use crate::{
    clock::{Clock, RealClock},
    error::{ErrorKind, StreamError},
    processor::{
        channel, send_or_cancel, CancellationToken, Receiver, Sender, DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

type AsyncFn<T, U> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = anyhow::Result<U>> + Send>> + Send + Sync>;

enum Completion<U> {
    Item(u64, Result<U>),
    InputDone(u64),
}

/// Apply `f` concurrently across `workers` tasks while preserving input
/// order on output. Ordering is recovered by tagging each input with a
/// sequence number and holding completions in a reorder buffer keyed by
/// that sequence until it's their turn.
pub struct AsyncMapper<T, U, C: Clock = RealClock> {
    name: String,
    f: AsyncFn<T, U>,
    workers: usize,
    capacity: usize,
    clock: C,
}

impl<T: Send + 'static, U: Send + 'static> AsyncMapper<T, U, RealClock> {
    pub fn new<Fut>(workers: usize, f: impl Fn(T) -> Fut + Send + Sync + 'static) -> Self
    where
        Fut: Future<Output = anyhow::Result<U>> + Send + 'static,
    {
        AsyncMapper {
            name: "async_mapper".to_owned(),
            f: Arc::new(move |v| Box::pin(f(v))),
            workers: workers.max(1),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
        }
    }
}

impl<T: Send + 'static, U: Send + 'static, C: Clock> AsyncMapper<T, U, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> AsyncMapper<T, U, C2> {
        AsyncMapper {
            name: self.name,
            f: self.f,
            workers: self.workers,
            capacity: self.capacity,
            clock,
        }
    }
}

impl<T: Send + 'static, U: Send + 'static, C: Clock> Processor<T, U> for AsyncMapper<T, U, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<U> {
        let (tx, rx): (Sender<U>, Receiver<U>) = channel(self.capacity);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.workers));
        let (completion_tx, mut completion_rx) =
            tokio::sync::mpsc::unbounded_channel::<Completion<U>>();
        let f = self.f.clone();
        let name = self.name.clone();
        let clock = self.clock.clone();

        // Dispatcher: reads input, spawns bounded-concurrency workers.
        let dispatch_cancel = cancel.clone();
        let dispatch_name = name.clone();
        tokio::spawn(
            async move {
                let mut seq: u64 = 0;
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = dispatch_cancel.cancelled() => break,
                        item = input.recv() => item,
                    };
                    let Some(result) = item else { break };
                    let permit = tokio::select! {
                        biased;
                        _ = dispatch_cancel.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => {
                            permit.expect("semaphore is never closed")
                        }
                    };
                    let my_seq = seq;
                    seq += 1;
                    let f = f.clone();
                    let completion_tx = completion_tx.clone();
                    let clock = clock.clone();
                    let worker_name = dispatch_name.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let mapped = match result {
                            Result::Error(e, m) => Result::Error(e.retype(), m),
                            Result::Value(v, m) => match f(v).await {
                                Ok(u) => Result::Value(u, m),
                                Err(cause) => Result::from_stream_error(
                                    StreamError::new(
                                        (),
                                        cause,
                                        worker_name,
                                        ErrorKind::ProcessorInternal,
                                        clock.now(),
                                    )
                                    .retype::<U>(),
                                )
                                .with_metadata_map(m),
                            },
                        };
                        let _ = completion_tx.send(Completion::Item(my_seq, mapped));
                    });
                }
                let _ = completion_tx.send(Completion::InputDone(seq));
            }
            .instrument(tracing::info_span!("processor.dispatch", name = %name)),
        );

        // Reorder: buffers completions, emitting strictly in sequence order.
        let reorder_name = self.name.clone();
        tokio::spawn(
            async move {
                let mut next: u64 = 0;
                let mut total: Option<u64> = None;
                let mut pending: BTreeMap<u64, Result<U>> = BTreeMap::new();
                loop {
                    if let Some(total) = total {
                        if next >= total {
                            break;
                        }
                    }
                    let completion = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        c = completion_rx.recv() => c,
                    };
                    match completion {
                        None => break,
                        Some(Completion::InputDone(count)) => total = Some(count),
                        Some(Completion::Item(seq, result)) => {
                            pending.insert(seq, result);
                        },
                    }
                    while let Some(result) = pending.remove(&next) {
                        next += 1;
                        if !send_or_cancel(&tx, result, &cancel).await {
                            return;
                        }
                        if let Some(total) = total {
                            if next >= total {
                                return;
                            }
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("processor.reorder", name = %reorder_name)),
        );

        rx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::processor::channel;

    #[tokio::test]
    async fn preserves_order_under_variable_latency() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let mapper = AsyncMapper::new(4, |n: i32| async move {
            tokio::time::sleep(Duration::from_millis(((10 - n).max(0)) as u64)).await;
            Ok(n * 2)
        });
        let mut out = mapper.process(cancel.clone(), rx);

        for n in 1..=10 {
            tx.send(Result::success(n)).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(r) = out.recv().await {
            seen.push(*r.value().unwrap());
        }
        assert_eq!(seen, (1..=10).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn propagates_errors_without_invoking_f() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let mapper = AsyncMapper::new(2, |n: i32| async move { Ok(n) });
        let mut out = mapper.process(cancel.clone(), rx);

        let clock = RealClock::new();
        tx.send(Result::error(1, anyhow::anyhow!("boom"), "test", clock.now()))
            .await
            .unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert!(first.is_error());
        assert!(out.recv().await.is_none());
    }
}
