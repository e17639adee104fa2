//! Size- and time-triggered batching, and its inverse.

use std::time::Duration;

use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock, Ticker},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

async fn next_tick(ticker: &mut Option<Ticker>) -> Option<Instant> {
    match ticker {
        Some(ticker) => ticker.recv().await,
        None => std::future::pending().await,
    }
}

/// Group successes into a `Vec<T>`, emitting whenever a count trigger
/// (`trigger_every`), a time trigger (`trigger_interval`), or input close
/// occurs -- the same dual-trigger machinery as [`crate::aggregate::Aggregator`]
/// specialized to "collect into a `Vec`" instead of an arbitrary fold. At
/// least one trigger must be configured.
///
/// Unlike `Aggregator`, which hands error Results to a dedicated channel,
/// `Batcher` passes them through the single output immediately (re-typed to
/// a single-item error rather than a batch), so a bad item never delays or
/// poisons the batch it arrived alongside.
pub struct Batcher<T, C: Clock = RealClock> {
    name: String,
    count_trigger: Option<usize>,
    time_trigger: Option<Duration>,
    emit_empty: bool,
    capacity: usize,
    clock: C,
}

impl<T: Send + 'static> Batcher<T, RealClock> {
    pub fn new() -> Self {
        Batcher {
            name: "batcher".to_owned(),
            count_trigger: None,
            time_trigger: None,
            emit_empty: false,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
        }
    }
}

impl<T: Send + 'static> Default for Batcher<T, RealClock> {
    fn default() -> Self {
        Batcher::new()
    }
}

impl<T: Send + 'static, C: Clock> Batcher<T, C> {
    pub fn trigger_every(mut self, count: usize) -> Self {
        assert!(count > 0, "count trigger must be at least 1");
        self.count_trigger = Some(count);
        self
    }

    pub fn trigger_interval(mut self, interval: Duration) -> Self {
        self.time_trigger = Some(interval);
        self
    }

    /// Emit an empty batch at a time-trigger tick even if no items arrived
    /// since the last emission.
    pub fn emit_on_empty(mut self, emit_empty: bool) -> Self {
        self.emit_empty = emit_empty;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Batcher<T, C2> {
        Batcher {
            name: self.name,
            count_trigger: self.count_trigger,
            time_trigger: self.time_trigger,
            emit_empty: self.emit_empty,
            capacity: self.capacity,
            clock,
        }
    }
}

impl<T: Send + 'static, C: Clock> Processor<T, Vec<T>> for Batcher<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<Vec<T>> {
        assert!(
            self.count_trigger.is_some() || self.time_trigger.is_some(),
            "Batcher needs at least one of trigger_every/trigger_interval"
        );

        let (tx, rx): (Sender<Vec<T>>, Receiver<Vec<T>>) = channel(self.capacity);
        let count_trigger = self.count_trigger;
        let emit_empty = self.emit_empty;
        let clock = self.clock.clone();
        let mut ticker = self.time_trigger.map(|interval| clock.ticker(interval));
        let name = self.name.clone();

        tokio::spawn(
            async move {
                let mut pending: Vec<T> = Vec::new();

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = input.recv() => {
                            match result {
                                None => {
                                    if !pending.is_empty() || emit_empty {
                                        let batch = std::mem::take(&mut pending);
                                        let _ = send_or_cancel(&tx, Result::success(batch), &cancel).await;
                                    }
                                    break;
                                }
                                Some(Result::Error(e, m)) => {
                                    if !send_or_cancel(&tx, Result::Error(e.retype(), m), &cancel).await {
                                        return;
                                    }
                                }
                                Some(Result::Value(v, _)) => {
                                    pending.push(v);
                                    if count_trigger.is_some_and(|n| pending.len() >= n) {
                                        let batch = std::mem::take(&mut pending);
                                        if !send_or_cancel(&tx, Result::success(batch), &cancel).await {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        tick = next_tick(&mut ticker) => {
                            if tick.is_none() {
                                continue;
                            }
                            if !pending.is_empty() || emit_empty {
                                let batch = std::mem::take(&mut pending);
                                if !send_or_cancel(&tx, Result::success(batch), &cancel).await {
                                    return;
                                }
                            }
                        }
                    }
                }
                if let Some(ticker) = &ticker {
                    ticker.stop();
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );

        rx
    }
}

/// Inverse of `Batcher`: flattens each success `Vec<T>` back into a stream
/// of individual `T` successes, each sharing the batch's metadata. An error
/// Result passes through as a single re-typed error element.
pub struct Unbatcher<T> {
    name: String,
    capacity: usize,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Unbatcher<T> {
    pub fn new() -> Self {
        Unbatcher {
            name: "unbatcher".to_owned(),
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

impl<T: Send + 'static> Default for Unbatcher<T> {
    fn default() -> Self {
        Unbatcher::new()
    }
}

impl<T: Send + 'static> Processor<Vec<T>, T> for Unbatcher<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<Vec<T>>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    match result {
                        Result::Error(e, m) => {
                            if !send_or_cancel(&tx, Result::Error(e.retype(), m), &cancel).await {
                                return;
                            }
                        }
                        Result::Value(items, m) => {
                            for item in items {
                                let out = Result::success(item).with_metadata_map(m.clone());
                                if !send_or_cancel(&tx, out, &cancel).await {
                                    return;
                                }
                            }
                        }
                    }
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
    use crate::clock::VirtualClock;

    #[tokio::test]
    async fn count_trigger_emits_fixed_size_batches_with_short_final() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let batcher = Batcher::new().trigger_every(2);
        let mut out = batcher.process(cancel.clone(), rx);

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
    async fn errors_pass_through_without_joining_a_batch() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let batcher = Batcher::new().trigger_every(2);
        let mut out = batcher.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        tx.send(Result::error(
            2,
            anyhow::anyhow!("boom"),
            "test",
            VirtualClock::new().now(),
        ))
        .await
        .unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert!(first.is_error());
        let second = out.recv().await.unwrap();
        assert_eq!(second.value().unwrap(), &vec![1]);
    }

    #[tokio::test]
    async fn time_trigger_flushes_a_partial_batch_on_tick() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let batcher = Batcher::new()
            .trigger_interval(Duration::from_millis(100))
            .with_clock(clock.clone());
        let mut out = batcher.process(cancel.clone(), rx);

        tx.send(Result::success(5)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(100)).await;

        let first = out.recv().await.unwrap();
        assert_eq!(first.value().unwrap(), &vec![5]);

        clock.advance(Duration::from_millis(100)).await;
        assert!(out.try_recv().is_err());

        drop(tx);
    }

    #[tokio::test]
    async fn unbatcher_flattens_batches_preserving_metadata() {
        let (tx, rx) = channel::<Vec<i32>>(8);
        let cancel = CancellationToken::new();
        let unbatcher = Unbatcher::new();
        let mut out = unbatcher.process(cancel.clone(), rx);

        let batch = Result::success(vec![1, 2, 3]).with_metadata("batch_id", 7i64);
        tx.send(batch).await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(r) = out.recv().await {
            assert_eq!(r.get_int_metadata("batch_id").found().unwrap(), 7);
            seen.push(*r.value().unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
