//! Running fold aggregation with count and/or time triggers.

use std::{sync::Arc, time::Duration};

use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock, Ticker},
    processor::{
        channel, send_or_cancel, CancellationToken, Receiver, Sender, DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

async fn next_tick(ticker: &mut Option<Ticker>) -> Option<Instant> {
    match ticker {
        Some(ticker) => ticker.recv().await,
        None => std::future::pending().await,
    }
}

/// Fold successes into a running accumulator, emitting it whenever a
/// count trigger (`trigger_every`), a time trigger (`trigger_interval`),
/// or input close occurs -- whichever fires first resets the accumulator
/// for the other. At least one trigger must be configured.
///
/// Error Results never touch the accumulator: they're forwarded unchanged
/// to a dedicated error channel, so a user-supplied fold function never
/// has to special-case failure.
pub struct Aggregator<T, Acc, C: Clock = RealClock> {
    name: String,
    init: Arc<dyn Fn() -> Acc + Send + Sync>,
    fold: Arc<dyn Fn(Acc, T) -> Acc + Send + Sync>,
    count_trigger: Option<usize>,
    time_trigger: Option<Duration>,
    emit_empty: bool,
    capacity: usize,
    clock: C,
}

impl<T: Send + 'static, Acc: Send + 'static> Aggregator<T, Acc, RealClock> {
    pub fn new(
        init: impl Fn() -> Acc + Send + Sync + 'static,
        fold: impl Fn(Acc, T) -> Acc + Send + Sync + 'static,
    ) -> Self {
        Aggregator {
            name: "aggregator".to_owned(),
            init: Arc::new(init),
            fold: Arc::new(fold),
            count_trigger: None,
            time_trigger: None,
            emit_empty: false,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
        }
    }
}

impl<T: Send + 'static, Acc: Send + 'static, C: Clock> Aggregator<T, Acc, C> {
    pub fn trigger_every(mut self, count: usize) -> Self {
        assert!(count > 0, "count trigger must be at least 1");
        self.count_trigger = Some(count);
        self
    }

    pub fn trigger_interval(mut self, interval: Duration) -> Self {
        self.time_trigger = Some(interval);
        self
    }

    /// Emit at a time-trigger tick even if no items arrived since the last
    /// emission. Has no effect on the count trigger, which can only ever
    /// fire once `count` items have arrived.
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

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Aggregator<T, Acc, C2> {
        Aggregator {
            name: self.name,
            init: self.init,
            fold: self.fold,
            count_trigger: self.count_trigger,
            time_trigger: self.time_trigger,
            emit_empty: self.emit_empty,
            capacity: self.capacity,
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `(accumulator_output, error_output)`.
    pub fn process(
        &self,
        cancel: CancellationToken,
        mut input: Receiver<T>,
    ) -> (Receiver<Acc>, Receiver<T>) {
        assert!(
            self.count_trigger.is_some() || self.time_trigger.is_some(),
            "Aggregator needs at least one of trigger_every/trigger_interval"
        );

        let (acc_tx, acc_rx): (Sender<Acc>, Receiver<Acc>) = channel(self.capacity);
        let (err_tx, err_rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let init = self.init.clone();
        let fold = self.fold.clone();
        let count_trigger = self.count_trigger;
        let emit_empty = self.emit_empty;
        let clock = self.clock.clone();
        let mut ticker = self.time_trigger.map(|interval| clock.ticker(interval));
        let name = self.name.clone();

        tokio::spawn(
            async move {
                let mut acc = init();
                let mut count: usize = 0;

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = input.recv() => {
                            match result {
                                None => {
                                    if count > 0 || emit_empty {
                                        let done = std::mem::replace(&mut acc, init());
                                        let _ = send_or_cancel(&acc_tx, Result::success(done), &cancel).await;
                                    }
                                    break;
                                },
                                Some(Result::Error(e, m)) => {
                                    if !send_or_cancel(&err_tx, Result::Error(e, m), &cancel).await {
                                        return;
                                    }
                                },
                                Some(Result::Value(v, _)) => {
                                    acc = fold(acc, v);
                                    count += 1;
                                    if count_trigger.is_some_and(|n| count >= n) {
                                        let done = std::mem::replace(&mut acc, init());
                                        count = 0;
                                        if !send_or_cancel(&acc_tx, Result::success(done), &cancel).await {
                                            return;
                                        }
                                    }
                                },
                            }
                        }
                        tick = next_tick(&mut ticker) => {
                            if tick.is_none() {
                                continue;
                            }
                            if count > 0 || emit_empty {
                                let done = std::mem::replace(&mut acc, init());
                                count = 0;
                                if !send_or_cancel(&acc_tx, Result::success(done), &cancel).await {
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

        (acc_rx, err_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::VirtualClock, processor::channel};

    #[tokio::test]
    async fn count_trigger_emits_every_n_items() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let aggregator = Aggregator::new(|| 0i32, |acc, v| acc + v).trigger_every(3);
        let (mut out, mut errs) = aggregator.process(cancel.clone(), rx);

        for v in [1, 2, 3, 4, 5, 6, 7] {
            tx.send(Result::success(v)).await.unwrap();
        }
        drop(tx);

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value().unwrap(), 6);
        let second = out.recv().await.unwrap();
        assert_eq!(*second.value().unwrap(), 15);
        let third = out.recv().await.unwrap();
        assert_eq!(*third.value().unwrap(), 7);
        assert!(out.recv().await.is_none());
        assert!(errs.try_recv().is_err());
    }

    #[tokio::test]
    async fn errors_are_forwarded_to_a_separate_channel() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let aggregator = Aggregator::new(|| 0i32, |acc, v| acc + v).trigger_every(2);
        let (mut out, mut errs) = aggregator.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        tx.send(Result::error(
            2,
            anyhow::anyhow!("boom"),
            "test",
            VirtualClock::new().now(),
        ))
        .await
        .unwrap();
        tx.send(Result::success(3)).await.unwrap();
        drop(tx);

        let err = errs.recv().await.unwrap();
        assert!(err.is_error());
        let acc = out.recv().await.unwrap();
        assert_eq!(*acc.value().unwrap(), 4);
    }

    #[tokio::test]
    async fn time_trigger_emits_on_tick_and_skips_empty_windows_by_default() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let aggregator = Aggregator::new(|| 0i32, |acc, v| acc + v)
            .trigger_interval(Duration::from_millis(100))
            .with_clock(clock.clone());
        let (mut out, _errs) = aggregator.process(cancel.clone(), rx);

        tx.send(Result::success(5)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(100)).await;
        let first = out.recv().await.unwrap();
        assert_eq!(*first.value().unwrap(), 5);

        // No items arrived this window; nothing should be emitted.
        clock.advance(Duration::from_millis(100)).await;
        assert!(out.try_recv().is_err());

        drop(tx);
    }
}
