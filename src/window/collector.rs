use std::{collections::HashMap, time::Duration};

use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock},
    error::StreamError,
    metadata::keys,
    processor::{
        channel, send_or_cancel, CancellationToken, Receiver, Sender, DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Every success and error that belonged to one window, as assigned by a
/// `TumblingWindow`/`SlidingWindow`/`SessionWindow` upstream.
pub struct WindowBatch<T> {
    pub window_start: Instant,
    pub window_end: Instant,
    values: Vec<T>,
    errors: Vec<StreamError<T>>,
}

impl<T> WindowBatch<T> {
    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn errors(&self) -> &[StreamError<T>] {
        &self.errors
    }

    pub fn count(&self) -> usize {
        self.values.len() + self.errors.len()
    }

    pub fn success_count(&self) -> usize {
        self.values.len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

struct Group<T> {
    window_start: Instant,
    window_end: Instant,
    values: Vec<T>,
    errors: Vec<StreamError<T>>,
}

#[derive(PartialEq, Eq, Hash, Clone)]
enum GroupKey {
    /// Tumbling/sliding windows: the window's fixed start, in nanoseconds
    /// since the clock's epoch. Not `(start, end)`: within one collector,
    /// every item sharing a `window_start` came from the same upstream
    /// windower call and so always carries the same deterministic
    /// `window_end` (`start + size`) -- the pair can't collide down to a
    /// single start value.
    Fixed(u128),
    /// Session windows: the session id assigned by `SessionWindow`, which
    /// uniquely identifies a session across all keys.
    Session(i64),
}

/// Regroups window-tagged items (from `TumblingWindow`, `SlidingWindow`, or
/// `SessionWindow`) back into completed [`WindowBatch`]es.
///
/// A window is considered closed once this collector's clock passes its
/// `window_end` -- for tumbling/sliding windows that's a fixed point in
/// time computed once; for session windows `window_end` is also fixed,
/// finalized by the session windower at session-closure time and
/// identical across every member, so the same `now > window_end` rule
/// closes both kinds of group. Input items carrying no window metadata
/// are dropped with a warning -- they didn't come from one of the
/// windowers above.
pub struct WindowCollector<T, C: Clock = RealClock> {
    name: String,
    capacity: usize,
    clock: C,
    check_interval: Duration,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> WindowCollector<T, RealClock> {
    pub fn new() -> Self {
        WindowCollector {
            name: "window_collector".to_owned(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static> Default for WindowCollector<T, RealClock> {
    fn default() -> Self {
        WindowCollector::new()
    }
}

impl<T: Send + 'static, C: Clock> WindowCollector<T, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> WindowCollector<T, C2> {
        WindowCollector {
            name: self.name,
            capacity: self.capacity,
            clock,
            check_interval: self.check_interval,
            _marker: std::marker::PhantomData,
        }
    }

}

impl<T: Send + 'static, C: Clock> Processor<T, WindowBatch<T>> for WindowCollector<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        &self,
        cancel: CancellationToken,
        mut input: Receiver<T>,
    ) -> Receiver<WindowBatch<T>> {
        let (tx, rx): (Sender<WindowBatch<T>>, Receiver<WindowBatch<T>>) = channel(self.capacity);
        let clock = self.clock.clone();
        let name = self.name.clone();
        let mut checker = clock.ticker(self.check_interval);

        tokio::spawn(
            async move {
                let mut groups: HashMap<GroupKey, Group<T>> = HashMap::new();

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = input.recv() => {
                            match result {
                                None => break,
                                Some(result) => {
                                    let Some(start) = result.get_instant_metadata(keys::WINDOW_START).found() else {
                                        tracing::warn!(processor = %name, "dropping item with no window metadata");
                                        continue;
                                    };
                                    let Some(end) = result.get_instant_metadata(keys::WINDOW_END).found() else {
                                        tracing::warn!(processor = %name, "dropping item with no window metadata");
                                        continue;
                                    };
                                    let session_id = result.get_int_metadata(keys::SESSION_ID).found();
                                    let key = match session_id {
                                        Some(id) => GroupKey::Session(id),
                                        None => GroupKey::Fixed(start.duration_since_epoch().as_nanos()),
                                    };
                                    let group = groups.entry(key).or_insert_with(|| Group {
                                        window_start: start,
                                        window_end: end,
                                        values: Vec::new(),
                                        errors: Vec::new(),
                                    });
                                    group.window_end = group.window_end.max(end);
                                    match result {
                                        Result::Value(v, _) => group.values.push(v),
                                        Result::Error(e, _) => group.errors.push(e),
                                    }
                                }
                            }
                        }
                        _ = checker.recv() => {
                            let now = clock.now();
                            let expired: Vec<GroupKey> = groups
                                .iter()
                                .filter(|(_, g)| now > g.window_end)
                                .map(|(k, _)| k.clone())
                                .collect();
                            for key in expired {
                                let g = groups.remove(&key).unwrap();
                                let batch = WindowBatch {
                                    window_start: g.window_start,
                                    window_end: g.window_end,
                                    values: g.values,
                                    errors: g.errors,
                                };
                                if !send_or_cancel(&tx, batch, &cancel).await {
                                    checker.stop();
                                    return;
                                }
                            }
                        }
                    }
                }

                for (_, g) in groups.drain() {
                    let batch = WindowBatch {
                        window_start: g.window_start,
                        window_end: g.window_end,
                        values: g.values,
                        errors: g.errors,
                    };
                    if !send_or_cancel(&tx, batch, &cancel).await {
                        break;
                    }
                }
                checker.stop();
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::VirtualClock, metadata::Metadata, window::TumblingWindow};

    #[tokio::test]
    async fn groups_tagged_items_into_a_batch_once_the_window_closes() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        let window = TumblingWindow::new(Duration::from_millis(100)).with_clock(clock.clone());
        let tagged = window.process(cancel.clone(), rx);

        let collector = WindowCollector::new()
            .with_clock(clock.clone())
            .with_check_interval(Duration::from_millis(10));
        let mut out = collector.process(cancel.clone(), tagged);

        tx.send(Result::success(1)).await.unwrap();
        tx.send(Result::success(2)).await.unwrap();
        tokio::task::yield_now().await;

        clock.advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(10)).await;

        let batch = out.recv().await.unwrap();
        assert_eq!(batch.success_count(), 2);
        assert_eq!(batch.values(), &[1, 2]);

        drop(tx);
    }

    #[tokio::test]
    async fn flushes_open_groups_once_input_closes() {
        let (tx, rx) = channel::<i32>(16);
        let cancel = CancellationToken::new();
        let collector = WindowCollector::new();
        let mut out = collector.process(cancel.clone(), rx);

        let metadata = Metadata::empty()
            .with(keys::WINDOW_START, crate::clock::RealClock::new().now())
            .with(keys::WINDOW_END, crate::clock::RealClock::new().now() + Duration::from_secs(60));
        tx.send(Result::Value(1, metadata)).await.unwrap();
        drop(tx);

        let batch = out.recv().await.unwrap();
        assert_eq!(batch.success_count(), 1);
        assert!(out.recv().await.is_none());
    }
}
