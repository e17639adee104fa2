use std::{marker::PhantomData, time::Duration};

use tracing::Instrument;

use crate::{
    clock::{Clock, Instant, RealClock},
    metadata::{keys, window_type, Metadata},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Processor, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Result,
};

/// Fixed, non-overlapping windows of wall-clock time. Every success is
/// tagged with the `[window_start, window_end)` slot its arrival time
/// falls into and forwarded immediately -- see the module doc comment for
/// why tagging (rather than batching) is this processor's job.
pub struct TumblingWindow<T, C: Clock = RealClock> {
    name: String,
    size: Duration,
    capacity: usize,
    clock: C,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> TumblingWindow<T, RealClock> {
    pub fn new(size: Duration) -> Self {
        assert!(!size.is_zero(), "window size must be positive");
        TumblingWindow {
            name: "tumbling_window".to_owned(),
            size,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> TumblingWindow<T, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> TumblingWindow<T, C2> {
        TumblingWindow {
            name: self.name,
            size: self.size,
            capacity: self.capacity,
            clock,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> Processor<T, T> for TumblingWindow<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let clock = self.clock.clone();
        let size = self.size;
        let name = self.name.clone();

        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let tagged = match result {
                        Result::Error(..) => result,
                        Result::Value(v, _) => {
                            let size_nanos = size.as_nanos();
                            let epoch_nanos = clock.now().duration_since_epoch().as_nanos();
                            let start_nanos = (epoch_nanos / size_nanos) * size_nanos;
                            let start = Instant::from_duration_since_epoch(Duration::from_nanos(
                                start_nanos as u64,
                            ));
                            let end = start + size;
                            let metadata = Metadata::empty()
                                .with(keys::WINDOW_START, start)
                                .with(keys::WINDOW_END, end)
                                .with(keys::WINDOW_TYPE, window_type::TUMBLING)
                                .with(keys::WINDOW_SIZE, size);
                            Result::Value(v, metadata)
                        }
                    };
                    if !send_or_cancel(&tx, tagged, &cancel).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );

        rx
    }
}
