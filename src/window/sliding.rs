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

/// Overlapping windows of wall-clock time: `size` wide, starting every
/// `slide`. `size` must be an exact multiple of `slide` so that every
/// instant belongs to the same fixed number of windows (`size / slide`),
/// which keeps window boundaries anchored and predictable.
///
/// Unlike `TumblingWindow`, a single success here is forwarded once *per
/// window it belongs to* -- `size / slide` copies when `size > slide` --
/// each carrying its own `window_start`/`window_end` pair. That's the
/// reason windowing is a per-item tagging pass rather than a batching
/// pass: a `Collector` downstream is what reassembles a given window's
/// full membership.
pub struct SlidingWindow<T, C: Clock = RealClock> {
    name: String,
    size: Duration,
    slide: Duration,
    capacity: usize,
    clock: C,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + Clone + 'static> SlidingWindow<T, RealClock> {
    pub fn new(size: Duration, slide: Duration) -> Self {
        assert!(!slide.is_zero(), "slide must be positive");
        assert!(size >= slide, "size must be at least slide");
        assert_eq!(
            size.as_nanos() % slide.as_nanos(),
            0,
            "size must be an exact multiple of slide"
        );
        SlidingWindow {
            name: "sliding_window".to_owned(),
            size,
            slide,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Clone + 'static, C: Clock> SlidingWindow<T, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> SlidingWindow<T, C2> {
        SlidingWindow {
            name: self.name,
            size: self.size,
            slide: self.slide,
            capacity: self.capacity,
            clock,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Clone + 'static, C: Clock> Processor<T, T> for SlidingWindow<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let clock = self.clock.clone();
        let size = self.size;
        let slide = self.slide;
        let name = self.name.clone();
        let memberships = (size.as_nanos() / slide.as_nanos()) as u128;

        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    match result {
                        Result::Error(..) => {
                            if !send_or_cancel(&tx, result, &cancel).await {
                                break;
                            }
                        }
                        Result::Value(v, _) => {
                            let slide_nanos = slide.as_nanos();
                            let epoch_nanos = clock.now().duration_since_epoch().as_nanos();
                            let k_max = epoch_nanos / slide_nanos;
                            let k_min = k_max.saturating_sub(memberships.saturating_sub(1));

                            let mut stopped = false;
                            for k in k_min..=k_max {
                                let start_nanos = k * slide_nanos;
                                let start = Instant::from_duration_since_epoch(Duration::from_nanos(
                                    start_nanos as u64,
                                ));
                                let end = start + size;
                                let metadata = Metadata::empty()
                                    .with(keys::WINDOW_START, start)
                                    .with(keys::WINDOW_END, end)
                                    .with(keys::WINDOW_TYPE, window_type::SLIDING)
                                    .with(keys::WINDOW_SIZE, size)
                                    .with(keys::WINDOW_SLIDE, slide);
                                let tagged = Result::Value(v.clone(), metadata);
                                if !send_or_cancel(&tx, tagged, &cancel).await {
                                    stopped = true;
                                    break;
                                }
                            }
                            if stopped {
                                break;
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
    async fn each_item_is_tagged_into_every_overlapping_window() {
        let (tx, rx) = channel::<i32>(32);
        let cancel = CancellationToken::new();
        let clock = VirtualClock::new();
        // 3 windows wide, slide 1: every item belongs to 3 windows.
        let window = SlidingWindow::new(Duration::from_millis(300), Duration::from_millis(100))
            .with_clock(clock.clone());
        let mut out = window.process(cancel.clone(), rx);

        // Advance past the first couple of slide boundaries so k_min doesn't
        // saturate to zero in a way that changes the membership count.
        clock.advance(Duration::from_millis(300)).await;
        tx.send(Result::success(1)).await.unwrap();
        tokio::task::yield_now().await;

        let mut seen = Vec::new();
        for _ in 0..3 {
            let r = out.recv().await.unwrap();
            seen.push(r.get_instant_metadata(keys::WINDOW_START).found().unwrap());
        }
        seen.sort();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[1].saturating_duration_since(seen[0]),
            Duration::from_millis(100)
        );
        assert_eq!(
            seen[2].saturating_duration_since(seen[1]),
            Duration::from_millis(100)
        );
        drop(tx);
    }

    #[tokio::test]
    async fn size_equal_to_slide_behaves_like_a_single_window() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let window = SlidingWindow::new(Duration::from_millis(50), Duration::from_millis(50));
        let mut out = window.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        let tagged = out.recv().await.unwrap();
        assert_eq!(*tagged.value().unwrap(), 1);
        assert!(out.try_recv().is_err());
        drop(tx);
    }
}
