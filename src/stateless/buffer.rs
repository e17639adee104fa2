use std::{
    collections::VecDeque,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tracing::Instrument;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Decouple upstream production from downstream consumption with a bounded
/// queue of `capacity` items. Full backpressure: once the queue is full,
/// the worker blocks on the upstream send (the channel capacity *is* the
/// buffer -- there's no separate internal queue to manage).
pub struct Buffer<T> {
    name: String,
    capacity: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> Buffer<T> {
    pub fn new(capacity: usize) -> Self {
        Buffer {
            name: "buffer".to_owned(),
            capacity: capacity.max(1),
            _marker: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl<T: Send + 'static> Processor<T, T> for Buffer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    if !send_or_cancel(&tx, result, &cancel).await {
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}

enum Eviction {
    /// Drop the newly arrived item; whatever is already buffered stays.
    DropNewest,
    /// Drop the oldest buffered item to make room for the new one, so the
    /// buffer always holds the most recent `capacity` items.
    DropOldest,
}

/// An internal ring buffer decoupled from the output channel's own
/// capacity, so eviction decisions are made against `capacity` regardless
/// of how fast the downstream consumer drains. Only recorded while the
/// worker is making forward progress; on cancellation the worker exits
/// without flushing or counting further drops.
async fn run_ring_buffer<T: Send + 'static>(
    mut input: Receiver<T>,
    tx: Sender<T>,
    cancel: CancellationToken,
    capacity: usize,
    eviction: Eviction,
    dropped: Arc<AtomicU64>,
) {
    let mut ring: VecDeque<Result<T>> = VecDeque::new();
    let mut input_open = true;
    loop {
        if ring.is_empty() && !input_open {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = input.recv(), if input_open => {
                match item {
                    None => input_open = false,
                    Some(result) => {
                        if ring.len() >= capacity {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            match eviction {
                                Eviction::DropNewest => continue,
                                Eviction::DropOldest => { ring.pop_front(); },
                            }
                        }
                        ring.push_back(result);
                    }
                }
            },
            permit = tx.reserve(), if !ring.is_empty() => {
                match permit {
                    Ok(permit) => {
                        permit.send(ring.pop_front().expect("checked non-empty above"));
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

/// Like `Buffer`, but on overflow drops the newly arriving item rather than
/// applying backpressure to upstream.
pub struct DroppingBuffer<T> {
    name: String,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> DroppingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        DroppingBuffer {
            name: "dropping_buffer".to_owned(),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
            _marker: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Count of items dropped so far. Safe to read from the caller while
    /// the worker runs -- it shares the same counter.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Processor<T, T> for DroppingBuffer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(DEFAULT_CHANNEL_CAPACITY);
        let name = self.name.clone();
        let capacity = self.capacity;
        let dropped = self.dropped.clone();
        tokio::spawn(
            run_ring_buffer(input, tx, cancel, capacity, Eviction::DropNewest, dropped)
                .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}

/// Like `DroppingBuffer`, but evicts the *oldest* buffered item on
/// overflow, so a slow consumer always sees a contiguous window of the
/// most recent `capacity` items rather than whatever arrived first.
pub struct SlidingBuffer<T> {
    name: String,
    capacity: usize,
    dropped: Arc<AtomicU64>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> SlidingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        SlidingBuffer {
            name: "sliding_buffer".to_owned(),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
            _marker: PhantomData,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Processor<T, T> for SlidingBuffer<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(DEFAULT_CHANNEL_CAPACITY);
        let name = self.name.clone();
        let capacity = self.capacity;
        let dropped = self.dropped.clone();
        tokio::spawn(
            run_ring_buffer(input, tx, cancel, capacity, Eviction::DropOldest, dropped)
                .instrument(tracing::info_span!("processor", name = %name)),
        );
        rx
    }
}
