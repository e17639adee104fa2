use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tracing::Instrument;

use crate::{
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Run `f` as a side effect for every item (success or error) without
/// altering the stream. A panic inside `f` is caught and logged rather
/// than propagated, per the crate-wide rule that one item's failure never
/// takes down a worker task.
pub struct Tap<T> {
    name: String,
    f: Arc<dyn Fn(&Result<T>) + Send + Sync>,
    capacity: usize,
}

impl<T: Send + 'static> Tap<T> {
    pub fn new(f: impl Fn(&Result<T>) + Send + Sync + 'static) -> Self {
        Tap {
            name: "tap".to_owned(),
            f: Arc::new(f),
            capacity: DEFAULT_CHANNEL_CAPACITY,
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

impl<T: Send + 'static> Processor<T, T> for Tap<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let f = self.f.clone();
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let f = f.clone();
                    let tap_name = name.clone();
                    let outcome = AssertUnwindSafe(async { f(&result) }).catch_unwind().await;
                    if let Err(panic) = outcome {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "non-string panic payload".to_owned());
                        tracing::error!(processor = %tap_name, panic = %msg, "tap callback panicked");
                    }
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::processor::channel;

    #[tokio::test]
    async fn invokes_callback_without_altering_the_stream() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let tap = Tap::new(move |_r: &Result<i32>| {
            seen_clone.fetch_add(1, Ordering::Relaxed);
        });
        let mut out = tap.process(cancel.clone(), rx);

        for v in [1, 2, 3] {
            tx.send(Result::success(v)).await.unwrap();
        }
        drop(tx);

        let mut values = Vec::new();
        while let Some(r) = out.recv().await {
            values.push(*r.value().unwrap());
        }
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(seen.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn survives_a_panicking_callback() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let tap = Tap::new(|r: &Result<i32>| {
            if *r.value().unwrap() == 2 {
                panic!("boom");
            }
        });
        let mut out = tap.process(cancel.clone(), rx);

        for v in [1, 2, 3] {
            tx.send(Result::success(v)).await.unwrap();
        }
        drop(tx);

        let mut values = Vec::new();
        while let Some(r) = out.recv().await {
            values.push(*r.value().unwrap());
        }
        assert_eq!(values, vec![1, 2, 3]);
    }
}
