use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tracing::Instrument;

use crate::{
    clock::{Clock, RealClock},
    error::ErrorKind,
    processor::{channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender},
    Processor, Result,
};

/// Emit an input iff `pred(value)` holds. Error Results pass through
/// unchanged. A panic inside `pred` is caught, logged, and turned into an
/// error Result carrying the offending value, rather than taking down the
/// worker task.
pub struct Filter<T, C: Clock = RealClock> {
    name: String,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    capacity: usize,
    clock: C,
}

impl<T: Send + 'static> Filter<T, RealClock> {
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Filter {
            name: "filter".to_owned(),
            predicate: Arc::new(predicate),
            capacity: crate::processor::DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
        }
    }
}

impl<T: Send + 'static, C: Clock> Filter<T, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Filter<T, C2> {
        Filter {
            name: self.name,
            predicate: self.predicate,
            capacity: self.capacity,
            clock,
        }
    }
}

impl<T: Send + 'static, C: Clock> Processor<T, T> for Filter<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let predicate = self.predicate.clone();
        let clock = self.clock.clone();
        let name = self.name.clone();
        tokio::spawn(
            async move {
                while let Some(result) = recv_or_cancel(&mut input, &cancel).await {
                    let (v, m) = match result {
                        Result::Error(e, m) => {
                            if !send_or_cancel(&tx, Result::Error(e, m), &cancel).await {
                                break;
                            }
                            continue;
                        }
                        Result::Value(v, m) => (v, m),
                    };

                    let predicate = predicate.clone();
                    let outcome = AssertUnwindSafe(async { predicate(&v) }).catch_unwind().await;
                    let out = match outcome {
                        Ok(true) => Some(Result::Value(v, m)),
                        Ok(false) => None,
                        Err(panic) => {
                            let msg = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "non-string panic payload".to_owned());
                            tracing::error!(processor = %name, panic = %msg, "filter predicate panicked");
                            let err = Result::error_with_kind(
                                v,
                                anyhow::anyhow!("{msg}"),
                                name.clone(),
                                ErrorKind::ProcessorInternal,
                                clock.now(),
                            )
                            .with_metadata_map(m);
                            Some(err)
                        }
                    };

                    if let Some(out) = out {
                        if !send_or_cancel(&tx, out, &cancel).await {
                            break;
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
    use crate::processor::channel;

    #[tokio::test]
    async fn passes_matching_values_and_all_errors() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let filter = Filter::new(|v: &i32| *v % 2 == 0);
        let mut out = filter.process(cancel.clone(), rx);

        tx.send(Result::success(1)).await.unwrap();
        tx.send(Result::success(2)).await.unwrap();
        tx.send(Result::error(
            3,
            anyhow::anyhow!("boom"),
            "test",
            crate::clock::VirtualClock::new().now(),
        ))
        .await
        .unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value().unwrap(), 2);
        let second = out.recv().await.unwrap();
        assert!(second.is_error());
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn a_panicking_predicate_becomes_an_error_result_not_a_dead_worker() {
        let (tx, rx) = channel::<i32>(8);
        let cancel = CancellationToken::new();
        let filter = Filter::new(|v: &i32| {
            if *v == 13 {
                panic!("unlucky");
            }
            true
        });
        let mut out = filter.process(cancel.clone(), rx);

        tx.send(Result::success(13)).await.unwrap();
        tx.send(Result::success(7)).await.unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert!(first.is_error());
        assert_eq!(first.error().unwrap().kind(), ErrorKind::ProcessorInternal);
        let second = out.recv().await.unwrap();
        assert_eq!(*second.value().unwrap(), 7);
    }
}
