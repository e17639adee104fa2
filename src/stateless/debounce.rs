use std::time::Duration;

use tracing::Instrument;

use crate::{
    clock::{Clock, RealClock},
    processor::{
        channel, recv_or_cancel, send_or_cancel, CancellationToken, Receiver, Sender,
        DEFAULT_CHANNEL_CAPACITY,
    },
    Processor, Result,
};

/// Emit the most recent success only once `quiet_period` has elapsed with
/// no further arrivals; every new arrival resets the timer. Error Results
/// bypass debouncing and pass through immediately, without disturbing
/// whatever success is currently pending.
pub struct Debounce<T, C: Clock = RealClock> {
    name: String,
    quiet_period: Duration,
    capacity: usize,
    clock: C,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> Debounce<T, RealClock> {
    pub fn new(quiet_period: Duration) -> Self {
        Debounce {
            name: "debounce".to_owned(),
            quiet_period,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            clock: RealClock::new(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> Debounce<T, C> {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_clock<C2: Clock>(self, clock: C2) -> Debounce<T, C2> {
        Debounce {
            name: self.name,
            quiet_period: self.quiet_period,
            capacity: self.capacity,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Send + 'static, C: Clock> Processor<T, T> for Debounce<T, C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, cancel: CancellationToken, mut input: Receiver<T>) -> Receiver<T> {
        let (tx, rx): (Sender<T>, Receiver<T>) = channel(self.capacity);
        let quiet_period = self.quiet_period;
        let clock = self.clock.clone();
        let name = self.name.clone();
        tokio::spawn(
            async move {
                let mut pending: Option<(Result<T>, crate::clock::Instant)> = None;
                loop {
                    let Some((waiting, deadline)) = pending.take() else {
                        match recv_or_cancel(&mut input, &cancel).await {
                            None => break,
                            Some(Result::Error(e, m)) => {
                                if !send_or_cancel(&tx, Result::Error(e, m), &cancel).await {
                                    return;
                                }
                            },
                            Some(value) => pending = Some((value, clock.now() + quiet_period)),
                        }
                        continue;
                    };

                    // Recompute the remaining wait each pass so an error
                    // bypassing through doesn't reset the deadline for the
                    // value already pending.
                    let remaining = deadline.saturating_duration_since(clock.now());
                    let timer = clock.after(remaining);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = timer => {
                            if !send_or_cancel(&tx, waiting, &cancel).await {
                                return;
                            }
                        }
                        item = input.recv() => {
                            match item {
                                None => {
                                    let _ = send_or_cancel(&tx, waiting, &cancel).await;
                                    break;
                                },
                                Some(Result::Error(e, m)) => {
                                    pending = Some((waiting, deadline));
                                    if !send_or_cancel(&tx, Result::Error(e, m), &cancel).await {
                                        return;
                                    }
                                },
                                Some(value) => pending = Some((value, clock.now() + quiet_period)),
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
