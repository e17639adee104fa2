//! The uniform processor contract: a component whose worker task turns a
//! `Receiver<Result<In>>` into a `Receiver<Result<Out>>`.

pub use tokio_util::sync::CancellationToken;

use crate::Result;

/// Default bounded channel capacity used when a processor constructor
/// doesn't expose its own. Chosen to give a little slack for bursts
/// without hiding unbounded backpressure problems in tests.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

pub type Sender<T> = tokio::sync::mpsc::Sender<Result<T>>;
pub type Receiver<T> = tokio::sync::mpsc::Receiver<Result<T>>;

pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    tokio::sync::mpsc::channel(capacity)
}

/// A uniform operation over a lazy sequence of Results: given a
/// cancellation token and an input channel, spawn a worker task and return
/// an output channel.
///
/// Implementations must:
/// 1. Drain `input` until it terminates or `cancel` fires.
/// 2. Drop the returned `Sender` on exit -- that's the only termination
///    signal downstream stages observe.
/// 3. Never `.send().await` without also racing `cancel.cancelled()`.
/// 4. Never let a single item's failure panic the worker; convert it to an
///    error `Result` instead.
pub trait Processor<In, Out>: Send + Sync + 'static {
    /// Name used for diagnostics, `tracing` spans, and `StreamError`
    /// processor identity.
    fn name(&self) -> &str;

    fn process(&self, cancel: CancellationToken, input: Receiver<In>) -> Receiver<Out>;
}

/// Receive the next item from `rx`, but give up early (returning `None`) if
/// `cancel` fires first. Paired with `send_or_cancel`, this is the only
/// suspension-point idiom processor worker loops need.
pub(crate) async fn recv_or_cancel<T>(
    rx: &mut Receiver<T>,
    cancel: &CancellationToken,
) -> Option<Result<T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Send `item` on `tx`, but give up (returning `false`) if `cancel` fires
/// first. This is the one suspension point every processor worker loop
/// funnels its sends through, so cancellation is always observed even when
/// downstream is applying backpressure.
pub(crate) async fn send_or_cancel<T>(
    tx: &Sender<T>,
    item: Result<T>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        outcome = tx.send(item) => outcome.is_ok(),
    }
}
