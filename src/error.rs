//! Structured failures carried by error [`crate::Result`]s.

use std::{borrow::Cow, fmt};

use crate::clock::Instant;

/// Coarse classification used by retry classifiers, the circuit breaker,
/// and DLQ routing, and surfaced as a `tracing` field on every error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input item itself was invalid.
    InputValidation,
    /// A processor's own logic failed (including recovered panics).
    ProcessorInternal,
    /// A bounded wait (retry backoff, an explicit timeout wrapper) expired.
    Timeout,
    /// The pipeline was cancelled while this item was in flight.
    Cancellation,
    /// A downstream/wrapped processor reported failure.
    UpstreamFailure,
    /// A [`crate::resilience::CircuitBreaker`] short-circuited the call.
    CircuitOpen,
    /// A [`crate::resilience::Retry`] exhausted `max_attempts`.
    RetryExhausted,
    /// A [`crate::resilience::DeadLetterQueue`] could not process the item.
    DlqFailure,
}

impl ErrorKind {
    /// Whether this kind, by default, is worth retrying. Used by
    /// [`crate::resilience::Retry`]'s default classifier.
    pub fn is_transient_by_default(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::UpstreamFailure | ErrorKind::CircuitOpen
        )
    }
}

/// Structured failure: the offending item, the wrapped cause, which
/// processor observed it, and when.
///
/// Mirrors the corpus convention of a stable, matchable `short_msg`
/// alongside a longer human-readable `msg`: `short_msg` is safe to assert
/// on in tests and won't drift if the prose wording changes.
pub struct StreamError<T> {
    item: Option<T>,
    cause: anyhow::Error,
    processor: Cow<'static, str>,
    kind: ErrorKind,
    short_msg: Cow<'static, str>,
    timestamp: Instant,
}

impl<T> StreamError<T> {
    pub fn new(
        item: T,
        cause: impl Into<anyhow::Error>,
        processor: impl Into<Cow<'static, str>>,
        kind: ErrorKind,
        timestamp: Instant,
    ) -> Self {
        let cause = cause.into();
        let short_msg = Cow::Owned(format!("{kind:?}"));
        StreamError {
            item: Some(item),
            cause,
            processor: processor.into(),
            kind,
            short_msg,
            timestamp,
        }
    }

    pub fn with_short_msg(mut self, short_msg: impl Into<Cow<'static, str>>) -> Self {
        self.short_msg = short_msg.into();
        self
    }

    /// The input that caused the failure, if still available. Consumed by
    /// `into_item`; processors that need to retry or DLQ-route the item
    /// should take it immediately rather than holding a reference.
    pub fn item(&self) -> Option<&T> {
        self.item.as_ref()
    }

    pub fn into_item(mut self) -> Option<T> {
        self.item.take()
    }

    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }

    pub fn processor(&self) -> &str {
        &self.processor
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn short_msg(&self) -> &str {
        &self.short_msg
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Map the wrapped cause without touching the item, processor identity,
    /// kind, or timestamp. Used by `Result::map_error`.
    pub fn map_cause(mut self, f: impl FnOnce(anyhow::Error) -> anyhow::Error) -> Self {
        self.cause = f(self.cause);
        self
    }

    /// Re-type this error for a type-changing processor (`Mapper<T, U>` and
    /// friends). The offending item was of type `T`; there is no `U` to
    /// produce, so it is dropped and everything else (cause, processor,
    /// kind, timestamp, short_msg) carries forward unchanged.
    pub fn retype<U>(self) -> StreamError<U> {
        StreamError {
            item: None,
            cause: self.cause,
            processor: self.processor,
            kind: self.kind,
            short_msg: self.short_msg,
            timestamp: self.timestamp,
        }
    }
}

impl<T> fmt::Debug for StreamError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamError")
            .field("processor", &self.processor)
            .field("kind", &self.kind)
            .field("short_msg", &self.short_msg)
            .field("cause", &self.cause)
            .field("has_item", &self.item.is_some())
            .finish()
    }
}

impl<T> fmt::Display for StreamError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({:#})",
            self.processor, self.short_msg, self.cause
        )
    }
}

impl<T: fmt::Debug> std::error::Error for StreamError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

impl<T> Clone for StreamError<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        StreamError {
            item: self.item.clone(),
            // `anyhow::Error` is not `Clone`; re-wrap its display as a fresh
            // error so cloning a `StreamError` (needed by fan-out) doesn't
            // require cloning the cause chain itself.
            cause: anyhow::anyhow!("{:#}", self.cause),
            processor: self.processor.clone(),
            kind: self.kind,
            short_msg: self.short_msg.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, VirtualClock};
    use std::error::Error as _;

    #[test]
    fn source_reaches_the_wrapped_cause() {
        let clock = VirtualClock::new();
        let err = StreamError::new(
            42,
            anyhow::anyhow!("root cause"),
            "test",
            ErrorKind::ProcessorInternal,
            clock.now(),
        );

        let source = err.source().expect("cause should be reachable");
        assert_eq!(source.to_string(), "root cause");
    }
}
