//! The [`Result`] envelope: the universal currency of the pipeline.

use std::borrow::Cow;

use crate::{
    clock::Instant,
    error::{ErrorKind, StreamError},
    metadata::{Metadata, MetadataLookup, MetadataValue},
};

/// Exactly one of a successfully computed value or a [`StreamError`],
/// plus optional immutable metadata.
///
/// Every transformation below returns a *new* `Result`; nothing mutates an
/// existing one in place, so a `Result` that has already been observed
/// downstream never changes under the reader.
pub enum Result<T> {
    Value(T, Metadata),
    Error(StreamError<T>, Metadata),
}

impl<T> Result<T> {
    pub fn success(value: T) -> Self {
        Result::Value(value, Metadata::empty())
    }

    pub fn error(
        item: T,
        cause: impl Into<anyhow::Error>,
        processor: impl Into<Cow<'static, str>>,
        timestamp: Instant,
    ) -> Self {
        Result::from_stream_error(StreamError::new(
            item,
            cause,
            processor,
            ErrorKind::ProcessorInternal,
            timestamp,
        ))
    }

    pub fn error_with_kind(
        item: T,
        cause: impl Into<anyhow::Error>,
        processor: impl Into<Cow<'static, str>>,
        kind: ErrorKind,
        timestamp: Instant,
    ) -> Self {
        Result::from_stream_error(StreamError::new(item, cause, processor, kind, timestamp))
    }

    pub fn from_stream_error(error: StreamError<T>) -> Self {
        Result::Error(error, Metadata::empty())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Result::Value(..))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Result::Error(..))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Result::Value(v, _) => Some(v),
            Result::Error(..) => None,
        }
    }

    pub fn error(&self) -> Option<&StreamError<T>> {
        match self {
            Result::Error(e, _) => Some(e),
            Result::Value(..) => None,
        }
    }

    /// The underlying value, or `T::default()` on an error Result. Never
    /// panics -- an error Result is a legitimate stream element, not a
    /// fault condition.
    pub fn into_value(self) -> T
    where
        T: Default,
    {
        match self {
            Result::Value(v, _) => v,
            Result::Error(..) => T::default(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Result::Value(_, m) | Result::Error(_, m) => m,
        }
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata().has_metadata()
    }

    pub fn get_metadata(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata().get(key)
    }

    pub fn get_string_metadata(&self, key: &str) -> MetadataLookup<&str> {
        self.metadata().get_string(key)
    }

    pub fn get_int_metadata(&self, key: &str) -> MetadataLookup<i64> {
        self.metadata().get_int(key)
    }

    pub fn get_duration_metadata(&self, key: &str) -> MetadataLookup<std::time::Duration> {
        self.metadata().get_duration(key)
    }

    pub fn get_instant_metadata(&self, key: &str) -> MetadataLookup<Instant> {
        self.metadata().get_instant(key)
    }

    pub fn metadata_keys(&self) -> Vec<&str> {
        self.metadata().keys()
    }

    /// Same-type endofunction map: on success, apply `f` to the value; on
    /// error, return `self` unchanged. Metadata is preserved on both
    /// branches. Satisfies `map(f).map(g) == map(compose(g, f))`.
    pub fn map(self, f: impl FnOnce(T) -> T) -> Result<T> {
        match self {
            Result::Value(v, m) => Result::Value(f(v), m),
            Result::Error(e, m) => Result::Error(e, m),
        }
    }

    /// Symmetric counterpart to `map`: on error, apply `f` to the
    /// `StreamError`; on success, return `self` unchanged.
    pub fn map_error(self, f: impl FnOnce(StreamError<T>) -> StreamError<T>) -> Result<T> {
        match self {
            Result::Value(v, m) => Result::Value(v, m),
            Result::Error(e, m) => Result::Error(f(e), m),
        }
    }

    /// Type-changing map used by processors like `Mapper<T, U>` that
    /// produce a different output type. An error Result is re-typed by
    /// carrying forward the cause/processor/kind/timestamp and dropping the
    /// now-untypeable offending item (see `StreamError::retype`), since a
    /// `T -> U` function has no way to produce a `U`-typed item from a
    /// failed `T`.
    pub fn map_into<U>(self, f: impl FnOnce(T) -> U) -> Result<U> {
        match self {
            Result::Value(v, m) => Result::Value(f(v), m),
            Result::Error(e, m) => Result::Error(e.retype(), m),
        }
    }

    /// Fallible counterpart to `map_into`, used by `AsyncMapper` and
    /// similar processors whose transformation itself can fail.
    pub fn try_map_into<U>(
        self,
        f: impl FnOnce(T) -> std::result::Result<U, StreamError<U>>,
    ) -> Result<U> {
        match self {
            Result::Value(v, m) => match f(v) {
                std::result::Result::Ok(u) => Result::Value(u, m),
                std::result::Result::Err(e) => Result::Error(e, m),
            },
            Result::Error(e, m) => Result::Error(e.retype(), m),
        }
    }

    /// Returns a new Result with `key` -> `value` added to a copy of the
    /// existing metadata; `self` is left unchanged. An empty key is a
    /// no-op.
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Result<T>
    where
        T: Clone,
    {
        let metadata = self.metadata().with(key, value);
        match self {
            Result::Value(v, _) => Result::Value(v.clone(), metadata),
            Result::Error(e, _) => Result::Error(e.clone(), metadata),
        }
    }

    /// Replace this Result's metadata wholesale, consuming `self`. Used
    /// internally by windowing processors, which attach a whole batch of
    /// standardized keys at once rather than chaining `with_metadata`.
    pub(crate) fn with_metadata_map(self, metadata: Metadata) -> Result<T> {
        match self {
            Result::Value(v, _) => Result::Value(v, metadata),
            Result::Error(e, _) => Result::Error(e, metadata),
        }
    }
}

impl<T: Clone> Clone for Result<T> {
    fn clone(&self) -> Self {
        match self {
            Result::Value(v, m) => Result::Value(v.clone(), m.clone()),
            Result::Error(e, m) => Result::Error(e.clone(), m.clone()),
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Result<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Result::Value(v, m) => f
                .debug_struct("Value")
                .field("value", v)
                .field("has_metadata", &m.has_metadata())
                .finish(),
            Result::Error(e, m) => f
                .debug_struct("Error")
                .field("error", e)
                .field("has_metadata", &m.has_metadata())
                .finish(),
        }
    }
}
