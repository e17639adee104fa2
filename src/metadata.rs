//! Opaque, string-keyed, immutable-after-construction metadata carried by
//! every [`crate::Result`].

use std::{any::Any, collections::HashMap, sync::Arc, time::Duration};

use crate::clock::Instant;

/// An opaque metadata value. `Any` covers library-defined or
/// processor-defined payloads that don't fit the common time/duration/
/// string/int shapes (e.g. `session_id`, a user's own structured tag).
#[derive(Clone)]
pub enum MetadataValue {
    Instant(Instant),
    Duration(Duration),
    String(String),
    Int(i64),
    Any(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataValue::Instant(i) => write!(f, "Instant({:?})", i.duration_since_epoch()),
            MetadataValue::Duration(d) => write!(f, "Duration({d:?})"),
            MetadataValue::String(s) => write!(f, "String({s:?})"),
            MetadataValue::Int(n) => write!(f, "Int({n})"),
            MetadataValue::Any(_) => write!(f, "Any(..)"),
        }
    }
}

impl From<Instant> for MetadataValue {
    fn from(v: Instant) -> Self {
        MetadataValue::Instant(v)
    }
}
impl From<Duration> for MetadataValue {
    fn from(v: Duration) -> Self {
        MetadataValue::Duration(v)
    }
}
impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::String(v)
    }
}
impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::String(v.to_owned())
    }
}
impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Int(v)
    }
}

/// Three-state typed lookup, distinguishing "key absent" from "key present
/// but holding a different variant" -- typed accessors must never panic, so
/// callers get both pieces of information instead of a fallible cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataLookup<T> {
    Absent,
    Found(T),
    WrongType,
}

impl<T> MetadataLookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, MetadataLookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            MetadataLookup::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Metadata map. The `None` state is the zero-metadata case and carries no
/// allocation; `with` always copies rather than aliasing the underlying
/// map, so a parent and a derived child never observe each other's
/// mutations.
#[derive(Clone, Default)]
pub struct Metadata(Option<HashMap<String, MetadataValue>>);

impl Metadata {
    pub fn empty() -> Self {
        Metadata(None)
    }

    pub fn has_metadata(&self) -> bool {
        self.0.as_ref().is_some_and(|m| !m.is_empty())
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.as_ref()?.get(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        match &self.0 {
            Some(m) => m.keys().map(String::as_str).collect(),
            None => Vec::new(),
        }
    }

    /// Returns a new `Metadata` with `key` -> `value` added to a full copy
    /// of the existing entries. An empty key is a no-op returning a clone
    /// of `self`, per the library-wide rule that metadata keys are
    /// non-empty.
    pub fn with(&self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Metadata {
        let key = key.into();
        if key.is_empty() {
            return self.clone();
        }
        let mut map = self.0.clone().unwrap_or_default();
        map.insert(key, value.into());
        Metadata(Some(map))
    }

    pub fn get_string(&self, key: &str) -> MetadataLookup<&str> {
        match self.get(key) {
            None => MetadataLookup::Absent,
            Some(MetadataValue::String(s)) => MetadataLookup::Found(s.as_str()),
            Some(_) => MetadataLookup::WrongType,
        }
    }

    pub fn get_int(&self, key: &str) -> MetadataLookup<i64> {
        match self.get(key) {
            None => MetadataLookup::Absent,
            Some(MetadataValue::Int(n)) => MetadataLookup::Found(*n),
            Some(_) => MetadataLookup::WrongType,
        }
    }

    pub fn get_duration(&self, key: &str) -> MetadataLookup<Duration> {
        match self.get(key) {
            None => MetadataLookup::Absent,
            Some(MetadataValue::Duration(d)) => MetadataLookup::Found(*d),
            Some(_) => MetadataLookup::WrongType,
        }
    }

    pub fn get_instant(&self, key: &str) -> MetadataLookup<Instant> {
        match self.get(key) {
            None => MetadataLookup::Absent,
            Some(MetadataValue::Instant(i)) => MetadataLookup::Found(*i),
            Some(_) => MetadataLookup::WrongType,
        }
    }
}

/// Standardized metadata keys used by the windowing engine and the rest of
/// the library. User-defined keys should be namespaced, e.g.
/// `"my-processor/field"`.
pub mod keys {
    pub const WINDOW_START: &str = "window_start";
    pub const WINDOW_END: &str = "window_end";
    pub const WINDOW_TYPE: &str = "window_type";
    pub const WINDOW_SIZE: &str = "window_size";
    pub const WINDOW_SLIDE: &str = "window_slide";
    pub const WINDOW_GAP: &str = "window_gap";
    pub const SESSION_KEY: &str = "session_key";

    pub const SOURCE: &str = "source";
    pub const TIMESTAMP: &str = "timestamp";
    pub const PROCESSOR: &str = "processor";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const SESSION_ID: &str = "session_id";
}

pub mod window_type {
    pub const TUMBLING: &str = "tumbling";
    pub const SLIDING: &str = "sliding";
    pub const SESSION: &str = "session";
}
