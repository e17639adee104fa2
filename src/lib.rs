//! `flowline` -- composable, concurrent stream processing pipelines.
//!
//! A pipeline is built out of **stages**: sources produce [`Result`]
//! values, [`Processor`]s transform/route/aggregate them, sinks consume
//! them. Each stage owns one or more worker tasks that terminate when
//! either the upstream channel closes or a
//! [`tokio_util::sync::CancellationToken`] fires.
//!
//! Start with [`Result`] (the envelope every stage speaks) and
//! [`Processor`] (the contract every stage implements), then look at
//! [`clock`] for the time abstraction that makes windowing and resilience
//! deterministically testable.

pub mod aggregate;
pub mod batch;
pub mod clock;
pub mod error;
pub mod metadata;
pub mod processor;
pub mod resilience;
pub mod routing;
pub mod stateless;
pub mod window;

mod result;

pub use clock::{Clock, RealClock, VirtualClock};
pub use error::{ErrorKind, StreamError};
pub use metadata::{Metadata, MetadataLookup, MetadataValue};
pub use processor::{channel, CancellationToken, Processor, Receiver, Sender};
pub use result::Result;
