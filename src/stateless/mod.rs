//! The "informative" simple stateless processors: each one a small,
//! self-contained worker loop reading `Receiver<Result<In>>` and writing
//! `Receiver<Result<Out>>`.

mod async_mapper;
mod buffer;
mod chunk;
mod debounce;
mod dedupe;
mod filter;
mod flatten;
mod mapper;
mod monitor;
mod partition;
mod sample;
mod skip;
mod take;
mod tap;
mod throttle;

pub use async_mapper::AsyncMapper;
pub use buffer::{Buffer, DroppingBuffer, SlidingBuffer};
pub use chunk::Chunk;
pub use debounce::Debounce;
pub use dedupe::Dedupe;
pub use filter::Filter;
pub use flatten::Flatten;
pub use mapper::Mapper;
pub use monitor::{Monitor, MonitorStats};
pub use partition::Partition;
pub use sample::Sample;
pub use skip::Skip;
pub use take::Take;
pub use tap::Tap;
pub use throttle::Throttle;
