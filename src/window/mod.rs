//! Temporal windowing. Each windower is a `Processor<T, T>` that tags a
//! passing success with window-membership metadata (start/end/type) and
//! forwards it immediately -- the window itself is never materialized as
//! a batch type. [`collector::WindowCollector`] is the separate stage
//! that groups tagged items back into a completed window.

mod collector;
mod session;
mod sliding;
mod tumbling;

pub use collector::{WindowBatch, WindowCollector};
pub use session::SessionWindow;
pub use sliding::SlidingWindow;
pub use tumbling::TumblingWindow;
