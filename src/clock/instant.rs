use std::{
    ops::{Add, Sub},
    time::Duration,
};

/// A potentially-virtualized point in time.
///
/// Real clocks derive this from a monotonic `std::time::Instant` sampled at
/// clock-construction time; virtual clocks derive it from an internal
/// counter that only moves when a test calls [`super::VirtualClock::advance`].
/// Either way it is represented as a duration since some fixed epoch so that
/// a `VirtualClock` never has to fake `std::time::Instant`, which the
/// standard library does not allow constructing arbitrarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Instant {
    pub(crate) const fn from_duration_since_epoch(d: Duration) -> Self {
        Instant(d)
    }

    pub fn duration_since_epoch(&self) -> Duration {
        self.0
    }

    /// Saturating duration since an earlier instant; zero if `earlier` is
    /// actually later.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    pub fn checked_duration_since(&self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs)
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0 - rhs)
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Instant) -> Duration {
        self.0 - rhs.0
    }
}
