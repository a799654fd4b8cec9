use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// A time bound that is either an absolute deadline or *unlimited*.
///
/// Everything in this library that takes a time limit takes it as a
/// `TimeArg` so that callers can pass a deadline, a duration measured from
/// now, or no limit at all through one parameter. Durations are converted to
/// deadlines at construction time, so a `TimeArg` built from a duration
/// bounds the whole call it is passed to, not each attempt individually.
///
/// `TimeArg` values are totally ordered with *unlimited* greater than every
/// deadline, which makes `std::cmp::min` the right way to combine two
/// bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeArg {
    deadline: Option<Instant>,
}

impl TimeArg {
    /// A bound infinitely far in the future.
    pub const UNLIMITED: TimeArg = TimeArg { deadline: None };

    /// Bound at the given instant.
    pub fn at(deadline: Instant) -> TimeArg {
        TimeArg {
            deadline: Some(deadline),
        }
    }

    /// Bound at the given duration from now.
    pub fn within(d: Duration) -> TimeArg {
        TimeArg::at(Instant::now() + d)
    }

    pub fn is_unlimited(&self) -> bool {
        self.deadline.is_none()
    }

    /// The deadline, `None` when unlimited.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True if this bound lies in the past. An unlimited bound never passes.
    pub fn has_passed(&self) -> bool {
        match self.deadline {
            Some(d) => d <= Instant::now(),
            None => false,
        }
    }
}

impl Default for TimeArg {
    fn default() -> Self {
        TimeArg::UNLIMITED
    }
}

impl From<Duration> for TimeArg {
    fn from(d: Duration) -> Self {
        TimeArg::within(d)
    }
}

impl From<Instant> for TimeArg {
    fn from(t: Instant) -> Self {
        TimeArg::at(t)
    }
}

impl PartialOrd for TimeArg {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeArg {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.deadline, other.deadline) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unlimited_compares_greatest() {
        let soon = TimeArg::within(Duration::from_millis(5));
        assert!(soon < TimeArg::UNLIMITED);
        assert!(TimeArg::UNLIMITED > soon);
        assert_eq!(
            TimeArg::UNLIMITED.cmp(&TimeArg::UNLIMITED),
            Ordering::Equal
        );
    }

    #[test]
    fn min_picks_the_earlier_bound() {
        let a = TimeArg::within(Duration::from_millis(1));
        let b = TimeArg::within(Duration::from_secs(60));
        assert_eq!(std::cmp::min(a, b), a);
        assert_eq!(std::cmp::min(b, TimeArg::UNLIMITED), b);
    }

    #[test]
    fn passing() {
        assert!(!TimeArg::UNLIMITED.has_passed());
        assert!(TimeArg::at(Instant::now()).has_passed());
        assert!(!TimeArg::within(Duration::from_secs(60)).has_passed());
    }

    #[test]
    fn from_duration_is_a_deadline() {
        let t = TimeArg::from(Duration::from_secs(1));
        assert!(!t.is_unlimited());
        assert!(t.deadline().is_some());
    }
}
