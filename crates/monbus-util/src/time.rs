//! Timeout semantics for event-loop waits
//!
//! A wait is either a one-shot check that never blocks, a bounded wait,
//! or an unbounded wait that never arms a timer.

use std::time::{Duration, Instant};

/// How long an event-loop call may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Check once, do not wait
    Immediate,
    /// Wait at most this long
    After(Duration),
    /// Wait until something happens
    Forever,
}

impl Timeout {
    pub fn from_secs(secs: u64) -> Self {
        Duration::from_secs(secs).into()
    }

    pub fn from_millis(millis: u64) -> Self {
        Duration::from_millis(millis).into()
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }

    /// Absolute deadline for this timeout, `None` for `Forever`.
    ///
    /// A duration too long to be represented as an `Instant` never
    /// expires, the same as `Forever`.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        match self {
            Self::Immediate => Some(now),
            Self::After(duration) => now.checked_add(*duration),
            Self::Forever => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::Immediate
        } else {
            Self::After(duration)
        }
    }
}

impl From<Option<Duration>> for Timeout {
    /// `None` waits forever
    fn from(duration: Option<Duration>) -> Self {
        match duration {
            Some(d) => d.into(),
            None => Self::Forever,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_duration_is_immediate() {
        assert_eq!(Timeout::from(Duration::ZERO), Timeout::Immediate);
        assert_eq!(Timeout::from_secs(0), Timeout::Immediate);
        assert!(Timeout::from_millis(0).is_immediate());
    }

    #[test]
    fn none_is_forever() {
        assert_eq!(Timeout::from(None::<Duration>), Timeout::Forever);
        assert_eq!(
            Timeout::from(Some(Duration::from_secs(2))),
            Timeout::After(Duration::from_secs(2))
        );
    }

    #[test]
    fn deadlines() {
        let now = Instant::now();
        assert_eq!(Timeout::Immediate.deadline_from(now), Some(now));
        assert_eq!(Timeout::Forever.deadline_from(now), None);
        assert_eq!(
            Timeout::from_millis(250).deadline_from(now),
            Some(now + Duration::from_millis(250))
        );
    }

    #[test]
    fn huge_timeout_has_no_deadline() {
        let now = Instant::now();
        assert_eq!(Timeout::from_secs(u64::MAX).deadline_from(now), None);
        assert_eq!(Timeout::After(Duration::MAX).deadline_from(now), None);
    }
}
