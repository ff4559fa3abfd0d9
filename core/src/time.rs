//! Utilities for timestamps.

use crate::error::Error;
use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use std::{
    fmt::{self, Debug, Display, Formatter},
    future::{ready, Future},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// A clock knows what time it currently is.
pub trait Clock: 'static + Clone + Debug + Sync + Send {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Waits until `duration` has passed on this clock.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// A real clock returns the current wall-clock time.
#[derive(Clone, Copy, Default)]
#[non_exhaustive]
pub struct RealClock {}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

impl Debug for RealClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.now())
    }
}

/// A mock clock for use in testing. Clones are identical: all clones of a given MockClock will
/// be controlled by a controller retrieved from any of the clones.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct MockClock {
    /// The time that this clock will return from [`Self::now`].
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(when: DateTime<Utc>) -> MockClock {
        MockClock {
            current_time: Arc::new(Mutex::new(when)),
        }
    }

    pub fn set(&self, when: DateTime<Utc>) {
        let mut current_time = self.current_time.lock().unwrap_or_else(PoisonError::into_inner);
        *current_time = when;
    }

    pub fn advance(&self, dur: TimeDelta) {
        let mut current_time = self.current_time.lock().unwrap_or_else(PoisonError::into_inner);
        *current_time += dur;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances the clock by `duration` and returns immediately.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX));
        ready(())
    }
}

impl Default for MockClock {
    fn default() -> Self {
        // Sunday, September 9, 2001 1:46:40 AM UTC
        Self::new(DateTime::from_timestamp(1_000_000_000, 0).unwrap_or_default())
    }
}

/// The `restore_point_in_time` cutoff of a commit-log restore, at whole-second precision.
///
/// Rendered as `YYYY:MM:DD HH:MM:SS` in UTC, which is the only format the server accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RestorePointInTime(DateTime<Utc>);

impl RestorePointInTime {
    pub const FORMAT: &'static str = "%Y:%m:%d %H:%M:%S";

    /// Truncates `instant` to the whole second, which is all the property file can express.
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(
            instant
                .duration_trunc(TimeDelta::seconds(1))
                .unwrap_or(instant),
        )
    }

    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// True if something that happened at `instant` falls strictly before this cutoff.
    pub fn includes(&self, instant: &DateTime<Utc>) -> bool {
        instant < &self.0
    }
}

impl Display for RestorePointInTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(Self::FORMAT))
    }
}

impl FromStr for RestorePointInTime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDateTime::parse_from_str(s.trim(), Self::FORMAT)
            .map(|naive| Self(naive.and_utc()))
            .map_err(|err| Error::parse("restore point in time", format!("{s:?}: {err}")))
    }
}
