//! Replay / age filter.

use crate::message::now_millis;

const MILLIS_PER_MINUTE: i64 = 60_000;

/// Admit a message stamped `timestamp_millis` if it is no older than
/// `max_age_minutes`. A non-positive maximum admits everything.
pub fn admit(timestamp_millis: i64, max_age_minutes: i64) -> bool {
    admit_at(now_millis(), timestamp_millis, max_age_minutes)
}

/// [`admit`] against an explicit clock.
pub fn admit_at(now_millis: i64, timestamp_millis: i64, max_age_minutes: i64) -> bool {
    if max_age_minutes <= 0 {
        return true;
    }
    let age = now_millis.saturating_sub(timestamp_millis);
    age <= max_age_minutes.saturating_mul(MILLIS_PER_MINUTE)
}

/// The filter as configured for one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayFilter {
    max_age_minutes: i64,
}

impl ReplayFilter {
    pub fn new(max_age_minutes: i64) -> Self {
        Self { max_age_minutes }
    }

    pub fn max_age_minutes(&self) -> i64 {
        self.max_age_minutes
    }

    pub fn admits(&self, timestamp_millis: i64) -> bool {
        admit(timestamp_millis, self.max_age_minutes)
    }
}
