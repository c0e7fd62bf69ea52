use chrono::{DateTime, Utc};

/// Clock used for dedup windows, rate windows, batch timestamps and
/// persisted-batch expiry. Swapped for a manual clock in tests.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
