//! Pluggable sources of current time and new identifiers.
//!
//! Command handlers never call `Utc::now()` or `Uuid::new_v4()` directly;
//! they go through these traits so tests can substitute deterministic
//! implementations.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Source of new unique identifiers for streams and entities.
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> Uuid;
}

/// Production clock backed by the system time, in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Production identifier source producing random UUIDv4 values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdProvider for RandomIds {
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}
