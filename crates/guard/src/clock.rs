//! Time source and identity minting.
//!
//! Lease math goes through the [`Clock`] trait so tests can drive expiry
//! deterministically instead of sleeping.

use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Injectable wall-clock used for lease arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. For tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: std::time::Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += ChronoDuration::from_std(by).expect("duration out of range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

/// Mint a random owner identity for a lock acquisition.
pub fn mint_owner_id() -> String {
    format!("guard-{}", uuid::Uuid::new_v4())
}
