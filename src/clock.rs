use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Time source abstraction so staleness checks and checkpoint cadence can be
/// driven deterministically in tests instead of sleeping real wall time.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic_now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A clock that only advances when told to, for deterministic tests of
    /// stale-lease detection and checkpoint-interval behavior.
    pub struct FakeClock {
        inner: Mutex<(DateTime<Utc>, Instant)>,
    }

    impl FakeClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            FakeClock {
                inner: Mutex::new((start, Instant::now())),
            }
        }

        pub fn advance(&self, by: Duration) {
            let mut guard = self.inner.lock().unwrap();
            guard.0 += chrono::Duration::from_std(by).unwrap();
            guard.1 += by;
        }
    }

    impl Clock for FakeClock {
        fn now_utc(&self) -> DateTime<Utc> {
            self.inner.lock().unwrap().0
        }

        fn monotonic_now(&self) -> Instant {
            self.inner.lock().unwrap().1
        }
    }
}
