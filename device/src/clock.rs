use chrono::{DateTime, Utc};

/// Wall-clock source for every protocol timer in the node.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    fn epoch(&self) -> u32 {
        u32::try_from(self.now().timestamp()).unwrap_or(0)
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::Clock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    /// Shared, hand-advanced clock. Clones observe the same time.
    #[derive(Clone)]
    pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

    impl ManualClock {
        pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> Self {
            let start = Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap();
            ManualClock(Arc::new(Mutex::new(start)))
        }

        pub fn advance(&self, secs: i64) {
            *self.0.lock().unwrap() += Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }
}
