use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::clock::Clock;
use crate::config::Config;
use crate::records::RecordStore;

/// Everything the components share: settings, the persisted control record
/// and the wall clock. Owned by the node and lent out per operation.
pub struct DeviceContext {
    pub config: Config,
    pub records: RecordStore,
    pub clock: Box<dyn Clock + Send>,
    pub time_zone: FixedOffset,
}

impl DeviceContext {
    pub fn new(config: Config, records: RecordStore, clock: Box<dyn Clock + Send>) -> Self {
        DeviceContext {
            config,
            records,
            clock,
            time_zone: utc(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn epoch(&self) -> u32 {
        self.clock.epoch()
    }

    pub fn local_now(&self) -> DateTime<FixedOffset> {
        self.now().with_timezone(&self.time_zone)
    }

    pub fn apply_time_zone(&mut self, hours: i8) {
        self.time_zone = FixedOffset::east_opt(i32::from(hours) * 3600).unwrap_or_else(utc);
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}
