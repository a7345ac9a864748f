//! Typed view over the non-volatile control record.
//!
//! Layout (little-endian, fixed offsets):
//!
//! ```text
//! 0      format version
//! 1      alert count
//! 2      reset count
//! 3      time zone offset (i8, hours)
//! 4      control flags
//! 5..9   last acknowledged report (unix seconds)
//! 9..13  last report attempt (unix seconds)
//! ```

use tracing::{debug, warn};

use crate::errors::{CommandError, StoreError};
use crate::storage::{ByteStore, REGION_SIZE};

pub const FORMAT_VERSION: u8 = 1;

/// Counter value the boot sequence clamps to after breaking a reset loop.
pub const RESET_COUNT_SENTINEL: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum U8Field {
    FormatVersion,
    AlertCount,
    ResetCount,
    TimeZoneOffset,
    ControlFlags,
}

impl U8Field {
    fn offset(self) -> usize {
        match self {
            U8Field::FormatVersion => 0,
            U8Field::AlertCount => 1,
            U8Field::ResetCount => 2,
            U8Field::TimeZoneOffset => 3,
            U8Field::ControlFlags => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum U32Field {
    LastReportEpoch,
    LastAttemptEpoch,
}

impl U32Field {
    fn offset(self) -> usize {
        match self {
            U32Field::LastReportEpoch => 5,
            U32Field::LastAttemptEpoch => 9,
        }
    }
}

/// Named bits of the control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    LowPower,
    Verbose,
}

impl ControlFlag {
    const fn mask(self) -> u8 {
        match self {
            ControlFlag::LowPower => 1 << 0,
            ControlFlag::Verbose => 1 << 3,
        }
    }
}

/// Decoded control register. Reserved bits ride along untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlFlags {
    pub low_power: bool,
    pub verbose: bool,
    reserved: u8,
}

impl ControlFlags {
    const KNOWN: u8 = ControlFlag::LowPower.mask() | ControlFlag::Verbose.mask();

    pub fn decode(byte: u8) -> Self {
        ControlFlags {
            low_power: byte & ControlFlag::LowPower.mask() != 0,
            verbose: byte & ControlFlag::Verbose.mask() != 0,
            reserved: byte & !Self::KNOWN,
        }
    }

    pub fn encode(self) -> u8 {
        let mut byte = self.reserved;
        if self.low_power {
            byte |= ControlFlag::LowPower.mask();
        }
        if self.verbose {
            byte |= ControlFlag::Verbose.mask();
        }
        byte
    }

    pub fn get(self, flag: ControlFlag) -> bool {
        match flag {
            ControlFlag::LowPower => self.low_power,
            ControlFlag::Verbose => self.verbose,
        }
    }

    pub fn with(mut self, flag: ControlFlag, value: bool) -> Self {
        match flag {
            ControlFlag::LowPower => self.low_power = value,
            ControlFlag::Verbose => self.verbose = value,
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRecord {
    pub format_version: u8,
    pub reset_count: u8,
    pub alert_count: u8,
    pub time_zone_offset: i8,
    pub flags: ControlFlags,
    pub last_report_epoch: u32,
    pub last_attempt_epoch: u32,
}

/// Outcome of [`RecordStore::load`].
#[derive(Debug, Clone, Copy)]
pub struct Loaded {
    pub record: ControlRecord,
    pub reinitialized: bool,
}

pub struct RecordStore {
    store: Box<dyn ByteStore + Send>,
}

impl RecordStore {
    pub fn new(store: Box<dyn ByteStore + Send>) -> Self {
        RecordStore { store }
    }

    /// Validates the format marker, zeroing the whole region on mismatch.
    pub fn load(&mut self) -> Result<Loaded, StoreError> {
        let version = self.get_u8(U8Field::FormatVersion)?;
        let reinitialized = version != FORMAT_VERSION;
        if reinitialized {
            warn!(
                found = version,
                expected = FORMAT_VERSION,
                "Control record format mismatch, reinitializing"
            );
            self.store.write(0, &[0u8; REGION_SIZE])?;
            self.set_u8(U8Field::FormatVersion, FORMAT_VERSION)?;
        }
        let record = self.record()?;
        debug!(?record, "Loaded control record");
        Ok(Loaded { record, reinitialized })
    }

    pub fn record(&self) -> Result<ControlRecord, StoreError> {
        Ok(ControlRecord {
            format_version: self.get_u8(U8Field::FormatVersion)?,
            reset_count: self.reset_count()?,
            alert_count: self.get_u8(U8Field::AlertCount)?,
            time_zone_offset: self.time_zone_offset()?,
            flags: self.flags()?,
            last_report_epoch: self.get_u32(U32Field::LastReportEpoch)?,
            last_attempt_epoch: self.get_u32(U32Field::LastAttemptEpoch)?,
        })
    }

    pub fn get_u8(&self, field: U8Field) -> Result<u8, StoreError> {
        let mut buf = [0u8; 1];
        self.store.read(field.offset(), &mut buf)?;
        Ok(buf[0])
    }

    pub fn set_u8(&mut self, field: U8Field, value: u8) -> Result<(), StoreError> {
        self.store.write(field.offset(), &[value])
    }

    pub fn get_u32(&self, field: U32Field) -> Result<u32, StoreError> {
        let mut buf = [0u8; 4];
        self.store.read(field.offset(), &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn set_u32(&mut self, field: U32Field, value: u32) -> Result<(), StoreError> {
        self.store.write(field.offset(), &value.to_le_bytes())
    }

    pub fn flags(&self) -> Result<ControlFlags, StoreError> {
        Ok(ControlFlags::decode(self.get_u8(U8Field::ControlFlags)?))
    }

    pub fn get_flag(&self, flag: ControlFlag) -> Result<bool, StoreError> {
        Ok(self.flags()?.get(flag))
    }

    /// Read-modify-write of a single bit; every other bit is preserved.
    pub fn set_flag(&mut self, flag: ControlFlag, value: bool) -> Result<(), StoreError> {
        let updated = self.flags()?.with(flag, value);
        self.set_u8(U8Field::ControlFlags, updated.encode())
    }

    pub fn reset_count(&self) -> Result<u8, StoreError> {
        self.get_u8(U8Field::ResetCount)
    }

    pub fn set_reset_count(&mut self, value: u8) -> Result<(), StoreError> {
        self.set_u8(U8Field::ResetCount, value)
    }

    pub fn increment_alert_count(&mut self) -> Result<u8, StoreError> {
        let count = self.get_u8(U8Field::AlertCount)?.saturating_add(1);
        self.set_u8(U8Field::AlertCount, count)?;
        Ok(count)
    }

    /// Stored offset in hours; anything outside [-12, 12] reads as UTC.
    pub fn time_zone_offset(&self) -> Result<i8, StoreError> {
        let raw = self.get_u8(U8Field::TimeZoneOffset)? as i8;
        Ok(if (-12..=12).contains(&raw) { raw } else { 0 })
    }

    pub fn set_time_zone_offset(&mut self, hours: i32) -> Result<i8, CommandError> {
        if !(-12..=12).contains(&hours) {
            return Err(CommandError::TimeZoneOutOfRange(hours));
        }
        let hours = hours as i8;
        self.set_u8(U8Field::TimeZoneOffset, hours as u8)?;
        Ok(hours)
    }

    pub fn last_report_epoch(&self) -> Result<u32, StoreError> {
        self.get_u32(U32Field::LastReportEpoch)
    }

    /// Records an acknowledged delivery. The stored time never moves backwards.
    pub fn record_report_success(&mut self, epoch: u32) -> Result<bool, StoreError> {
        if epoch <= self.last_report_epoch()? {
            return Ok(false);
        }
        self.set_u32(U32Field::LastReportEpoch, epoch)?;
        Ok(true)
    }

    pub fn last_attempt_epoch(&self) -> Result<u32, StoreError> {
        self.get_u32(U32Field::LastAttemptEpoch)
    }

    pub fn record_report_attempt(&mut self, epoch: u32) -> Result<(), StoreError> {
        self.set_u32(U32Field::LastAttemptEpoch, epoch)
    }
}
