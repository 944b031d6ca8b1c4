use std::{thread, time::Duration};

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("timestamp {0} cannot be represented as a calendar time")]
    OutOfRange(i64),
    #[error("clock rejected the new time: {0}")]
    Rejected(String),
}

/// Wall clock the controller reads and corrects.
pub trait TimeSource: Send {
    fn now(&self) -> i64;
    fn commit(&mut self, at: DateTime<Utc>) -> Result<(), ClockError>;
}

/// System clock plus a settable offset, for hosts that may not set the real clock.
#[derive(Debug, Clone, Default)]
pub struct OffsetClock {
    offset_secs: i64,
}

impl OffsetClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> i64 {
        self.offset_secs
    }

    pub fn set_offset(&mut self, offset_secs: i64) {
        self.offset_secs = offset_secs;
    }
}

impl TimeSource for OffsetClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp() + self.offset_secs
    }

    fn commit(&mut self, at: DateTime<Utc>) -> Result<(), ClockError> {
        self.offset_secs = at.timestamp() - Utc::now().timestamp();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClockSync {
    tolerance_secs: i64,
    settle: Duration,
    synced: bool,
    boot_epoch: i64,
    boot_corrected: bool,
}

impl ClockSync {
    pub fn new(tolerance_secs: i64, settle: Duration, boot_epoch: i64) -> Self {
        Self {
            tolerance_secs: tolerance_secs.max(0),
            settle,
            synced: false,
            boot_epoch,
            boot_corrected: false,
        }
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    pub fn mark_unsynced(&mut self) {
        self.synced = false;
    }

    pub fn boot_epoch(&self) -> i64 {
        self.boot_epoch
    }

    pub fn uptime_secs(&self, now: i64) -> i64 {
        (now - self.boot_epoch).max(0)
    }

    pub fn sync(&mut self, source: &mut dyn TimeSource, authoritative: i64) -> bool {
        let diff = authoritative - source.now();

        if (-self.tolerance_secs..=self.tolerance_secs).contains(&diff) {
            if !self.synced {
                log::info!("clock within {diff}s of server time, marking synced");
            }
            self.synced = true;
            return true;
        }

        let Some(at) = DateTime::from_timestamp(authoritative, 0) else {
            log::warn!("{}", ClockError::OutOfRange(authoritative));
            self.synced = false;
            return false;
        };

        match source.commit(at) {
            Ok(()) => {
                if !self.settle.is_zero() {
                    thread::sleep(self.settle);
                }
                log::info!("clock corrected by {diff}s to {}", at.format("%Y-%m-%d %H:%M:%S"));
                self.correct_boot_anchor(diff);
                self.synced = true;
                true
            }
            Err(err) => {
                log::warn!("clock correction failed: {err}");
                self.synced = false;
                false
            }
        }
    }

    /// Shifts the boot anchor by the first correction only.
    pub fn correct_boot_anchor(&mut self, diff: i64) -> bool {
        if self.boot_corrected {
            return false;
        }
        self.boot_epoch += diff;
        self.boot_corrected = true;
        true
    }
}
