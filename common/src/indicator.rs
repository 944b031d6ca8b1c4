use std::time::Duration;

use crate::actuator::OutputPin;

const FLASH: Duration = Duration::from_millis(250);
const TRAILING_PAUSE: Duration = Duration::from_secs(1);

/// Startup failures shown on the status LED before the device restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalSignal {
    ConfigUnreadable,
    IdentityUnavailable,
}

impl FatalSignal {
    pub fn flashes(self) -> usize {
        match self {
            Self::ConfigUnreadable => 2,
            Self::IdentityUnavailable => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigUnreadable => "configuration unreadable",
            Self::IdentityUnavailable => "device identity unavailable",
        }
    }

    pub fn blink_sequence(self) -> Vec<(bool, Duration)> {
        let mut steps = Vec::with_capacity(self.flashes() * 2 + 1);
        for _ in 0..self.flashes() {
            steps.push((true, FLASH));
            steps.push((false, FLASH));
        }
        steps.push((false, TRAILING_PAUSE));
        steps
    }

    pub fn play(self, led: &mut dyn OutputPin, mut sleep: impl FnMut(Duration)) {
        log::error!("fatal: {}, signalling {} flashes", self.as_str(), self.flashes());
        for (level, hold) in self.blink_sequence() {
            if let Err(err) = led.set_level(level) {
                log::warn!("status led write failed: {err}");
            }
            sleep(hold);
        }
    }
}
