use crate::{
    actuator::ChannelBank,
    failsafe::FailsafePattern,
    schedule::{local_hour, Schedule},
    types::{ChannelState, OutputMode},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub written: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    ClockUnsynced,
    Initialized(PassReport),
    Updated(PassReport),
    Failsafe(PassReport),
    SafeOff(PassReport),
}

impl ReconcileOutcome {
    pub fn applied(&self) -> bool {
        match self {
            Self::ClockUnsynced => false,
            Self::Initialized(report)
            | Self::Updated(report)
            | Self::Failsafe(report)
            | Self::SafeOff(report) => report.written > 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Reason {
    Baseline,
    Scheduled(i64),
    SettingsChanged,
    Override(OutputMode),
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Scheduled(at) => write!(f, "scheduled at {at}"),
            Self::SettingsChanged => write!(f, "settings changed"),
            Self::Override(mode) => write!(f, "{}", mode.as_str().to_ascii_lowercase()),
        }
    }
}

/// Per-channel progress stamps; each schedule transition is written at most once.
#[derive(Debug, Clone)]
pub struct Reconciler {
    stamps: Vec<Option<i64>>,
    initialized: bool,
    mode: OutputMode,
    forced: Vec<Option<ChannelState>>,
}

impl Reconciler {
    pub fn new(channels: usize) -> Self {
        Self {
            stamps: vec![None; channels],
            initialized: false,
            mode: OutputMode::Schedule,
            forced: vec![None; channels],
        }
    }

    pub fn stamps(&self) -> &[Option<i64>] {
        &self.stamps
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn initialized(&self) -> bool {
        self.initialized
    }

    pub fn reset(&mut self) {
        self.initialized = false;
        self.stamps.iter_mut().for_each(|stamp| *stamp = None);
    }

    pub fn reconcile(
        &mut self,
        now: i64,
        clock_synced: bool,
        schedule: Option<&Schedule>,
        failsafe: Option<&FailsafePattern>,
        bank: &mut ChannelBank,
    ) -> ReconcileOutcome {
        if !clock_synced {
            log::debug!("clock not synced, outputs withheld");
            return ReconcileOutcome::ClockUnsynced;
        }
        self.resize(bank.len());

        let schedule = match schedule {
            Some(schedule) if !schedule.is_expired(now) => schedule,
            stale => return self.override_outputs(now, stale, failsafe, bank),
        };

        if self.mode != OutputMode::Schedule {
            log::info!("valid schedule available, leaving {} mode", self.mode.as_str());
            self.mode = OutputMode::Schedule;
            self.forced.iter_mut().for_each(|forced| *forced = None);
            self.reset();
        }

        if !self.initialized {
            let report = self.initialize(now, schedule, bank);
            self.initialized = true;
            return ReconcileOutcome::Initialized(report);
        }

        let mut report = PassReport::default();
        for index in 0..bank.len() {
            let id = bank.id_at(index);
            let Some(plan) = schedule.channel(id) else {
                continue;
            };

            let Some(stamp) = self.stamps[index] else {
                // Baseline write failed earlier.
                self.write(bank, index, plan.current, Reason::Baseline, now, &mut report);
                continue;
            };

            if let Some(due) = plan.latest_due(now, stamp) {
                self.write(bank, index, due.state, Reason::Scheduled(due.at), due.at, &mut report);
            } else if plan.updated > stamp {
                let stamp = now.max(plan.updated).max(stamp);
                self.write(bank, index, plan.current, Reason::SettingsChanged, stamp, &mut report);
            }
        }

        ReconcileOutcome::Updated(report)
    }

    fn initialize(&mut self, now: i64, schedule: &Schedule, bank: &mut ChannelBank) -> PassReport {
        log::info!("initializing {} channels from schedule", bank.len());
        let mut report = PassReport::default();
        for index in 0..bank.len() {
            match schedule.channel(bank.id_at(index)) {
                Some(plan) => {
                    self.write(bank, index, plan.current, Reason::Baseline, now, &mut report)
                }
                None => log::warn!("schedule has no entry for channel {}", bank.id_at(index)),
            }
        }
        report
    }

    fn override_outputs(
        &mut self,
        now: i64,
        stale: Option<&Schedule>,
        failsafe: Option<&FailsafePattern>,
        bank: &mut ChannelBank,
    ) -> ReconcileOutcome {
        let offset = stale.map_or(0, |schedule| schedule.metadata.timestamp_offset);
        let hour = local_hour(now, offset);
        let pattern = failsafe.filter(|pattern| pattern.covers(hour));
        let mode = if pattern.is_some() {
            OutputMode::Failsafe
        } else {
            OutputMode::SafeOff
        };

        if self.mode != mode {
            match stale {
                Some(schedule) => log::warn!(
                    "schedule expired at {}, entering {} mode for hour {hour:02}",
                    schedule.metadata.valid_until,
                    mode.as_str()
                ),
                None => log::warn!("no schedule, entering {} mode for hour {hour:02}", mode.as_str()),
            }
            self.mode = mode;
        }
        self.reset();

        let mut report = PassReport::default();
        for index in 0..bank.len() {
            let state = pattern
                .and_then(|pattern| pattern.state_for(hour, bank.id_at(index)))
                .unwrap_or(ChannelState::Off);
            if self.forced[index] == Some(state) {
                continue;
            }

            let id = bank.id_at(index);
            match bank.drive(index, state) {
                Ok(()) => {
                    log::info!("channel {id} -> {} ({})", state.as_str(), Reason::Override(mode));
                    self.forced[index] = Some(state);
                    report.written += 1;
                }
                Err(err) => {
                    log::error!("channel {id} failed to switch {}: {err}", state.as_str());
                    report.failed += 1;
                }
            }
        }

        match mode {
            OutputMode::Failsafe => ReconcileOutcome::Failsafe(report),
            _ => ReconcileOutcome::SafeOff(report),
        }
    }

    fn write(
        &mut self,
        bank: &mut ChannelBank,
        index: usize,
        state: ChannelState,
        reason: Reason,
        stamp: i64,
        report: &mut PassReport,
    ) {
        let id = bank.id_at(index);
        match bank.drive(index, state) {
            Ok(()) => {
                log::info!("channel {id} -> {} ({reason})", state.as_str());
                self.stamps[index] = Some(stamp);
                report.written += 1;
            }
            Err(err) => {
                log::error!("channel {id} failed to switch {}: {err}", state.as_str());
                report.failed += 1;
            }
        }
    }

    fn resize(&mut self, channels: usize) {
        if self.stamps.len() != channels {
            self.stamps.resize(channels, None);
            self.forced.resize(channels, None);
        }
    }
}
