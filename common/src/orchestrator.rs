use std::{
    sync::{Mutex, TryLockError},
    time::Duration,
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    actuator::ChannelBank,
    clock::{ClockSync, TimeSource},
    config::DeviceConfig,
    context::ControllerContext,
    failsafe::FailsafePattern,
    fetcher::{FetchResult, ScheduleFetcher, ScheduleTransport},
    reconciler::ReconcileOutcome,
    types::{Connectivity, ControllerStatus, CyclePhase, FetchStatus},
};

pub const CLIENT_VERSION: &str = concat!("Rust-", env!("CARGO_PKG_VERSION"));

pub trait ConnectivityProbe: Send {
    fn refresh(&mut self) -> Connectivity;
}

/// Jittered countdown between schedule requests.
#[derive(Debug)]
pub struct Cadence {
    cycles_until_request: u32,
    min_cycles: u32,
    max_cycles: u32,
    rng: StdRng,
}

impl Cadence {
    pub fn new(min_cycles: u32, max_cycles: u32, rng: StdRng) -> Self {
        let min_cycles = min_cycles.max(1);
        Self {
            cycles_until_request: 0,
            min_cycles,
            max_cycles: max_cycles.max(min_cycles + 1),
            rng,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.cycles_until_request
    }

    /// Counts one cycle and reports whether a request is due.
    pub fn next_cycle(&mut self) -> bool {
        if self.cycles_until_request <= 1 {
            self.cycles_until_request = 0;
            true
        } else {
            self.cycles_until_request -= 1;
            false
        }
    }

    pub fn rearm(&mut self) -> u32 {
        self.cycles_until_request = self.rng.gen_range(self.min_cycles..self.max_cycles);
        self.cycles_until_request
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub fetch: Option<FetchResult>,
    pub reconcile: ReconcileOutcome,
    pub status: ControllerStatus,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Overlapped,
    Completed(TickReport),
    RestartRequired { valid_until: i64, report: TickReport },
}

impl TickOutcome {
    pub fn status(&self) -> Option<&ControllerStatus> {
        match self {
            Self::Overlapped => None,
            Self::Completed(report) | Self::RestartRequired { report, .. } => Some(&report.status),
        }
    }
}

pub struct Orchestrator {
    ctx: ControllerContext,
    phase: CyclePhase,
    cadence: Cadence,
    fetcher: ScheduleFetcher,
    bank: ChannelBank,
    transport: Box<dyn ScheduleTransport>,
    clock: Box<dyn TimeSource>,
    probe: Box<dyn ConnectivityProbe>,
    connectivity: Connectivity,
    restart_on_expiry: bool,
}

impl Orchestrator {
    pub fn new(
        config: &DeviceConfig,
        device_id: &str,
        bank: ChannelBank,
        failsafe: Option<FailsafePattern>,
        transport: Box<dyn ScheduleTransport>,
        clock: Box<dyn TimeSource>,
        probe: Box<dyn ConnectivityProbe>,
    ) -> Self {
        Self::with_rng(
            config,
            device_id,
            bank,
            failsafe,
            transport,
            clock,
            probe,
            StdRng::from_entropy(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_rng(
        config: &DeviceConfig,
        device_id: &str,
        bank: ChannelBank,
        failsafe: Option<FailsafePattern>,
        transport: Box<dyn ScheduleTransport>,
        clock: Box<dyn TimeSource>,
        probe: Box<dyn ConnectivityProbe>,
        rng: StdRng,
    ) -> Self {
        let cadence = &config.cadence;
        let failsafe = if config.failsafe { failsafe } else { None };
        let clock_sync = ClockSync::new(
            cadence.clock_tolerance_secs,
            Duration::from_millis(cadence.clock_settle_ms),
            clock.now(),
        );

        Self {
            ctx: ControllerContext::new(device_id, CLIENT_VERSION, bank.len(), clock_sync, failsafe),
            phase: CyclePhase::Idle,
            cadence: Cadence::new(cadence.request_cycles_min, cadence.request_cycles_max, rng),
            fetcher: ScheduleFetcher::new(
                config.fetch_url_fallback.trim(),
                device_id,
                CLIENT_VERSION,
                config.json_version,
            ),
            bank,
            transport,
            clock,
            probe,
            connectivity: Connectivity::Disconnected,
            restart_on_expiry: cadence.restart_on_expiry,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn context(&self) -> &ControllerContext {
        &self.ctx
    }

    pub fn status(&self) -> ControllerStatus {
        self.ctx
            .status(self.clock.now(), self.phase, self.connectivity, &self.bank)
    }

    pub fn tick(&mut self) -> TickOutcome {
        if self.phase == CyclePhase::Idle {
            log::info!("controller {} starting, waiting for first schedule", self.ctx.device_id);
            self.phase = CyclePhase::AwaitingInitialSchedule;
        }

        self.connectivity = self.probe.refresh();

        // Until the clock is synced every cycle asks, unless the server asked us to slow down.
        let throttled = self.ctx.fetch.last_status == Some(FetchStatus::Throttled);
        let forced = !self.ctx.clock.synced() && !throttled;

        let due = self.cadence.next_cycle();

        let fetch = if due || forced {
            let result = self.fetcher.fetch(
                &mut self.ctx,
                self.transport.as_mut(),
                self.clock.as_mut(),
                self.connectivity,
            );
            let next = self.cadence.rearm();
            log::debug!("next schedule request in {next} cycles");
            Some(result)
        } else {
            log::debug!(
                "next schedule request in {} cycles",
                self.cadence.remaining()
            );
            None
        };

        if self.phase == CyclePhase::AwaitingInitialSchedule && self.ctx.schedule_ready() {
            log::info!("first schedule received, entering steady state");
            self.phase = CyclePhase::SteadyState;
        }

        let now = self.clock.now();
        let reconcile = self.ctx.reconciler.reconcile(
            now,
            self.ctx.clock.synced(),
            self.ctx.schedule.as_deref(),
            self.ctx.failsafe.as_ref(),
            &mut self.bank,
        );

        let report = TickReport {
            fetch,
            reconcile,
            status: self.ctx.status(now, self.phase, self.connectivity, &self.bank),
        };

        let expired_at = self
            .ctx
            .schedule
            .as_ref()
            .filter(|schedule| schedule.is_expired(now))
            .map(|schedule| schedule.metadata.valid_until);

        match expired_at {
            Some(valid_until) if self.restart_on_expiry => {
                log::error!("schedule expired at {valid_until} with no replacement, requesting restart");
                TickOutcome::RestartRequired { valid_until, report }
            }
            _ => TickOutcome::Completed(report),
        }
    }
}

/// Shares one orchestrator between timer callbacks; overlapping ticks are dropped.
pub struct SharedOrchestrator {
    inner: Mutex<Orchestrator>,
    latest: Mutex<Option<ControllerStatus>>,
}

impl SharedOrchestrator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        let status = orchestrator.status();
        Self {
            inner: Mutex::new(orchestrator),
            latest: Mutex::new(Some(status)),
        }
    }

    pub fn try_tick(&self) -> TickOutcome {
        let outcome = match self.inner.try_lock() {
            Ok(mut orchestrator) => orchestrator.tick(),
            Err(TryLockError::WouldBlock) => {
                log::warn!("previous cycle still running, skipping tick");
                return TickOutcome::Overlapped;
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                log::error!("control cycle panicked earlier, continuing with recovered state");
                poisoned.into_inner().tick()
            }
        };

        if let Some(status) = outcome.status() {
            let mut latest = self
                .latest
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *latest = Some(status.clone());
        }
        outcome
    }

    pub fn latest_status(&self) -> Option<ControllerStatus> {
        self.latest
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actuator::OutputPin,
        testing::{control, pin_bank, schedule_body, ManualClock, ScriptedProbe, ScriptedTransport},
        types::OutputMode,
    };
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Barrier};

    const CADENCE: &str = r#"{"clock_settle_ms": 0, "request_cycles_min": 3, "request_cycles_max": 4}"#;

    fn config(cadence: &str, extra: &str) -> DeviceConfig {
        let raw = format!(
            r#"{{"Fetch_url_fallback": "http://fallback/controls.php", "Mac_fallback": "aabb",
                "Channels": [{{"id": 1, "mode": "GPIO", "pin": 21}}, {{"id": 2, "mode": "GPIO", "pin": 20}}],
                "Cadence": {cadence}{extra}}}"#
        );
        DeviceConfig::from_json(raw.as_bytes()).unwrap()
    }

    struct Rig {
        orchestrator: Orchestrator,
        clock: ManualClock,
        transport: ScriptedTransport,
        probe: ScriptedProbe,
        pins: Vec<crate::testing::RecordingPin>,
    }

    fn rig(cadence: &str, extra: &str, failsafe: Option<FailsafePattern>) -> Rig {
        let clock = ManualClock::new(0);
        let transport = ScriptedTransport::default();
        let probe = ScriptedProbe::new(Connectivity::Station);
        let (bank, pins) = pin_bank(2);
        let orchestrator = Orchestrator::with_rng(
            &config(cadence, extra),
            "aabb",
            bank,
            failsafe,
            Box::new(transport.clone()),
            Box::new(clock.clone()),
            Box::new(probe.clone()),
            StdRng::seed_from_u64(7),
        );
        Rig {
            orchestrator,
            clock,
            transport,
            probe,
            pins,
        }
    }

    fn body(issued: i64, valid_until: i64) -> Vec<u8> {
        schedule_body(
            issued,
            valid_until,
            vec![
                control(1, 1, 0, &[(issued + 100, 0)]),
                control(2, 0, 0, &[]),
            ],
        )
    }

    fn completed(outcome: TickOutcome) -> TickReport {
        match outcome {
            TickOutcome::Completed(report) => report,
            other => panic!("expected completed tick, got {other:?}"),
        }
    }

    #[test]
    fn cadence_stays_inside_jitter_window() {
        let mut cadence = Cadence::new(18, 20, StdRng::seed_from_u64(1));
        assert!(cadence.next_cycle());

        for _ in 0..50 {
            let next = cadence.rearm();
            assert!((18..20).contains(&next));
        }

        let armed = cadence.rearm();
        let skipped = (0..armed).take_while(|_| !cadence.next_cycle()).count() as u32;
        assert_eq!(skipped, armed - 1);
    }

    #[test]
    fn first_tick_fetches_syncs_and_initializes() {
        let mut rig = rig(CADENCE, "", None);
        rig.transport.reply(200, body(10_000, 90_000));

        let report = completed(rig.orchestrator.tick());

        assert_eq!(report.fetch.as_ref().unwrap().status, FetchStatus::Ok);
        assert!(matches!(report.reconcile, ReconcileOutcome::Initialized(_)));
        assert_eq!(rig.orchestrator.phase(), CyclePhase::SteadyState);
        assert_eq!(rig.clock.now_value(), 10_000);
        assert_eq!(rig.pins[0].levels(), vec![true]);
        assert_eq!(rig.pins[1].levels(), vec![false]);
        assert!(report.status.time_synced);
        assert_eq!(
            rig.transport.requested(),
            vec!["http://fallback/controls.php?device_mac=aabb&last_request=0&client=Rust-0.1.0&json_version=2".to_string()]
        );
    }

    #[test]
    fn requests_follow_the_jittered_countdown() {
        let mut rig = rig(CADENCE, "", None);
        rig.transport.reply(200, body(10_000, 90_000));
        completed(rig.orchestrator.tick());

        for _ in 0..2 {
            rig.clock.advance(15);
            let report = completed(rig.orchestrator.tick());
            assert!(report.fetch.is_none());
        }

        rig.transport.reply(304, Vec::new());
        rig.clock.advance(15);
        let report = completed(rig.orchestrator.tick());
        assert_eq!(report.fetch.unwrap().status, FetchStatus::Unchanged);
        assert_eq!(rig.transport.requested().len(), 2);
        assert!(rig.transport.requested()[1].contains("last_request=10000"));
    }

    #[test]
    fn unsynced_clock_forces_fetch_every_tick_until_throttled() {
        let mut rig = rig(CADENCE, "", None);
        rig.transport.reply(500, Vec::new());
        rig.transport.reply(429, Vec::new());

        let first = completed(rig.orchestrator.tick());
        assert_eq!(first.reconcile, ReconcileOutcome::ClockUnsynced);
        assert_eq!(rig.orchestrator.phase(), CyclePhase::AwaitingInitialSchedule);

        let second = completed(rig.orchestrator.tick());
        assert_eq!(second.fetch.unwrap().status, FetchStatus::Throttled);

        let third = completed(rig.orchestrator.tick());
        assert!(third.fetch.is_none());
        assert_eq!(rig.transport.requested().len(), 2);
        assert!(rig.pins.iter().all(|pin| pin.levels().is_empty()));
    }

    #[test]
    fn access_point_mode_skips_fetch_but_keeps_reconciling() {
        let mut rig = rig(CADENCE, "", None);
        rig.transport.reply(200, body(10_000, 90_000));
        completed(rig.orchestrator.tick());

        rig.probe.set(Connectivity::AccessPoint);
        rig.clock.advance(150);
        for _ in 0..4 {
            completed(rig.orchestrator.tick());
        }

        assert_eq!(rig.transport.requested().len(), 1);
        assert_eq!(rig.pins[0].levels(), vec![true, false]);
        assert_eq!(
            rig.orchestrator.context().fetch.last_status,
            Some(FetchStatus::Skipped)
        );
    }

    #[test]
    fn expiry_applies_failsafe_then_requests_restart() {
        let failsafe = FailsafePattern::default().with_hour(2, [2]);
        let mut rig = rig(CADENCE, r#", "Failsafe": true"#, Some(failsafe));
        rig.transport.reply(200, body(3_600, 7_200));
        completed(rig.orchestrator.tick());

        rig.clock.set(7_300);
        let outcome = rig.orchestrator.tick();

        let TickOutcome::RestartRequired { valid_until, report } = outcome else {
            panic!("expected restart request");
        };
        assert_eq!(valid_until, 7_200);
        assert_eq!(report.status.output_mode, OutputMode::Failsafe);
        assert_eq!(rig.pins[0].levels(), vec![true, false]);
        assert_eq!(rig.pins[1].levels(), vec![false, true]);
    }

    #[test]
    fn fresh_schedule_in_same_tick_averts_restart() {
        let mut rig = rig(
            r#"{"request_cycles_min": 1, "request_cycles_max": 2, "clock_settle_ms": 0}"#,
            "",
            None,
        );
        rig.transport.reply(200, body(3_600, 7_200));
        completed(rig.orchestrator.tick());

        rig.clock.set(7_300);
        rig.transport.reply(200, body(7_300, 20_000));
        let report = completed(rig.orchestrator.tick());

        assert_eq!(report.fetch.unwrap().status, FetchStatus::Ok);
        assert_eq!(report.status.output_mode, OutputMode::Schedule);
    }

    #[test]
    fn restart_can_be_disabled() {
        let mut rig = rig(
            r#"{"restart_on_expiry": false, "clock_settle_ms": 0, "request_cycles_min": 3, "request_cycles_max": 4}"#,
            "",
            None,
        );
        rig.transport.reply(200, body(3_600, 7_200));
        completed(rig.orchestrator.tick());

        rig.clock.set(7_300);
        let report = completed(rig.orchestrator.tick());

        assert_eq!(report.status.output_mode, OutputMode::SafeOff);
        assert_eq!(rig.pins[0].levels().last(), Some(&false));
    }

    struct BlockingPin {
        entered: Arc<Barrier>,
        release: Arc<Barrier>,
    }

    impl OutputPin for BlockingPin {
        fn set_level(&mut self, _high: bool) -> Result<(), crate::actuator::ActuationError> {
            self.entered.wait();
            self.release.wait();
            Ok(())
        }
    }

    #[test]
    fn overlapping_tick_is_rejected() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let clock = ManualClock::new(0);
        let transport = ScriptedTransport::default();
        transport.reply(200, schedule_body(5_000, 90_000, vec![control(1, 1, 0, &[])]));
        let bank = ChannelBank::new(vec![crate::actuator::Actuator::Digital {
            pin: 21,
            driver: Box::new(BlockingPin {
                entered: entered.clone(),
                release: release.clone(),
            }),
        }]);
        let shared = Arc::new(SharedOrchestrator::new(Orchestrator::with_rng(
            &config(CADENCE, ""),
            "aabb",
            bank,
            None,
            Box::new(transport),
            Box::new(clock),
            Box::new(ScriptedProbe::new(Connectivity::Station)),
            StdRng::seed_from_u64(3),
        )));

        let worker = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.try_tick())
        };

        entered.wait();
        assert!(matches!(shared.try_tick(), TickOutcome::Overlapped));
        release.wait();

        let outcome = worker.join().unwrap();
        assert!(matches!(outcome, TickOutcome::Completed(_)));
        assert_eq!(shared.latest_status().unwrap().phase, CyclePhase::SteadyState);
    }
}
