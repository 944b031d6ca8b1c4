use std::sync::Arc;

use crate::{
    actuator::ChannelBank,
    clock::ClockSync,
    failsafe::FailsafePattern,
    fetcher::FetchState,
    reconciler::Reconciler,
    schedule::Schedule,
    status::{format_local_time, format_uptime},
    types::{Connectivity, ControllerStatus, CyclePhase, ScheduleSummary, UpcomingTransition},
};

const UPCOMING_LIMIT: usize = 12;

/// Everything one control cycle reads and writes.
#[derive(Debug)]
pub struct ControllerContext {
    pub device_id: String,
    pub client_version: String,
    pub schedule: Option<Arc<Schedule>>,
    pub clock: ClockSync,
    pub fetch: FetchState,
    pub reconciler: Reconciler,
    pub failsafe: Option<FailsafePattern>,
}

impl ControllerContext {
    pub fn new(
        device_id: impl Into<String>,
        client_version: impl Into<String>,
        channels: usize,
        clock: ClockSync,
        failsafe: Option<FailsafePattern>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            client_version: client_version.into(),
            schedule: None,
            clock,
            fetch: FetchState::default(),
            reconciler: Reconciler::new(channels),
            failsafe,
        }
    }

    pub fn schedule_ready(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn timestamp_offset(&self) -> i64 {
        self.schedule
            .as_ref()
            .map_or(0, |schedule| schedule.metadata.timestamp_offset)
    }

    pub fn status(
        &self,
        now: i64,
        phase: CyclePhase,
        connectivity: Connectivity,
        bank: &ChannelBank,
    ) -> ControllerStatus {
        let offset = self.timestamp_offset();
        let uptime_secs = self.clock.uptime_secs(now);

        let schedule = self.schedule.as_ref().map(|schedule| {
            let remaining_secs = schedule.remaining_secs(now);
            ScheduleSummary {
                issued_at: schedule.metadata.issued_at,
                valid_until: schedule.metadata.valid_until,
                remaining_secs,
                hours_left: remaining_secs / 3_600,
                json_version: schedule.metadata.version.number(),
                upcoming: schedule
                    .upcoming(now, UPCOMING_LIMIT)
                    .into_iter()
                    .map(|(channel, transition)| UpcomingTransition {
                        channel,
                        at: transition.at,
                        local_time: format_local_time(transition.at, offset),
                        state: transition.state,
                    })
                    .collect(),
            }
        });

        ControllerStatus {
            device_id: self.device_id.clone(),
            client_version: self.client_version.clone(),
            phase,
            connectivity,
            time_synced: self.clock.synced(),
            now_epoch: now,
            local_time: format_local_time(now, offset),
            uptime_secs,
            uptime: format_uptime(uptime_secs),
            last_fetch_status: self.fetch.last_status,
            last_fetch_code: self.fetch.last_code,
            last_request: self.fetch.last_request,
            output_mode: self.reconciler.mode(),
            schedule,
            channels: bank.statuses(self.reconciler.stamps()),
        }
    }
}
