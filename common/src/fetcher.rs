use std::sync::Arc;

use crate::{
    clock::TimeSource,
    context::ControllerContext,
    schedule::{JsonVersion, Schedule},
    types::{Connectivity, FetchStatus},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Io(String),
}

/// Bounded-time HTTP GET used to pull schedules.
pub trait ScheduleTransport: Send {
    fn get(&mut self, url: &str) -> Result<HttpReply, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct FetchState {
    pub last_request: i64,
    pub next_url: Option<String>,
    pub last_status: Option<FetchStatus>,
    pub last_code: Option<u16>,
    pub last_attempt: Option<i64>,
    pub last_success: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: FetchStatus,
    pub code: Option<u16>,
    pub schedule: Option<Arc<Schedule>>,
}

impl FetchResult {
    fn without_schedule(status: FetchStatus, code: Option<u16>) -> Self {
        Self {
            status,
            code,
            schedule: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleFetcher {
    fallback_url: String,
    device_id: String,
    client_version: String,
    json_version: JsonVersion,
}

impl ScheduleFetcher {
    pub fn new(
        fallback_url: impl Into<String>,
        device_id: impl Into<String>,
        client_version: impl Into<String>,
        json_version: JsonVersion,
    ) -> Self {
        Self {
            fallback_url: fallback_url.into(),
            device_id: device_id.into(),
            client_version: client_version.into(),
            json_version,
        }
    }

    pub fn json_version(&self) -> JsonVersion {
        self.json_version
    }

    pub fn request_url(&self, state: &FetchState, clock_synced: bool) -> String {
        let base = state
            .next_url
            .as_deref()
            .unwrap_or(self.fallback_url.as_str())
            .trim();
        let separator = if base.contains('?') { '&' } else { '?' };
        // An unsynced device asks for a full document so its timestamp can reset the clock.
        let last_request = if clock_synced { state.last_request } else { 0 };

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("device_mac", &self.device_id)
            .append_pair("last_request", &last_request.to_string())
            .append_pair("client", &self.client_version);
        if let Some(version) = self.json_version.query_value() {
            query.append_pair("json_version", &version.to_string());
        }
        format!("{base}{separator}{}", query.finish())
    }

    pub fn fetch(
        &self,
        ctx: &mut ControllerContext,
        transport: &mut dyn ScheduleTransport,
        clock: &mut dyn TimeSource,
        connectivity: Connectivity,
    ) -> FetchResult {
        if !connectivity.has_internet() {
            log::info!(
                "skipping schedule request, connectivity is {}",
                connectivity.as_str()
            );
            return self.record(ctx, FetchResult::without_schedule(FetchStatus::Skipped, None));
        }

        let url = self.request_url(&ctx.fetch, ctx.clock.synced());
        ctx.fetch.last_attempt = Some(clock.now());
        log::info!("requesting schedule from {url}");

        let reply = match transport.get(&url) {
            Ok(reply) => reply,
            Err(err) if ctx.fetch.next_url.is_some() => {
                // The follow-up host is unreachable; drop it and try the configured fallback.
                log::warn!("follow-up url failed ({err}), retrying with fallback url");
                ctx.fetch.next_url = None;
                let url = self.request_url(&ctx.fetch, ctx.clock.synced());
                log::info!("requesting schedule from {url}");
                match transport.get(&url) {
                    Ok(reply) => reply,
                    Err(err) => {
                        log::warn!("schedule not updated: {err}");
                        return self.record(ctx, FetchResult::without_schedule(FetchStatus::Failed, None));
                    }
                }
            }
            Err(err) => {
                log::warn!("schedule not updated: {err}");
                return self.record(ctx, FetchResult::without_schedule(FetchStatus::Failed, None));
            }
        };

        let status = FetchStatus::from_http(reply.status);
        let result = match status {
            FetchStatus::Ok => self.accept(ctx, clock, &reply.body),
            FetchStatus::Unchanged => {
                log::info!("schedule unchanged since last request, code {}", reply.status);
                FetchResult::without_schedule(status, Some(reply.status))
            }
            FetchStatus::BadRequest => {
                log::warn!("schedule not updated, bad request, code {}", reply.status);
                FetchResult::without_schedule(status, Some(reply.status))
            }
            FetchStatus::Throttled => {
                log::warn!("schedule not updated, request throttled, code {}", reply.status);
                FetchResult::without_schedule(status, Some(reply.status))
            }
            FetchStatus::Failed | FetchStatus::Skipped => {
                log::warn!("schedule not updated, code {}", reply.status);
                FetchResult::without_schedule(FetchStatus::Failed, Some(reply.status))
            }
        };

        self.record(ctx, result)
    }

    fn accept(
        &self,
        ctx: &mut ControllerContext,
        clock: &mut dyn TimeSource,
        body: &[u8],
    ) -> FetchResult {
        let schedule = match Schedule::decode(body, self.json_version) {
            Ok(schedule) => schedule,
            Err(err) => {
                log::warn!("schedule not updated, unreadable body: {err}");
                return FetchResult::without_schedule(FetchStatus::Failed, Some(200));
            }
        };

        ctx.clock.sync(clock, schedule.metadata.issued_at);

        let schedule = Arc::new(schedule);
        ctx.fetch.last_request = schedule.metadata.issued_at;
        ctx.fetch.next_url = schedule.metadata.fetch_url.clone();
        ctx.fetch.last_success = Some(clock.now());
        ctx.schedule = Some(schedule.clone());

        log::info!(
            "schedule updated: {} channels, issued {}, valid until {}",
            schedule.metadata.channels,
            schedule.metadata.issued_at,
            schedule.metadata.valid_until
        );

        FetchResult {
            status: FetchStatus::Ok,
            code: Some(200),
            schedule: Some(schedule),
        }
    }

    fn record(&self, ctx: &mut ControllerContext, result: FetchResult) -> FetchResult {
        ctx.fetch.last_status = Some(result.status);
        if result.status != FetchStatus::Skipped {
            ctx.fetch.last_code = result.code;
        }
        result
    }
}
