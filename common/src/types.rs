use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelState {
    Off,
    On,
}

impl ChannelState {
    pub fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FetchStatus {
    Ok,
    Unchanged,
    BadRequest,
    Throttled,
    Failed,
    Skipped,
}

impl FetchStatus {
    pub fn from_http(code: u16) -> Self {
        match code {
            200 => Self::Ok,
            304 => Self::Unchanged,
            400 => Self::BadRequest,
            425 | 429 => Self::Throttled,
            _ => Self::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Unchanged => "UNCHANGED",
            Self::BadRequest => "BAD_REQUEST",
            Self::Throttled => "THROTTLED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Connectivity {
    Station,
    AccessPoint,
    Disconnected,
}

impl Connectivity {
    pub fn has_internet(self) -> bool {
        self == Self::Station
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Station => "STATION",
            Self::AccessPoint => "ACCESS_POINT",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    Idle,
    AwaitingInitialSchedule,
    SteadyState,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::AwaitingInitialSchedule => "AWAITING_INITIAL_SCHEDULE",
            Self::SteadyState => "STEADY_STATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputMode {
    Schedule,
    Failsafe,
    SafeOff,
}

impl OutputMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "SCHEDULE",
            Self::Failsafe => "FAILSAFE",
            Self::SafeOff => "SAFE_OFF",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub id: usize,
    pub kind: &'static str,
    pub target: String,
    pub state: Option<ChannelState>,
    #[serde(rename = "lastApplied")]
    pub last_applied: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSummary {
    #[serde(rename = "issuedAt")]
    pub issued_at: i64,
    #[serde(rename = "validUntil")]
    pub valid_until: i64,
    #[serde(rename = "remainingSecs")]
    pub remaining_secs: i64,
    #[serde(rename = "hoursLeft")]
    pub hours_left: i64,
    #[serde(rename = "jsonVersion")]
    pub json_version: u8,
    pub upcoming: Vec<UpcomingTransition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpcomingTransition {
    pub channel: usize,
    pub at: i64,
    #[serde(rename = "localTime")]
    pub local_time: String,
    pub state: ChannelState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "clientVersion")]
    pub client_version: String,
    pub phase: CyclePhase,
    pub connectivity: Connectivity,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
    #[serde(rename = "localTime")]
    pub local_time: String,
    #[serde(rename = "uptimeSecs")]
    pub uptime_secs: i64,
    pub uptime: String,
    #[serde(rename = "lastFetchStatus")]
    pub last_fetch_status: Option<FetchStatus>,
    #[serde(rename = "lastFetchCode")]
    pub last_fetch_code: Option<u16>,
    #[serde(rename = "lastRequest")]
    pub last_request: i64,
    #[serde(rename = "outputMode")]
    pub output_mode: OutputMode,
    pub schedule: Option<ScheduleSummary>,
    pub channels: Vec<ChannelStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert_eq!(FetchStatus::from_http(200), FetchStatus::Ok);
        assert_eq!(FetchStatus::from_http(304), FetchStatus::Unchanged);
        assert_eq!(FetchStatus::from_http(400), FetchStatus::BadRequest);
        assert_eq!(FetchStatus::from_http(425), FetchStatus::Throttled);
        assert_eq!(FetchStatus::from_http(429), FetchStatus::Throttled);
        assert_eq!(FetchStatus::from_http(500), FetchStatus::Failed);
        assert_eq!(FetchStatus::from_http(201), FetchStatus::Failed);
    }

    #[test]
    fn channel_state_flags() {
        assert_eq!(ChannelState::from_flag(1), Some(ChannelState::On));
        assert_eq!(ChannelState::from_flag(0), Some(ChannelState::Off));
        assert_eq!(ChannelState::from_flag(2), None);
        assert_eq!(ChannelState::On.as_str(), "ON");
    }
}
