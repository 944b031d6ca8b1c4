use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{config::is_http_url, types::ChannelState};

const HOUR_SECS: i64 = 3_600;
const MAX_CHANNELS: i64 = 64;
const MAX_HOURS_COUNT: i64 = 24 * 14;
const MAX_OFFSET_SECS: i64 = 14 * HOUR_SECS;
// 9999-12-31T23:59:59Z
const MAX_EPOCH: i64 = 253_402_300_799;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("schedule is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("metadata field `{0}` is missing or not a number")]
    InvalidMetadata(&'static str),
    #[error("metadata field `{field}` value {value} is out of range")]
    OutOfRange { field: &'static str, value: i64 },
    #[error("channel {channel} has invalid state {value}")]
    InvalidState { channel: usize, value: i64 },
    #[error("channel {channel} has no state for hour {hour}")]
    MissingBucket { channel: usize, hour: u8 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum JsonVersion {
    V1,
    #[default]
    V2,
}

impl JsonVersion {
    pub fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }

    /// Value of the `json_version` query parameter; version 1 servers predate it.
    pub fn query_value(self) -> Option<u8> {
        match self {
            Self::V1 => None,
            Self::V2 => Some(2),
        }
    }
}

impl TryFrom<u8> for JsonVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(format!("unsupported json version {other}")),
        }
    }
}

impl From<JsonVersion> for u8 {
    fn from(version: JsonVersion) -> Self {
        version.number()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub at: i64,
    pub state: ChannelState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    pub id: usize,
    pub current: ChannelState,
    pub updated: i64,
    pub transitions: Vec<Transition>,
}

impl ChannelPlan {
    pub fn new(id: usize, current: ChannelState, updated: i64, mut transitions: Vec<Transition>) -> Self {
        // Stable sort keeps server order among equal timestamps; the last one wins.
        transitions.sort_by_key(|transition| transition.at);
        let mut deduped: Vec<Transition> = Vec::with_capacity(transitions.len());
        for transition in transitions {
            match deduped.last_mut() {
                Some(last) if last.at == transition.at => *last = transition,
                _ => deduped.push(transition),
            }
        }

        Self {
            id,
            current,
            updated,
            transitions: deduped,
        }
    }

    /// Latest transition with `after < at <= now`.
    pub fn latest_due(&self, now: i64, after: i64) -> Option<&Transition> {
        self.transitions
            .iter()
            .rev()
            .find(|transition| transition.at <= now)
            .filter(|transition| transition.at > after)
    }

    pub fn next_after(&self, now: i64) -> Option<&Transition> {
        self.transitions.iter().find(|transition| transition.at > now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleMetadata {
    pub channels: usize,
    pub issued_at: i64,
    pub timestamp_offset: i64,
    pub valid_until: i64,
    pub fetch_url: Option<String>,
    pub version: JsonVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub metadata: ScheduleMetadata,
    pub channels: Vec<ChannelPlan>,
}

impl Schedule {
    pub fn decode(body: &[u8], version: JsonVersion) -> Result<Self, ScheduleError> {
        match version {
            JsonVersion::V1 => decode_hourly(body),
            JsonVersion::V2 => decode_timestamped(body),
        }
    }

    pub fn channel(&self, id: usize) -> Option<&ChannelPlan> {
        self.channels.iter().find(|plan| plan.id == id)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.metadata.valid_until
    }

    pub fn remaining_secs(&self, now: i64) -> i64 {
        (self.metadata.valid_until - now).max(0)
    }

    pub fn local_hour(&self, now: i64) -> u8 {
        local_hour(now, self.metadata.timestamp_offset)
    }

    pub fn upcoming(&self, now: i64, limit: usize) -> Vec<(usize, Transition)> {
        let mut upcoming: Vec<(usize, Transition)> = self
            .channels
            .iter()
            .flat_map(|plan| {
                plan.transitions
                    .iter()
                    .filter(move |transition| transition.at > now)
                    .map(move |transition| (plan.id, *transition))
            })
            .collect();
        upcoming.sort_by_key(|(channel, transition)| (transition.at, *channel));
        upcoming.truncate(limit);
        upcoming
    }
}

pub fn local_hour(epoch: i64, offset: i64) -> u8 {
    epoch
        .saturating_add(offset)
        .div_euclid(HOUR_SECS)
        .rem_euclid(24) as u8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Lenient {
    Number(i64),
    Float(f64),
    Text(String),
}

impl Lenient {
    fn value(&self) -> Option<i64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Float(value) if value.is_finite() => Some(value.trunc() as i64),
            Self::Float(_) => None,
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

fn required(field: Option<&Lenient>, name: &'static str) -> Result<i64, ScheduleError> {
    field
        .and_then(Lenient::value)
        .ok_or(ScheduleError::InvalidMetadata(name))
}

fn bounded(
    value: i64,
    name: &'static str,
    range: std::ops::RangeInclusive<i64>,
) -> Result<i64, ScheduleError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ScheduleError::OutOfRange { field: name, value })
    }
}

fn offset_field(field: Option<&Lenient>, name: &'static str) -> Result<i64, ScheduleError> {
    let offset = field.and_then(Lenient::value).unwrap_or(0);
    bounded(offset, name, -MAX_OFFSET_SECS..=MAX_OFFSET_SECS)
}

fn epoch_value(field: Option<&Lenient>) -> Option<i64> {
    field
        .and_then(Lenient::value)
        .filter(|epoch| (1..=MAX_EPOCH).contains(epoch))
}

fn follow_up_url(candidate: Option<String>) -> Option<String> {
    candidate
        .map(|url| url.trim().to_string())
        .filter(|url| is_http_url(url))
}

#[derive(Debug, Deserialize)]
struct HourlyDocument {
    #[serde(rename = "Metadata")]
    metadata: HourlyMetadata,
    #[serde(flatten)]
    tables: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct HourlyMetadata {
    #[serde(rename = "Channels")]
    channels: Option<Lenient>,
    #[serde(rename = "Timestamp")]
    timestamp: Option<Lenient>,
    #[serde(rename = "Timestamp_offset")]
    timestamp_offset: Option<Lenient>,
    #[serde(rename = "Hours_count")]
    hours_count: Option<Lenient>,
    #[serde(rename = "Fetch_url")]
    fetch_url: Option<String>,
}

fn decode_hourly(body: &[u8]) -> Result<Schedule, ScheduleError> {
    let document: HourlyDocument = serde_json::from_slice(body)?;
    let meta = document.metadata;

    let channel_count = bounded(
        required(meta.channels.as_ref(), "Channels")?.max(0),
        "Channels",
        0..=MAX_CHANNELS,
    )? as usize;
    let issued_at = bounded(
        required(meta.timestamp.as_ref(), "Timestamp")?,
        "Timestamp",
        0..=MAX_EPOCH,
    )?;
    let offset = offset_field(meta.timestamp_offset.as_ref(), "Timestamp_offset")?;
    let hours_count = bounded(
        required(meta.hours_count.as_ref(), "Hours_count")?.max(0),
        "Hours_count",
        0..=MAX_HOURS_COUNT,
    )?;

    let hour_start = issued_at - (issued_at + offset).rem_euclid(HOUR_SECS);
    let mut channels = Vec::with_capacity(channel_count);

    for id in 1..=channel_count {
        let Some(table) = document.tables.get(&format!("Channel{id}")) else {
            log::warn!("schedule has no table for channel {id}");
            continue;
        };
        let buckets = hourly_buckets(id, table)?;

        let issue_hour = local_hour(issued_at, offset);
        let current = *buckets
            .get(&issue_hour)
            .ok_or(ScheduleError::MissingBucket {
                channel: id,
                hour: issue_hour,
            })?;

        let transitions = (0..hours_count)
            .filter_map(|step| {
                let at = hour_start + step * HOUR_SECS;
                let hour = local_hour(at, offset);
                match buckets.get(&hour) {
                    Some(state) => Some(Transition { at, state: *state }),
                    None => {
                        log::warn!("channel {id} has no state for hour {hour}, skipping");
                        None
                    }
                }
            })
            .collect();

        channels.push(ChannelPlan::new(id, current, issued_at, transitions));
    }

    Ok(Schedule {
        metadata: ScheduleMetadata {
            channels: channel_count,
            issued_at,
            timestamp_offset: offset,
            valid_until: issued_at + (hours_count - 1) * HOUR_SECS,
            fetch_url: follow_up_url(meta.fetch_url),
            version: JsonVersion::V1,
        },
        channels,
    })
}

fn hourly_buckets(channel: usize, table: &Value) -> Result<BTreeMap<u8, ChannelState>, ScheduleError> {
    let raw: BTreeMap<String, Lenient> = serde_json::from_value(table.clone())?;
    let mut buckets = BTreeMap::new();

    for (key, value) in raw {
        let Some(hour) = key.trim().parse::<u8>().ok().filter(|hour| *hour < 24) else {
            log::warn!("channel {channel} has unknown hour key `{key}`, skipping");
            continue;
        };
        let flag = value.value().unwrap_or(-1);
        match ChannelState::from_flag(flag) {
            Some(state) => {
                buckets.insert(hour, state);
            }
            None => log::warn!("channel {channel} hour {hour} has invalid state {flag}, skipping"),
        }
    }

    Ok(buckets)
}

#[derive(Debug, Deserialize)]
struct TimestampedDocument {
    metadata: TimestampedMetadata,
    #[serde(default)]
    controls: Vec<ControlEntry>,
}

#[derive(Debug, Deserialize)]
struct TimestampedMetadata {
    channels: Option<Lenient>,
    timestamp: Option<Lenient>,
    timestamp_offset: Option<Lenient>,
    valid_until: Option<Lenient>,
    fetch_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControlEntry {
    id: Option<Lenient>,
    state: Option<Lenient>,
    updated: Option<Lenient>,
    #[serde(default)]
    schedules: Vec<ScheduleEntry>,
}

#[derive(Debug, Deserialize)]
struct ScheduleEntry {
    timestamp: Option<Lenient>,
    state: Option<Lenient>,
}

fn decode_timestamped(body: &[u8]) -> Result<Schedule, ScheduleError> {
    let document: TimestampedDocument = serde_json::from_slice(body)?;
    let meta = document.metadata;

    let channel_count = bounded(
        required(meta.channels.as_ref(), "channels")?.max(0),
        "channels",
        0..=MAX_CHANNELS,
    )? as usize;
    let issued_at = bounded(
        required(meta.timestamp.as_ref(), "timestamp")?,
        "timestamp",
        0..=MAX_EPOCH,
    )?;
    let valid_until = bounded(
        required(meta.valid_until.as_ref(), "valid_until")?,
        "valid_until",
        0..=MAX_EPOCH,
    )?;
    let offset = offset_field(meta.timestamp_offset.as_ref(), "timestamp_offset")?;

    let mut channels: Vec<ChannelPlan> = Vec::with_capacity(channel_count);

    for control in document.controls {
        let id = control.id.as_ref().and_then(Lenient::value).unwrap_or(0);
        if id <= 0 {
            continue;
        }
        let id = id as usize;
        if id > channel_count {
            log::warn!("control for channel {id} exceeds channel count {channel_count}, ignoring");
            continue;
        }

        let flag = control.state.as_ref().and_then(Lenient::value).unwrap_or(-1);
        let current = ChannelState::from_flag(flag)
            .ok_or(ScheduleError::InvalidState { channel: id, value: flag })?;
        let updated = epoch_value(control.updated.as_ref()).unwrap_or(0);

        let transitions = control
            .schedules
            .iter()
            .filter_map(|entry| {
                let at = epoch_value(entry.timestamp.as_ref())?;
                let flag = entry.state.as_ref().and_then(Lenient::value).unwrap_or(-1);
                match ChannelState::from_flag(flag) {
                    Some(state) => Some(Transition { at, state }),
                    None => {
                        log::warn!("channel {id} entry at {at} has invalid state {flag}, dropping");
                        None
                    }
                }
            })
            .collect();

        let plan = ChannelPlan::new(id, current, updated, transitions);
        match channels.iter_mut().find(|existing| existing.id == id) {
            Some(existing) => *existing = plan,
            None => channels.push(plan),
        }
    }

    channels.sort_by_key(|plan| plan.id);

    Ok(Schedule {
        metadata: ScheduleMetadata {
            channels: channel_count,
            issued_at,
            timestamp_offset: offset,
            valid_until,
            fetch_url: follow_up_url(meta.fetch_url),
            version: JsonVersion::V2,
        },
        channels,
    })
}
