use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::types::ChannelState;

#[derive(Debug, thiserror::Error)]
pub enum FailsafeError {
    #[error("failsafe pattern is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failsafe pattern must be an object keyed by hour")]
    NotAnObject,
    #[error("failsafe hour key `{0}` is not 00..23")]
    InvalidHour(String),
    #[error("failsafe hour {hour} must list channels in an array")]
    NotAList { hour: u8 },
    #[error("failsafe hour {hour} has unrecognised channel `{value}`")]
    InvalidChannel { hour: u8, value: String },
}

/// Hour-of-day table of channels forced on while the schedule is stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailsafePattern {
    hours: BTreeMap<u8, BTreeSet<usize>>,
}

impl FailsafePattern {
    pub fn from_json(raw: &[u8]) -> Result<Self, FailsafeError> {
        let document: Value = serde_json::from_slice(raw)?;
        let Value::Object(entries) = document else {
            return Err(FailsafeError::NotAnObject);
        };

        let mut hours = BTreeMap::new();
        for (key, channels) in entries {
            let hour = parse_hour(&key)?;
            let Value::Array(channels) = channels else {
                return Err(FailsafeError::NotAList { hour });
            };

            let ids = channels
                .iter()
                .map(|channel| {
                    channel_id(channel).ok_or_else(|| FailsafeError::InvalidChannel {
                        hour,
                        value: channel.to_string(),
                    })
                })
                .collect::<Result<BTreeSet<_>, _>>()?;
            hours.insert(hour, ids);
        }

        Ok(Self { hours })
    }

    pub fn with_hour(mut self, hour: u8, channels: impl IntoIterator<Item = usize>) -> Self {
        self.hours.insert(hour % 24, channels.into_iter().collect());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.hours.is_empty()
    }

    pub fn covers(&self, hour: u8) -> bool {
        self.hours.contains_key(&hour)
    }

    pub fn channels_on(&self, hour: u8) -> Option<&BTreeSet<usize>> {
        self.hours.get(&hour)
    }

    /// `None` when the pattern has no entry for `hour`.
    pub fn state_for(&self, hour: u8, channel: usize) -> Option<ChannelState> {
        self.channels_on(hour).map(|on| {
            if on.contains(&channel) {
                ChannelState::On
            } else {
                ChannelState::Off
            }
        })
    }
}

fn parse_hour(key: &str) -> Result<u8, FailsafeError> {
    key.trim()
        .parse::<u8>()
        .ok()
        .filter(|hour| *hour < 24)
        .ok_or_else(|| FailsafeError::InvalidHour(key.to_string()))
}

// Accepts 3, "3" and the older "relay3" naming.
fn channel_id(value: &Value) -> Option<usize> {
    let id = match value {
        Value::Number(number) => number.as_u64().map(|id| id as usize),
        Value::String(text) => {
            let text = text.trim();
            let digits_at = text
                .char_indices()
                .rev()
                .take_while(|(_, ch)| ch.is_ascii_digit())
                .last()
                .map(|(index, _)| index)?;
            text[digits_at..].parse().ok()
        }
        _ => None,
    }?;

    (id > 0).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_mixed_channel_notation() {
        let raw = br#"{"00": ["relay1", "relay3"], "01": [2, "4"], "02": []}"#;
        let pattern = FailsafePattern::from_json(raw).unwrap();

        assert_eq!(
            pattern.channels_on(0).unwrap().iter().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(pattern.state_for(1, 2), Some(ChannelState::On));
        assert_eq!(pattern.state_for(1, 1), Some(ChannelState::Off));
        assert_eq!(pattern.state_for(2, 1), Some(ChannelState::Off));
        assert_eq!(pattern.state_for(3, 1), None);
        assert!(pattern.covers(2));
        assert!(!pattern.covers(23));
    }

    #[test]
    fn rejects_bad_hours_and_channels() {
        assert!(matches!(
            FailsafePattern::from_json(br#"{"24": []}"#),
            Err(FailsafeError::InvalidHour(_))
        ));
        assert!(matches!(
            FailsafePattern::from_json(br#"{"05": ["relay"]}"#),
            Err(FailsafeError::InvalidChannel { hour: 5, .. })
        ));
        assert!(matches!(
            FailsafePattern::from_json(br#"{"05": [0]}"#),
            Err(FailsafeError::InvalidChannel { hour: 5, .. })
        ));
        assert!(matches!(
            FailsafePattern::from_json(br#"{"05": "relay1"}"#),
            Err(FailsafeError::NotAList { hour: 5 })
        ));
        assert!(matches!(
            FailsafePattern::from_json(br#"[]"#),
            Err(FailsafeError::NotAnObject)
        ));
    }
}
