use std::sync::Arc;

use crate::{
    config::{ChannelOutput, DeviceConfig},
    topics::{PAYLOAD_OFF, PAYLOAD_ON},
    types::{ChannelState, ChannelStatus},
};

#[derive(Debug, thiserror::Error)]
pub enum ActuationError {
    #[error("gpio {pin}: {reason}")]
    Pin { pin: i32, reason: String },
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("channel {0} publishes to mqtt but no publisher is available")]
    NoPublisher(usize),
}

pub trait OutputPin: Send {
    fn set_level(&mut self, high: bool) -> Result<(), ActuationError>;
}

pub trait BusPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &'static str) -> Result<(), ActuationError>;
}

pub enum Actuator {
    Digital {
        pin: i32,
        driver: Box<dyn OutputPin>,
    },
    Bus {
        topic: String,
        publisher: Arc<dyn BusPublisher>,
    },
}

impl Actuator {
    pub fn apply(&mut self, state: ChannelState) -> Result<(), ActuationError> {
        match self {
            Self::Digital { driver, .. } => driver.set_level(state.is_on()),
            Self::Bus { topic, publisher } => {
                let payload = if state.is_on() { PAYLOAD_ON } else { PAYLOAD_OFF };
                publisher.publish(topic, payload)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Digital { .. } => "GPIO",
            Self::Bus { .. } => "MQTT",
        }
    }

    pub fn target(&self) -> String {
        match self {
            Self::Digital { pin, .. } => format!("pin {pin}"),
            Self::Bus { topic, .. } => topic.clone(),
        }
    }
}

struct ChannelSlot {
    id: usize,
    actuator: Actuator,
    driven: Option<ChannelState>,
}

/// Channel outputs indexed by position; channel `id` lives at `id - 1`.
pub struct ChannelBank {
    slots: Vec<ChannelSlot>,
}

impl ChannelBank {
    pub fn new(actuators: Vec<Actuator>) -> Self {
        let slots = actuators
            .into_iter()
            .enumerate()
            .map(|(index, actuator)| ChannelSlot {
                id: index + 1,
                actuator,
                driven: None,
            })
            .collect();
        Self { slots }
    }

    pub fn from_config<F>(
        config: &DeviceConfig,
        device_id: &str,
        mut open_pin: F,
        publisher: Option<Arc<dyn BusPublisher>>,
    ) -> Result<Self, ActuationError>
    where
        F: FnMut(i32) -> Result<Box<dyn OutputPin>, ActuationError>,
    {
        let mut actuators = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            let actuator = match &channel.output {
                ChannelOutput::Gpio { pin } => Actuator::Digital {
                    pin: *pin,
                    driver: open_pin(*pin)?,
                },
                ChannelOutput::Mqtt { .. } => Actuator::Bus {
                    topic: channel
                        .resolved_topic(device_id)
                        .unwrap_or_default(),
                    publisher: publisher
                        .clone()
                        .ok_or(ActuationError::NoPublisher(channel.id))?,
                },
            };
            actuators.push(actuator);
        }
        Ok(Self::new(actuators))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn id_at(&self, index: usize) -> usize {
        self.slots.get(index).map_or(index + 1, |slot| slot.id)
    }

    pub fn driven(&self, index: usize) -> Option<ChannelState> {
        self.slots.get(index).and_then(|slot| slot.driven)
    }

    pub fn drive(&mut self, index: usize, state: ChannelState) -> Result<(), ActuationError> {
        let Some(slot) = self.slots.get_mut(index) else {
            return Ok(());
        };
        slot.actuator.apply(state)?;
        slot.driven = Some(state);
        Ok(())
    }

    pub fn statuses(&self, stamps: &[Option<i64>]) -> Vec<ChannelStatus> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| ChannelStatus {
                id: slot.id,
                kind: slot.actuator.kind(),
                target: slot.actuator.target(),
                state: slot.driven,
                last_applied: stamps.get(index).copied().flatten(),
            })
            .collect()
    }
}
