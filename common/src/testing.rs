use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::{
    actuator::{ActuationError, Actuator, BusPublisher, ChannelBank, OutputPin},
    clock::{ClockError, ClockSync, TimeSource},
    context::ControllerContext,
    fetcher::{HttpReply, ScheduleTransport, TransportError},
    orchestrator::ConnectivityProbe,
    types::Connectivity,
};

#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
    commits: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        let clock = Self::default();
        clock.set(now);
        clock
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn now_value(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn fail_commits(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> i64 {
        self.now_value()
    }

    fn commit(&mut self, at: DateTime<Utc>) -> Result<(), ClockError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClockError::Rejected("rtc write failed".into()));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.set(at.timestamp());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<VecDeque<Result<HttpReply, TransportError>>>>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn reply(&self, status: u16, body: Vec<u8>) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(HttpReply { status, body }));
    }

    pub fn fail(&self, err: TransportError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl ScheduleTransport for ScriptedTransport {
    fn get(&mut self, url: &str) -> Result<HttpReply, TransportError> {
        self.requested.lock().unwrap().push(url.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Io("no scripted reply".into())))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPin {
    levels: Arc<Mutex<Vec<bool>>>,
    fail: Arc<AtomicBool>,
}

impl RecordingPin {
    pub fn levels(&self) -> Vec<bool> {
        self.levels.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl OutputPin for RecordingPin {
    fn set_level(&mut self, high: bool) -> Result<(), ActuationError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ActuationError::Pin {
                pin: -1,
                reason: "driver fault".into(),
            });
        }
        self.levels.lock().unwrap().push(high);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, &'static str)>>,
}

impl RecordingPublisher {
    pub fn messages(&self) -> Vec<(String, &'static str)> {
        self.messages.lock().unwrap().clone()
    }
}

impl BusPublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: &'static str) -> Result<(), ActuationError> {
        self.messages
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    state: Arc<Mutex<Connectivity>>,
}

impl ScriptedProbe {
    pub fn new(state: Connectivity) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set(&self, state: Connectivity) {
        *self.state.lock().unwrap() = state;
    }
}

impl ConnectivityProbe for ScriptedProbe {
    fn refresh(&mut self) -> Connectivity {
        *self.state.lock().unwrap()
    }
}

pub fn pin_bank(channels: usize) -> (ChannelBank, Vec<RecordingPin>) {
    let pins: Vec<RecordingPin> = (0..channels).map(|_| RecordingPin::default()).collect();
    let actuators = pins
        .iter()
        .enumerate()
        .map(|(index, pin)| Actuator::Digital {
            pin: index as i32,
            driver: Box::new(pin.clone()),
        })
        .collect();
    (ChannelBank::new(actuators), pins)
}

pub fn context(channels: usize) -> ControllerContext {
    ControllerContext::new(
        "aabbccddeeff",
        "Rust-test",
        channels,
        ClockSync::new(1, Duration::ZERO, 0),
        None,
    )
}

pub fn control(id: usize, state: i64, updated: i64, entries: &[(i64, i64)]) -> Value {
    json!({
        "id": id,
        "state": state,
        "updated": updated,
        "schedules": entries
            .iter()
            .map(|(timestamp, state)| json!({"timestamp": timestamp, "state": state}))
            .collect::<Vec<_>>(),
    })
}

pub fn schedule_body(issued: i64, valid_until: i64, controls: Vec<Value>) -> Vec<u8> {
    json!({
        "metadata": {
            "channels": controls.len(),
            "timestamp": issued,
            "timestamp_offset": 0,
            "valid_until": valid_until,
            "fetch_url": "https://api.porssari.fi/getcontrols.php",
        },
        "controls": controls,
    })
    .to_string()
    .into_bytes()
}
