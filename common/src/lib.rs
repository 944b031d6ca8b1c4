pub mod actuator;
pub mod clock;
pub mod config;
pub mod context;
pub mod failsafe;
pub mod fetcher;
pub mod indicator;
pub mod orchestrator;
pub mod reconciler;
pub mod schedule;
pub mod status;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use actuator::{ActuationError, Actuator, BusPublisher, ChannelBank, OutputPin};
pub use clock::{ClockError, ClockSync, OffsetClock, TimeSource};
pub use config::{CadenceConfig, ChannelConfig, ChannelOutput, ConfigError, DeviceConfig, KnownNetwork, MqttConfig};
pub use context::ControllerContext;
pub use failsafe::{FailsafeError, FailsafePattern};
pub use fetcher::{FetchResult, FetchState, HttpReply, ScheduleFetcher, ScheduleTransport, TransportError};
pub use indicator::FatalSignal;
pub use orchestrator::{
    Cadence, ConnectivityProbe, Orchestrator, SharedOrchestrator, TickOutcome, TickReport, CLIENT_VERSION,
};
pub use reconciler::{PassReport, ReconcileOutcome, Reconciler};
pub use schedule::{ChannelPlan, JsonVersion, Schedule, ScheduleError, ScheduleMetadata, Transition};
pub use status::{format_uptime, render_status_page};
pub use topics::*;
pub use types::{
    ChannelState, ChannelStatus, Connectivity, ControllerStatus, CyclePhase, FetchStatus, OutputMode,
    ScheduleSummary, UpcomingTransition,
};
