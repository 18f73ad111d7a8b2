pub mod agent;
pub mod api;
pub mod boot;
pub mod channels;
pub mod config;
pub mod http;
pub mod lag;
pub mod machine;
pub mod platform;
pub mod token;
pub mod types;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentAction, Tick, TickScheduler};
pub use api::{ApiClient, ApiError, TokenGrant};
pub use boot::{BootInfo, BootOutcome};
pub use channels::*;
pub use config::{AgentConfig, ApiConfig, CredentialConfig, NetworkConfig, ScheduleConfig, SensorIds};
pub use machine::{MachineState, SignalPair};
pub use platform::{
    Clock, Endpoint, MemoryRegion, PersistentStore, PubSub, PublishError, StoreError, SystemClock,
    Transport, TransportError,
};
pub use token::{CredentialSnapshot, TokenManager, TokenState, SNAPSHOT_LEN};
pub use types::{InboundCommand, LagTransport, RemoteSample, SendRecord, TelemetryValue};
