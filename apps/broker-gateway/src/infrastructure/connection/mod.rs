//! Broker connection management: the session state machine, its heartbeat
//! and the handle the rest of the gateway uses to reach it.

mod heartbeat;
mod manager;

pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, HeartbeatState};
pub use manager::{ConnectionHandle, ConnectionManager, ConnectionSettings};
