//! Port Interfaces
//!
//! Contracts between the core and the outside world, following the
//! hexagonal layout.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BrokerTransport`: the physical broker session (connect, authenticate,
//!   send, receive). Owned by the connection event loop.
//! - `CheckpointStore`: durable storage for the checkpoint blob.
//! - `EventSink`: the downstream consumer of forwarded broker events.
//!
//! ## Driver Ports (Inbound)
//!
//! - `BrokerSession`: what the dispatch adapters and reconciliation loop see
//!   of a live session. Implemented by the connection handle.

mod broker_session_port;
mod broker_transport_port;
mod checkpoint_store_port;
mod event_sink_port;

pub use broker_session_port::BrokerSession;
pub use broker_transport_port::{
    BrokerRequest, BrokerResponse, BrokerTransport, Credentials, InboundMessage,
    OutboundEnvelope, RequestId, SessionInfo, TransportError,
};
pub use checkpoint_store_port::{CheckpointStore, CheckpointStoreError};
pub use event_sink_port::{EventSink, SinkError};
