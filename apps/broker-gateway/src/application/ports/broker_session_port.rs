//! Broker Session Port (Driver Port)
//!
//! The view of a live session used by the dispatch adapters and the
//! reconciliation loop.

use std::time::Duration;

use async_trait::async_trait;

use super::broker_transport_port::{BrokerRequest, BrokerResponse};
use crate::application::pipeline::SnapshotOutcome;
use crate::domain::connection::ConnectionState;
use crate::domain::{AccountId, EventId};
use crate::error::GatewayError;

/// Port for issuing requests over the managed session.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Write a request that expects no correlated response.
    ///
    /// Fails immediately with `NotConnected` unless the session is ready.
    async fn send(&self, request: BrokerRequest) -> Result<(), GatewayError>;

    /// Write a request and wait for its correlated response.
    ///
    /// A response arriving after `timeout` is discarded.
    async fn request(
        &self,
        request: BrokerRequest,
        timeout: Duration,
    ) -> Result<BrokerResponse, GatewayError>;

    /// Request an account snapshot and wait until it has been applied to
    /// the local cache.
    ///
    /// The answer is applied in stream order: events the broker sent before
    /// it land first, events sent after it land on top of it.
    async fn snapshot(
        &self,
        account_id: &AccountId,
        order_cursor: Option<EventId>,
        timeout: Duration,
    ) -> Result<SnapshotOutcome, GatewayError>;
}
