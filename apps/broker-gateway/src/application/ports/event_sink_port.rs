//! Event Sink Port (Driven Port)
//!
//! The downstream consumer of forwarded broker events.

use tokio::sync::mpsc;

use crate::domain::events::BrokerEvent;

/// Why the sink did not take an event. The event is handed back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The consumer is not keeping up.
    #[error("event sink is full")]
    Full(BrokerEvent),

    /// The consumer is gone.
    #[error("event sink is closed")]
    Closed(BrokerEvent),
}

impl SinkError {
    /// Recover the rejected event.
    #[must_use]
    pub fn into_event(self) -> BrokerEvent {
        match self {
            Self::Full(event) | Self::Closed(event) => event,
        }
    }
}

/// Port for publishing events downstream without blocking.
pub trait EventSink: Send + Sync {
    /// Offer one event.
    fn try_publish(&self, event: BrokerEvent) -> Result<(), SinkError>;
}

impl EventSink for mpsc::Sender<BrokerEvent> {
    fn try_publish(&self, event: BrokerEvent) -> Result<(), SinkError> {
        self.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(event) => SinkError::Full(event),
            mpsc::error::TrySendError::Closed(event) => SinkError::Closed(event),
        })
    }
}
