//! Backpressure-aware downstream forwarding.
//!
//! Events go to the sink unmodified and in order. When the sink is full,
//! canonical events queue in a backlog and are retried on every new event
//! and on a periodic flush; telemetry is shed instead. The backlog size
//! drives the forwarder's health condition.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::application::health::HealthMonitor;
use crate::application::ports::{EventSink, SinkError};
use crate::domain::events::BrokerEvent;
use crate::domain::health::{Component, HealthStatus};

/// Backlog watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderSettings {
    /// Backlog length at which health becomes `Degraded`.
    pub degraded_watermark: usize,
    /// Backlog length at which health becomes `Down`.
    pub down_watermark: usize,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            degraded_watermark: 1_000,
            down_watermark: 10_000,
        }
    }
}

/// Forwarding counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Events handed to the sink.
    pub forwarded: u64,
    /// Telemetry events shed.
    pub shed: u64,
    /// Canonical events currently waiting.
    pub backlog: usize,
}

/// Downstream publisher.
pub struct EventForwarder {
    sink: Arc<dyn EventSink>,
    health: Arc<HealthMonitor>,
    settings: ForwarderSettings,
    backlog: VecDeque<BrokerEvent>,
    stats: ForwarderStats,
    sink_closed: bool,
}

impl std::fmt::Debug for EventForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventForwarder")
            .field("settings", &self.settings)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl EventForwarder {
    /// Create a forwarder.
    #[must_use]
    pub fn new(
        sink: Arc<dyn EventSink>,
        health: Arc<HealthMonitor>,
        settings: ForwarderSettings,
    ) -> Self {
        Self {
            sink,
            health,
            settings,
            backlog: VecDeque::new(),
            stats: ForwarderStats::default(),
            sink_closed: false,
        }
    }

    /// Forward one event.
    pub fn forward(&mut self, event: BrokerEvent) {
        self.flush();

        if self.backlog.is_empty() {
            match self.sink.try_publish(event) {
                Ok(()) => self.stats.forwarded += 1,
                Err(err) => self.hold(err),
            }
        } else if event.is_canonical() {
            self.backlog.push_back(event);
        } else {
            self.shed(&event);
        }

        self.update_health();
    }

    /// Retry the backlog in order until the sink refuses again.
    pub fn flush(&mut self) {
        while let Some(event) = self.backlog.pop_front() {
            match self.sink.try_publish(event) {
                Ok(()) => {
                    self.stats.forwarded += 1;
                    if self.sink_closed {
                        self.sink_closed = false;
                        tracing::info!("Event sink accepting again");
                    }
                }
                Err(err) => {
                    self.backlog.push_front(err.into_event());
                    break;
                }
            }
        }
        self.update_health();
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            backlog: self.backlog.len(),
            ..self.stats
        }
    }

    fn hold(&mut self, err: SinkError) {
        if matches!(err, SinkError::Closed(_)) && !self.sink_closed {
            self.sink_closed = true;
            tracing::error!("Event sink closed, buffering canonical events");
        }
        let event = err.into_event();
        if event.is_canonical() {
            self.backlog.push_back(event);
        } else {
            self.shed(&event);
        }
    }

    fn shed(&mut self, event: &BrokerEvent) {
        self.stats.shed += 1;
        metrics::counter!("gateway_forward_shed_total", "kind" => event.kind()).increment(1);
        tracing::trace!(kind = event.kind(), "Telemetry shed under backpressure");
    }

    fn update_health(&self) {
        let len = self.backlog.len();
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("gateway_forward_backlog").set(len as f64);

        if len >= self.settings.down_watermark {
            self.health.set(
                Component::Forwarder,
                HealthStatus::Down,
                Some(format!("{len} canonical events backlogged")),
            );
        } else if len >= self.settings.degraded_watermark {
            self.health.set(
                Component::Forwarder,
                HealthStatus::Degraded,
                Some("downstream backpressure".to_string()),
            );
        } else if self.health.component_status(Component::Forwarder) != HealthStatus::Healthy {
            self.health.clear(Component::Forwarder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::TelemetryEvent;
    use crate::domain::market::QuoteEvent;
    use crate::domain::InstrumentKey;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn quote(symbol: &str) -> BrokerEvent {
        BrokerEvent::Quote(QuoteEvent {
            instrument: InstrumentKey::from(symbol),
            bid: None,
            ask: None,
            bid_size: None,
            ask_size: None,
            last: None,
            timestamp: Utc::now(),
        })
    }

    fn telemetry() -> BrokerEvent {
        BrokerEvent::Telemetry(TelemetryEvent {
            topic: "farm".to_string(),
            message: "ok".to_string(),
            timestamp: Utc::now(),
        })
    }

    fn forwarder(capacity: usize) -> (EventForwarder, mpsc::Receiver<BrokerEvent>, Arc<HealthMonitor>) {
        let (tx, rx) = mpsc::channel(capacity);
        let health = Arc::new(HealthMonitor::new());
        let fwd = EventForwarder::new(
            Arc::new(tx),
            Arc::clone(&health),
            ForwarderSettings {
                degraded_watermark: 2,
                down_watermark: 4,
            },
        );
        (fwd, rx, health)
    }

    #[test]
    fn sheds_telemetry_but_keeps_canonical() {
        let (mut fwd, mut rx, _) = forwarder(1);
        fwd.forward(quote("A"));
        fwd.forward(telemetry());
        fwd.forward(quote("B"));
        fwd.forward(telemetry());
        fwd.forward(quote("C"));

        let stats = fwd.stats();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.shed, 2);
        assert_eq!(stats.backlog, 2);

        let mut delivered = Vec::new();
        for _ in 0..3 {
            delivered.push(rx.try_recv().unwrap());
            fwd.flush();
        }
        let symbols: Vec<_> = delivered
            .iter()
            .map(|e| match e {
                BrokerEvent::Quote(q) => q.instrument.to_string(),
                other => other.kind().to_string(),
            })
            .collect();
        assert_eq!(symbols, ["A", "B", "C"]);
    }

    #[test]
    fn backlog_escalates_health() {
        let (mut fwd, mut rx, health) = forwarder(1);
        fwd.forward(quote("0"));
        for i in 1..=2 {
            fwd.forward(quote(&i.to_string()));
        }
        assert_eq!(health.component_status(Component::Forwarder), HealthStatus::Degraded);

        for i in 3..=4 {
            fwd.forward(quote(&i.to_string()));
        }
        assert_eq!(health.component_status(Component::Forwarder), HealthStatus::Down);

        while rx.try_recv().is_ok() {
            fwd.flush();
        }
        assert_eq!(fwd.stats().backlog, 0);
        assert_eq!(health.component_status(Component::Forwarder), HealthStatus::Healthy);
    }

    #[test]
    fn closed_sink_never_drops_canonical_events() {
        let (mut fwd, rx, _) = forwarder(8);
        drop(rx);
        fwd.forward(quote("A"));
        fwd.forward(telemetry());
        assert_eq!(fwd.stats().backlog, 1);
        assert_eq!(fwd.stats().shed, 1);
    }
}
