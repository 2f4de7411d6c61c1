//! Health Monitor
//!
//! Aggregates per-component conditions into one `Healthy | Degraded | Down`
//! signal. The overall status is the worst component status and is published
//! through a `watch` channel so the execution-intent side can observe it.

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::domain::connection::ConnectionState;
use crate::domain::health::{Component, ComponentHealth, HealthReport, HealthStatus};

#[derive(Debug)]
struct Conditions {
    components: BTreeMap<Component, ComponentHealth>,
    connection_state: ConnectionState,
}

/// Health aggregator.
#[derive(Debug)]
pub struct HealthMonitor {
    conditions: Mutex<Conditions>,
    status_tx: watch::Sender<HealthStatus>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// Create a monitor with no conditions (healthy).
    #[must_use]
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(HealthStatus::Healthy);
        Self {
            conditions: Mutex::new(Conditions {
                components: BTreeMap::new(),
                connection_state: ConnectionState::Disconnected,
            }),
            status_tx,
        }
    }

    /// Set a component's condition. No-op if nothing changed.
    pub fn set(&self, component: Component, status: HealthStatus, reason: Option<String>) {
        let mut conditions = self.conditions.lock();
        let unchanged = conditions
            .components
            .get(&component)
            .is_some_and(|c| c.status == status && c.reason == reason);
        if unchanged {
            return;
        }

        if status == HealthStatus::Healthy {
            tracing::info!(component = component.as_str(), "Component healthy");
        } else {
            tracing::warn!(
                component = component.as_str(),
                status = status.as_str(),
                reason = reason.as_deref().unwrap_or(""),
                "Component health changed"
            );
        }

        conditions.components.insert(
            component,
            ComponentHealth {
                component,
                status,
                reason,
                since: Utc::now(),
            },
        );
        self.publish(&conditions);
    }

    /// Mark a component healthy.
    pub fn clear(&self, component: Component) {
        self.set(component, HealthStatus::Healthy, None);
    }

    /// Record a connection state change and derive the connection condition.
    pub fn set_connection_state(&self, state: ConnectionState, reason: Option<String>) {
        let status = match state {
            ConnectionState::Ready => HealthStatus::Healthy,
            ConnectionState::Connecting
            | ConnectionState::Authenticating
            | ConnectionState::Reconnecting => HealthStatus::Degraded,
            ConnectionState::Disconnected | ConnectionState::FailedPermanently => {
                HealthStatus::Down
            }
        };
        let reason = if status == HealthStatus::Healthy {
            None
        } else {
            Some(reason.unwrap_or_else(|| state.as_str().to_string()))
        };

        self.conditions.lock().connection_state = state;
        self.set(Component::Connection, status, reason);
    }

    /// Overall status.
    #[must_use]
    pub fn status(&self) -> HealthStatus {
        *self.status_tx.borrow()
    }

    /// One component's status. Unknown components are healthy.
    #[must_use]
    pub fn component_status(&self, component: Component) -> HealthStatus {
        self.conditions
            .lock()
            .components
            .get(&component)
            .map_or(HealthStatus::Healthy, |c| c.status)
    }

    /// Observe the overall status.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<HealthStatus> {
        self.status_tx.subscribe()
    }

    /// Full report.
    #[must_use]
    pub fn report(&self) -> HealthReport {
        let conditions = self.conditions.lock();
        HealthReport {
            status: aggregate(&conditions),
            connection_state: conditions.connection_state,
            components: conditions.components.values().cloned().collect(),
            generated_at: Utc::now(),
        }
    }

    fn publish(&self, conditions: &Conditions) {
        let status = aggregate(conditions);
        metrics::gauge!("gateway_health_status").set(match status {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Degraded => 1.0,
            HealthStatus::Down => 2.0,
        });
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                tracing::info!(from = current.as_str(), to = status.as_str(), "Gateway health changed");
                *current = status;
                true
            }
        });
    }
}

fn aggregate(conditions: &Conditions) -> HealthStatus {
    conditions
        .components
        .values()
        .map(|c| c.status)
        .max()
        .unwrap_or_default()
}
