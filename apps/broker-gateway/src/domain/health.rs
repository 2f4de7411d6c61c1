//! Health signal exposed to the execution-intent caller.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::connection::ConnectionState;

/// Overall health status. Ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    #[default]
    Healthy,
    /// Functional, but something needs attention.
    Degraded,
    /// Do not trade.
    Down,
}

impl HealthStatus {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A component that reports health conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// Broker session.
    Connection,
    /// Downstream event forwarding.
    Forwarder,
    /// Reconciliation loop.
    Reconciliation,
}

impl Component {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Forwarder => "forwarder",
            Self::Reconciliation => "reconciliation",
        }
    }
}

/// Condition reported by one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component.
    pub component: Component,
    /// Its status.
    pub status: HealthStatus,
    /// Why it is not healthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the status last changed.
    pub since: DateTime<Utc>,
}

/// Aggregate health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst component status.
    pub status: HealthStatus,
    /// Current connection state.
    pub connection_state: ConnectionState,
    /// Per-component conditions.
    pub components: Vec<ComponentHealth>,
    /// When the report was produced.
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    /// Reasons of every non-healthy component, joined for display.
    #[must_use]
    pub fn summary(&self) -> String {
        let reasons: Vec<String> = self
            .components
            .iter()
            .filter(|c| c.status != HealthStatus::Healthy)
            .map(|c| {
                format!(
                    "{}: {}",
                    c.component.as_str(),
                    c.reason.as_deref().unwrap_or(c.status.as_str())
                )
            })
            .collect();
        if reasons.is_empty() {
            self.status.as_str().to_string()
        } else {
            reasons.join("; ")
        }
    }
}
