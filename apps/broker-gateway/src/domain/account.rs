//! Account values (net liquidation, buying power, cash, ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identifiers::AccountId;

/// Decoded account value update from the broker.
///
/// `value` stays a string: brokers report numeric and textual keys through
/// the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountValueEvent {
    /// Account.
    pub account_id: AccountId,
    /// Key, e.g. `NetLiquidation`.
    pub key: String,
    /// Raw value.
    pub value: String,
    /// Currency, empty when not applicable.
    pub currency: String,
    /// Broker timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Cached account value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountValueRecord {
    /// Account.
    pub account_id: AccountId,
    /// Key.
    pub key: String,
    /// Raw value.
    pub value: String,
    /// Currency.
    pub currency: String,
    /// Timestamp of the update that produced this value.
    pub as_of: DateTime<Utc>,
}

impl AccountValueRecord {
    /// Cache key: values are distinct per `(key, currency)`.
    #[must_use]
    pub fn cache_key(&self) -> (String, String) {
        (self.key.clone(), self.currency.clone())
    }

    /// Last-write-wins merge. Strictly older updates are ignored.
    ///
    /// Returns whether the record changed.
    pub fn merge(&mut self, event: &AccountValueEvent) -> bool {
        if event.timestamp < self.as_of {
            return false;
        }
        let changed = self.value != event.value || self.as_of != event.timestamp;
        self.value.clone_from(&event.value);
        self.as_of = event.timestamp;
        changed
    }
}

impl From<&AccountValueEvent> for AccountValueRecord {
    fn from(event: &AccountValueEvent) -> Self {
        Self {
            account_id: event.account_id.clone(),
            key: event.key.clone(),
            value: event.value.clone(),
            currency: event.currency.clone(),
            as_of: event.timestamp,
        }
    }
}
