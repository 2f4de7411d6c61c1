//! Strongly-typed identifiers.
//!
//! Broker-assigned and locally-assigned identifiers never mix: order state is
//! keyed on `BrokerOrderId` once the broker acknowledges an order and on
//! `LocalOrderId` (the idempotency key) before that.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(AccountId, "Broker account identifier.");
string_id!(InstrumentKey, "Instrument key (ticker, OCC symbol, contract id).");
string_id!(
    LocalOrderId,
    "Locally-assigned order id, doubling as the submission idempotency key."
);
string_id!(BrokerOrderId, "Broker-assigned order id.");
string_id!(
    EventId,
    "Broker-assigned event id, used to deduplicate redelivered events."
);
string_id!(SessionId, "Identity of a gateway session for checkpoint matching.");

impl LocalOrderId {
    /// Generate a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
