//! Durable checkpoint record.
//!
//! A checkpoint only narrows the scope of the first reconciliation after
//! startup. It is never trusted over broker truth, and anything doubtful
//! about it causes it to be discarded.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::identifiers::{AccountId, EventId, SessionId};

/// Current checkpoint schema version.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Persisted reconciliation cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Schema version of this blob.
    pub schema_version: u32,
    /// Session identity that wrote it.
    pub session_id: SessionId,
    /// Account it describes.
    pub account_id: AccountId,
    /// Last order event applied.
    pub last_known_order_cursor: Option<EventId>,
    /// Timestamp of the newest account value applied.
    pub last_known_account_cursor: Option<DateTime<Utc>>,
    /// When it was written.
    pub saved_at: DateTime<Utc>,
}

/// Why a checkpoint was discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointRejection {
    /// The blob did not parse.
    #[error("unparseable checkpoint: {0}")]
    Unparseable(String),

    /// Written by a different schema version.
    #[error("schema version {found} does not match {expected}")]
    SchemaVersion {
        /// Version in the blob.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },

    /// Written by a different session identity.
    #[error("session {found} does not match configured session {expected}")]
    SessionMismatch {
        /// Session in the blob.
        found: SessionId,
        /// Configured session.
        expected: SessionId,
    },

    /// Written for a different account.
    #[error("account {found} does not match configured account {expected}")]
    AccountMismatch {
        /// Account in the blob.
        found: AccountId,
        /// Configured account.
        expected: AccountId,
    },

    /// Older than the configured TTL, or dated in the future.
    #[error("checkpoint saved at {saved_at} is stale")]
    Stale {
        /// Save time in the blob.
        saved_at: DateTime<Utc>,
    },
}

impl Checkpoint {
    /// Build a checkpoint for the current schema.
    #[must_use]
    pub const fn new(
        session_id: SessionId,
        account_id: AccountId,
        last_known_order_cursor: Option<EventId>,
        last_known_account_cursor: Option<DateTime<Utc>>,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            session_id,
            account_id,
            last_known_order_cursor,
            last_known_account_cursor,
            saved_at,
        }
    }

    /// Parse a blob.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointRejection::Unparseable`] if the blob is not a
    /// checkpoint.
    pub fn decode(bytes: &[u8]) -> Result<Self, CheckpointRejection> {
        serde_json::from_slice(bytes).map_err(|e| CheckpointRejection::Unparseable(e.to_string()))
    }

    /// Serialize to a blob.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Check that the checkpoint may seed reconciliation.
    ///
    /// # Errors
    ///
    /// Returns the first reason the checkpoint must be discarded.
    pub fn validate(
        &self,
        session_id: &SessionId,
        account_id: &AccountId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), CheckpointRejection> {
        if self.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointRejection::SchemaVersion {
                found: self.schema_version,
                expected: CHECKPOINT_SCHEMA_VERSION,
            });
        }
        if &self.session_id != session_id {
            return Err(CheckpointRejection::SessionMismatch {
                found: self.session_id.clone(),
                expected: session_id.clone(),
            });
        }
        if &self.account_id != account_id {
            return Err(CheckpointRejection::AccountMismatch {
                found: self.account_id.clone(),
                expected: account_id.clone(),
            });
        }

        let stale = match (now - self.saved_at).to_std() {
            Ok(age) => age > ttl,
            // negative age: clock skew or a forged blob
            Err(_) => true,
        };
        if stale {
            return Err(CheckpointRejection::Stale {
                saved_at: self.saved_at,
            });
        }
        Ok(())
    }
}
