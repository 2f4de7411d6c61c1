//! Checkpoint lifecycle: restore on startup, save periodically and on
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::application::ports::{CheckpointStore, CheckpointStoreError};
use crate::application::state::StateManager;
use crate::domain::checkpoint::{Checkpoint, CheckpointRejection};
use crate::domain::{AccountId, SessionId};

/// Checkpoint errors.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Storage failed.
    #[error(transparent)]
    Store(#[from] CheckpointStoreError),

    /// Encoding failed.
    #[error("checkpoint encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reads and writes the checkpoint for one session identity and account.
pub struct CheckpointKeeper {
    store: Arc<dyn CheckpointStore>,
    session_id: SessionId,
    account_id: AccountId,
    ttl: Duration,
}

impl std::fmt::Debug for CheckpointKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointKeeper")
            .field("session_id", &self.session_id)
            .field("account_id", &self.account_id)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CheckpointKeeper {
    /// Create a keeper.
    #[must_use]
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        session_id: SessionId,
        account_id: AccountId,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            session_id,
            account_id,
            ttl,
        }
    }

    /// Load the stored checkpoint and seed the state cursors from it.
    ///
    /// Anything doubtful (unreadable, unparseable, wrong version, session
    /// or account, stale) is discarded and removed from the store.
    pub async fn restore(&self, state: &StateManager) -> Option<Checkpoint> {
        let blob = match self.store.load().await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                tracing::info!("No checkpoint found, reconciling from scratch");
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Checkpoint unreadable, reconciling from scratch");
                return None;
            }
        };

        match self.accept(&blob) {
            Ok(checkpoint) => {
                state.seed_cursors(
                    &self.account_id,
                    checkpoint.last_known_order_cursor.clone(),
                    checkpoint.last_known_account_cursor,
                );
                tracing::info!(
                    saved_at = %checkpoint.saved_at,
                    order_cursor = ?checkpoint.last_known_order_cursor,
                    "Checkpoint restored"
                );
                Some(checkpoint)
            }
            Err(rejection) => {
                metrics::counter!("gateway_checkpoints_discarded_total").increment(1);
                tracing::warn!(reason = %rejection, "Checkpoint discarded");
                if let Err(err) = self.store.clear().await {
                    tracing::warn!(error = %err, "Failed to remove discarded checkpoint");
                }
                None
            }
        }
    }

    /// Write the current cursors.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or storage fails.
    pub async fn save(&self, state: &StateManager) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint::new(
            self.session_id.clone(),
            self.account_id.clone(),
            state.order_cursor(&self.account_id),
            state.account_cursor(&self.account_id),
            Utc::now(),
        );
        self.store.save(&checkpoint.encode()?).await?;
        metrics::counter!("gateway_checkpoints_saved_total").increment(1);
        tracing::debug!(order_cursor = ?checkpoint.last_known_order_cursor, "Checkpoint saved");
        Ok(checkpoint)
    }

    fn accept(&self, blob: &[u8]) -> Result<Checkpoint, CheckpointRejection> {
        let checkpoint = Checkpoint::decode(blob)?;
        checkpoint.validate(&self.session_id, &self.account_id, self.ttl, Utc::now())?;
        Ok(checkpoint)
    }
}
