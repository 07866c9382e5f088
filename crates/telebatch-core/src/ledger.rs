//! Ledger collaborator: best-effort anchoring of uploaded batches.
//!
//! A notifier failure never changes the outcome of the upload it follows;
//! the engine logs it and counts it in [`crate::engine::EngineStats`].

use async_trait::async_trait;
use tracing::info;

use crate::error::NotifyError;
use crate::storage::ContentId;

/// Anchors a content identifier for a device on some external ledger.
#[async_trait]
pub trait LedgerNotifier: Send + Sync {
    /// Returns `Ok(false)` when the ledger declined without a transport error.
    async fn notify(&self, device_id: &str, content_id: &ContentId) -> Result<bool, NotifyError>;
}

/// Notifier that only records the anchor in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl LedgerNotifier for LogNotifier {
    async fn notify(&self, device_id: &str, content_id: &ContentId) -> Result<bool, NotifyError> {
        info!(device_id, content_id = %content_id, "batch anchored (log only)");
        Ok(true)
    }
}
