use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BatchStore, ContentId};
use crate::config::UploadParams;
use crate::error::UploadError;

/// In-process content-addressed store.
///
/// Useful for tests and for running the engine without a backend. An
/// optional size limit mimics backends that reject oversized pieces.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<ContentId, Vec<u8>>>,
    max_batch_bytes: Option<usize>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject batches larger than `limit` bytes with [`UploadError::SizeLimit`].
    #[must_use]
    pub fn with_size_limit(limit: usize) -> Self {
        Self {
            blobs: Mutex::default(),
            max_batch_bytes: Some(limit),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn upload(&self, batch: Vec<u8>, _params: &UploadParams) -> Result<ContentId, UploadError> {
        if let Some(limit) = self.max_batch_bytes {
            if batch.len() > limit {
                return Err(UploadError::SizeLimit {
                    size: batch.len(),
                    limit,
                });
            }
        }
        let id = ContentId::for_bytes(&batch);
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), batch);
        Ok(id)
    }

    async fn download(&self, id: &ContentId) -> Result<Vec<u8>, UploadError> {
        self.blobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }
}
