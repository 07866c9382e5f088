use std::time::Duration;

use async_trait::async_trait;

use super::{BatchStore, ContentId};
use crate::config::UploadParams;
use crate::error::UploadError;

/// Bounds every call to the wrapped store.
///
/// The engine itself never times out an upload: a hung call would block
/// the whole queue, so deployments that need a bound wrap their store.
#[derive(Debug)]
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: BatchStore> TimeoutStore<S> {
    #[must_use]
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn elapsed(&self) -> UploadError {
        UploadError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
    }
}

#[async_trait]
impl<S: BatchStore> BatchStore for TimeoutStore<S> {
    async fn upload(&self, batch: Vec<u8>, params: &UploadParams) -> Result<ContentId, UploadError> {
        tokio::time::timeout(self.timeout, self.inner.upload(batch, params))
            .await
            .map_err(|_| self.elapsed())?
    }

    async fn download(&self, id: &ContentId) -> Result<Vec<u8>, UploadError> {
        tokio::time::timeout(self.timeout, self.inner.download(id))
            .await
            .map_err(|_| self.elapsed())?
    }
}
