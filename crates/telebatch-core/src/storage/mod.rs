//! Storage collaborator: content-addressed batch upload and download.
//!
//! The engine treats [`BatchStore::upload`] as one opaque call with no
//! internal retry; retry policy lives in the upload queue. Timeouts are a
//! wrapping concern, see [`TimeoutStore`].

mod dir;
mod memory;
mod timeout;

pub use dir::DirStore;
pub use memory::MemoryStore;
pub use timeout::TimeoutStore;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::UploadParams;
use crate::error::UploadError;

const SHA256_PREFIX: &str = "sha256-";

/// Opaque handle returned by a store for later retrieval of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Content id of `bytes` as computed by the bundled stores.
    #[must_use]
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{SHA256_PREFIX}{}", hex::encode(digest)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for ids shaped like [`ContentId::for_bytes`] output.
    #[must_use]
    pub fn is_sha256(&self) -> bool {
        self.0.strip_prefix(SHA256_PREFIX).is_some_and(|digest| {
            digest.len() == 64
                && digest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        })
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentId {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(UploadError::NotFound("<empty content id>".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Content-addressed batch storage.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Store one serialized batch. A single attempt; never retries internally.
    async fn upload(&self, batch: Vec<u8>, params: &UploadParams) -> Result<ContentId, UploadError>;

    /// Fetch the bytes previously stored under `id`.
    async fn download(&self, id: &ContentId) -> Result<Vec<u8>, UploadError>;
}
