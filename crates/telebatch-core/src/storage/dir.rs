use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{BatchStore, ContentId};
use crate::config::UploadParams;
use crate::error::UploadError;

/// Content-addressed store backed by a local directory.
///
/// Each batch lands in `<root>/<content id>.json`. Writes go through a
/// temporary file and a rename so readers never observe a partial batch.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &ContentId) -> Option<PathBuf> {
        // Only ids we minted map to files; anything else could escape root.
        id.is_sha256()
            .then(|| self.root.join(format!("{}.json", id.as_str())))
    }
}

fn io_err(path: &Path, err: &std::io::Error) -> UploadError {
    UploadError::Io(format!("{}: {err}", path.display()))
}

#[async_trait]
impl BatchStore for DirStore {
    async fn upload(&self, batch: Vec<u8>, _params: &UploadParams) -> Result<ContentId, UploadError> {
        let id = ContentId::for_bytes(&batch);
        let Some(path) = self.path_for(&id) else {
            return Err(UploadError::Io(format!("unaddressable content id {id}")));
        };

        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err(&path, &e))?
        {
            debug!(content_id = %id, "batch already stored");
            return Ok(id);
        }

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &batch)
            .await
            .map_err(|e| io_err(&tmp_path, &e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| io_err(&path, &e))?;

        debug!(content_id = %id, bytes = batch.len(), path = %path.display(), "batch stored");
        Ok(id)
    }

    async fn download(&self, id: &ContentId) -> Result<Vec<u8>, UploadError> {
        let Some(path) = self.path_for(id) else {
            return Err(UploadError::NotFound(id.to_string()));
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(UploadError::NotFound(id.to_string()))
            }
            Err(e) => Err(io_err(&path, &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_writes_addressed_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path().join("batches")).unwrap();

        let id = store
            .upload(b"[{\"a\":1}]".to_vec(), &UploadParams::default())
            .await
            .unwrap();

        let path = store.root().join(format!("{id}.json"));
        assert!(path.is_file());
        assert_eq!(store.download(&id).await.unwrap(), b"[{\"a\":1}]");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn repeated_upload_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let params = UploadParams::default();
        let first = store.upload(b"[]".to_vec(), &params).await.unwrap();
        let second = store.upload(b"[]".to_vec(), &params).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn unreadable_root_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("batches");
        let store = DirStore::open(&root).unwrap();
        std::fs::remove_dir(&root).unwrap();
        std::fs::write(&root, b"not a directory").unwrap();

        let err = store
            .upload(b"[]".to_vec(), &UploadParams::default())
            .await
            .unwrap_err();
        let message = match err {
            UploadError::Io(message) => message,
            other => panic!("expected an i/o error, got {other:?}"),
        };
        assert!(message.contains(".json"), "{message}");
        assert!(!message.contains(".tmp"), "existence check should fail first: {message}");
    }

    #[tokio::test]
    async fn download_refuses_foreign_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirStore::open(dir.path()).unwrap();
        let err = store
            .download(&ContentId::new("../../etc/passwd"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound(_)));

        let missing = ContentId::for_bytes(b"never stored");
        assert!(matches!(
            store.download(&missing).await,
            Err(UploadError::NotFound(_))
        ));
    }
}
