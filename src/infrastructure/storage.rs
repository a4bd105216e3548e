//! Filesystem object storage serving objects under a public URL prefix.

use crate::config::ChatConfig;
use crate::core::error::StorageError;
use crate::infrastructure::traits::ObjectStorage;
use async_trait::async_trait;
use di::{Ref, inject, injectable};
use log::{error, info};
use std::path::{Component, Path, PathBuf};

pub struct LocalObjectStorage {
    root: PathBuf,
    public_url: String,
}

#[injectable(ObjectStorage)]
impl LocalObjectStorage {
    #[inject]
    pub fn create(config: Ref<ChatConfig>) -> LocalObjectStorage {
        LocalObjectStorage::new(config.storage_dir.clone(), config.storage_public_url.clone())
    }
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        LocalObjectStorage {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_owned(),
        }
    }

    fn object_path(&self, bucket: &str, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(bucket).join(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if bucket.is_empty() || path.is_empty() || bucket.contains('/') || escapes {
            return Err(StorageError::InvalidPath(format!("{bucket}/{path}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
    ) -> Result<String, StorageError> {
        let target = self.object_path(bucket, path)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                error!("creating {} failed: {e}", parent.display());
                StorageError::Upload(e.to_string())
            })?;
        }

        tokio::fs::write(&target, &bytes).await.map_err(|e| {
            error!("writing {} failed: {e}", target.display());
            StorageError::Upload(e.to_string())
        })?;

        info!("stored {} bytes at {bucket}/{path}", bytes.len());
        Ok(format!("{}/{bucket}/{path}", self.public_url))
    }
}
