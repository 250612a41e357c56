//! Object storage backed by a local directory.
//!
//! Each bucket is a subdirectory of the root and must already exist. An
//! object is written to `<key>.part` and renamed into place once the whole
//! body has arrived, so a reader never sees half an archive under the real
//! key.

use super::{Bucket, ByteStream, LifecycleRule, ObjectStore};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::warn;

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(BackupError::ClientInit(format!(
                "storage root {} is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn open_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>> {
        if !is_plain_relative(Path::new(name)) || name.contains('/') {
            return Err(BackupError::bucket(name, "invalid bucket name"));
        }

        let dir = self.root.join(name);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(Arc::new(LocalBucket {
                name: name.to_string(),
                dir,
            })),
            Ok(_) => Err(BackupError::bucket(name, "not a directory")),
            Err(e) => Err(BackupError::bucket(name, e)),
        }
    }
}

/// Only normal components: no root, no `..`, not empty
fn is_plain_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

pub struct LocalBucket {
    name: String,
    dir: PathBuf,
}

impl LocalBucket {
    async fn write_part(&self, part: &Path, body: ByteStream) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(part).await?;
        let mut reader = StreamReader::new(body);
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_object(&self, key: &str, body: ByteStream) -> Result<()> {
        if !is_plain_relative(Path::new(key)) {
            return Err(BackupError::upload(key, "key must be a relative path"));
        }

        let dest = self.dir.join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackupError::upload(key, e))?;
        }

        let mut part = dest.clone().into_os_string();
        part.push(".part");
        let part = PathBuf::from(part);

        if let Err(e) = self.write_part(&part, body).await {
            if let Err(rm) = tokio::fs::remove_file(&part).await {
                let close_err = BackupError::ResourceClose {
                    resource: part.display().to_string(),
                    source: rm,
                };
                warn!(kind = close_err.kind(), "{}", close_err);
            }
            return Err(BackupError::upload(key, e));
        }

        tokio::fs::rename(&part, &dest)
            .await
            .map_err(|e| BackupError::upload(key, e))
    }

    async fn put_lifecycle(&self, rule: &LifecycleRule) -> Result<()> {
        warn!(
            bucket = %self.name,
            days = rule.expiration_days,
            "Local storage does not support lifecycle rules; ignoring"
        );
        Ok(())
    }
}
