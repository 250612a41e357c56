//! Object storage the archives are uploaded to.
//!
//! The rest of the daemon only sees the three traits below: connect a
//! client, open a bucket, put an object from a byte stream.

pub mod local;
#[cfg(test)]
pub(crate) mod memory;
pub mod s3;

use crate::config::{StorageConfig, StorageKind};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

pub use local::LocalStore;
pub use s3::S3Store;

/// Object body, produced while it is being uploaded
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// Expire objects under `prefix` after `expiration_days`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRule {
    pub id: String,
    pub prefix: String,
    pub expiration_days: u32,
}

impl LifecycleRule {
    /// Rule covering the directory part of the object key prefix
    pub fn for_key_prefix(key_prefix: &str, expiration_days: u32) -> Self {
        let prefix = match key_prefix.rfind('/') {
            Some(idx) => key_prefix[..=idx].to_string(),
            None => String::new(),
        };
        Self {
            id: "nightly-backup-expiration".to_string(),
            prefix,
            expiration_days,
        }
    }
}

#[async_trait]
pub trait Bucket: Send + Sync {
    fn name(&self) -> &str;

    /// Store `body` under `key`, reading it to the end
    async fn put_object(&self, key: &str, body: ByteStream) -> Result<()>;

    async fn put_lifecycle(&self, rule: &LifecycleRule) -> Result<()>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn open_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>>;
}

/// Builds a storage client; called once per backup run
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn ObjectStore>>;
}

impl StoreConnector for StorageConfig {
    fn connect(&self) -> Result<Arc<dyn ObjectStore>> {
        match self.kind {
            StorageKind::S3 => Ok(Arc::new(
                S3Store::new(
                    &self.endpoint,
                    &self.region,
                    &self.access_key,
                    &self.access_secret,
                    self.url_style,
                )?
                .with_part_size(self.part_size),
            )),
            StorageKind::Local => {
                let root = self.root.as_ref().ok_or_else(|| {
                    BackupError::ClientInit("storage.root is not set".to_string())
                })?;
                Ok(Arc::new(LocalStore::new(root)?))
            }
        }
    }
}
