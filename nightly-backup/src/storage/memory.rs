//! In-memory object store for tests.

use super::{Bucket, ByteStream, LifecycleRule, ObjectStore, StoreConnector};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct State {
    buckets: BTreeSet<String>,
    objects: BTreeMap<String, Vec<u8>>,
    put_calls: usize,
    lifecycle: Vec<LifecycleRule>,
    fail_connect: bool,
    put_delay: Option<Duration>,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub(crate) fn with_bucket(name: &str) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().buckets.insert(name.to_string());
        store
    }

    pub(crate) fn failing_connect() -> Self {
        let store = Self::default();
        store.state.lock().unwrap().fail_connect = true;
        store
    }

    /// Hold every upload open for `delay` before reading the body
    pub(crate) fn slow(self, delay: Duration) -> Self {
        self.state.lock().unwrap().put_delay = Some(delay);
        self
    }

    pub(crate) fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }

    pub(crate) fn put_calls(&self) -> usize {
        self.state.lock().unwrap().put_calls
    }

    pub(crate) fn lifecycle_rules(&self) -> Vec<LifecycleRule> {
        self.state.lock().unwrap().lifecycle.clone()
    }
}

impl StoreConnector for MemoryStore {
    fn connect(&self) -> Result<Arc<dyn ObjectStore>> {
        if self.state.lock().unwrap().fail_connect {
            return Err(BackupError::ClientInit("connection refused".to_string()));
        }
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn open_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>> {
        if !self.state.lock().unwrap().buckets.contains(name) {
            return Err(BackupError::bucket(name, "NoSuchBucket"));
        }
        Ok(Arc::new(MemoryBucket {
            name: name.to_string(),
            store: self.clone(),
        }))
    }
}

struct MemoryBucket {
    name: String,
    store: MemoryStore,
}

#[async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_object(&self, key: &str, mut body: ByteStream) -> Result<()> {
        let delay = {
            let mut state = self.store.state.lock().unwrap();
            state.put_calls += 1;
            state.put_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| BackupError::upload(key, e))?;
            data.extend_from_slice(&chunk);
        }

        self.store
            .state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn put_lifecycle(&self, rule: &LifecycleRule) -> Result<()> {
        self.store.state.lock().unwrap().lifecycle.push(rule.clone());
        Ok(())
    }
}
