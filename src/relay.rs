//! Run-scoped data hand-off between tasks.
//!
//! Entries are keyed by `(run key, producing task, data key)` and written at
//! most once. The scheduler commits a task's writes only after the task
//! succeeded, so anything a reader finds here came from a successful producer.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::DagError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelayKey {
    pub run_key: String,
    pub task: String,
    pub key: String,
}

impl RelayKey {
    pub fn new(run_key: impl Into<String>, task: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            run_key: run_key.into(),
            task: task.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RelayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run_key, self.task, self.key)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("{0} already has a value")]
    DuplicateWrite(RelayKey),
    #[error("{0} has no value")]
    NotFound(RelayKey),
    #[error("task '{reader}' does not depend on '{producer}'")]
    NotUpstream { reader: String, producer: String },
}

/// The values one attempt of a task wants to publish, in write order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayWrites {
    entries: Vec<(String, serde_json::Value)>,
}

impl RelayWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.push((key.into(), value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// First key that appears more than once, if any.
    pub fn duplicate_key(&self) -> Option<&str> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(|(k, _)| k.as_str())
            .find(|k| !seen.insert(*k))
    }
}

#[derive(Debug, Default)]
pub struct RelayStore {
    entries: RwLock<HashMap<RelayKey, serde_json::Value>>,
}

impl RelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(
        &self,
        run_key: &str,
        task: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), RelayError> {
        let relay_key = RelayKey::new(run_key, task, key);
        let mut entries = self.entries.write().await;
        if entries.contains_key(&relay_key) {
            return Err(RelayError::DuplicateWrite(relay_key));
        }
        entries.insert(relay_key, value);
        Ok(())
    }

    /// Commits all writes or none of them.
    pub async fn put_all(
        &self,
        run_key: &str,
        task: &str,
        writes: &RelayWrites,
    ) -> Result<(), RelayError> {
        if let Some(key) = writes.duplicate_key() {
            return Err(RelayError::DuplicateWrite(RelayKey::new(run_key, task, key)));
        }

        let mut entries = self.entries.write().await;
        for (key, _) in writes.iter() {
            let relay_key = RelayKey::new(run_key, task, key);
            if entries.contains_key(&relay_key) {
                return Err(RelayError::DuplicateWrite(relay_key));
            }
        }
        for (key, value) in writes.iter() {
            entries.insert(RelayKey::new(run_key, task, key), value.clone());
        }
        Ok(())
    }

    pub async fn get(
        &self,
        run_key: &str,
        key: &str,
        producer: &str,
    ) -> Result<serde_json::Value, RelayError> {
        let relay_key = RelayKey::new(run_key, producer, key);
        self.entries
            .read()
            .await
            .get(&relay_key)
            .cloned()
            .ok_or(RelayError::NotFound(relay_key))
    }

    /// Drops every entry of a run. Returns how many were removed.
    pub async fn purge_run(&self, run_key: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| k.run_key != run_key);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Read access for one task: only its upstream producers, only its run.
#[derive(Debug, Clone)]
pub struct RelayReader {
    store: Arc<RelayStore>,
    run_key: String,
    reader: String,
    upstream: Arc<HashSet<String>>,
}

impl RelayReader {
    pub fn new(
        store: Arc<RelayStore>,
        run_key: impl Into<String>,
        reader: impl Into<String>,
        upstream: Arc<HashSet<String>>,
    ) -> Self {
        Self {
            store,
            run_key: run_key.into(),
            reader: reader.into(),
            upstream,
        }
    }

    pub async fn get(&self, producer: &str, key: &str) -> Result<serde_json::Value, RelayError> {
        if !self.upstream.contains(producer) {
            return Err(RelayError::NotUpstream {
                reader: self.reader.clone(),
                producer: producer.to_string(),
            });
        }
        self.store.get(&self.run_key, key, producer).await
    }

    pub fn upstream(&self) -> &HashSet<String> {
        &self.upstream
    }
}

/// External storage for payloads too large to live in the relay. The relay
/// only carries the returned identifier.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn write(&self, uri: &str, bytes: Vec<u8>) -> Result<String, DagError>;
    async fn read(&self, uri: &str) -> Result<Vec<u8>, DagError>;
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn write(&self, uri: &str, bytes: Vec<u8>) -> Result<String, DagError> {
        self.blobs.write().await.insert(uri.to_string(), bytes);
        Ok(uri.to_string())
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>, DagError> {
        self.blobs
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| DagError::Blob(format!("no blob at {}", uri)))
    }
}
