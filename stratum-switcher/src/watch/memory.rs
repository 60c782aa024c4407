//! In-process watch store.
//!
//! Used when `ZKBroker` is `["memory"]` (single-host deployments and local
//! testing) and by the test suite. Semantics follow ZooKeeper where the
//! switcher depends on them: parents must exist, watches fire once, and a
//! deleted node fires its data watches.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

use super::{WatchEvent, WatchFuture, WatchStore};
use crate::error::{Error, Result};

/// Cloneable handle to a shared in-memory tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tree>>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Vec<u8>>,
    watches: HashMap<String, Vec<oneshot::Sender<WatchEvent>>>,
    ephemerals: HashSet<String>,
}

impl Tree {
    fn fire(&mut self, path: &str, event: WatchEvent) {
        for tx in self.watches.remove(path).unwrap_or_default() {
            let _ = tx.send(event);
        }
    }

    fn remove(&mut self, path: &str) {
        self.ephemerals.remove(path);
        if self.nodes.remove(path).is_some() {
            self.fire(path, WatchEvent::Deleted);
        }
    }

    fn check_parent(&self, path: &str) -> Result<()> {
        match parent(path) {
            Some(parent) if !self.nodes.contains_key(parent) => {
                Err(Error::NoNode(parent.to_string()))
            }
            _ => Ok(()),
        }
    }
}

// Parent path, or None for top-level nodes (whose parent is the root).
fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(i) => Some(&trimmed[..i]),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a node's value, creating it and any missing parents, and fire
    /// watches as a write would.
    pub fn insert(&self, path: &str, data: &[u8]) {
        let mut tree = self.inner.lock();
        let mut current = String::new();
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for (i, part) in parts.iter().enumerate() {
            current.push('/');
            current.push_str(part);
            if i + 1 < parts.len() {
                tree.nodes.entry(current.clone()).or_default();
            }
        }
        tree.nodes.insert(current.clone(), data.to_vec());
        tree.fire(&current, WatchEvent::Changed);
    }

    /// Remove a node, firing its watches with [`WatchEvent::Deleted`].
    pub fn delete(&self, path: &str) {
        self.inner.lock().remove(path);
    }

    /// Number of armed watches on `path` whose receiver is still alive.
    pub fn armed_watches(&self, path: &str) -> usize {
        let mut tree = self.inner.lock();
        match tree.watches.get_mut(path) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }
}

#[async_trait]
impl WatchStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture)> {
        let mut tree = self.inner.lock();
        let value = tree
            .nodes
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NoNode(path.to_string()))?;

        let (tx, rx) = oneshot::channel();
        tree.watches.entry(path.to_string()).or_default().push(tx);

        let changed = async move { rx.await.unwrap_or(WatchEvent::Disconnected) };
        Ok((value, changed.boxed()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(path == "/" || self.inner.lock().nodes.contains_key(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let tree = self.inner.lock();
        let dir = path.trim_end_matches('/');
        if !dir.is_empty() && !tree.nodes.contains_key(dir) {
            return Err(Error::NoNode(path.to_string()));
        }

        let prefix = format!("{}/", dir);
        Ok(tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| &k[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut tree = self.inner.lock();
        if tree.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        tree.check_parent(path)?;
        tree.nodes.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
        self.create(path, data).await?;
        self.inner.lock().ephemerals.insert(path.to_string());
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut tree = self.inner.lock();
        match tree.nodes.get_mut(path) {
            Some(value) => *value = data.to_vec(),
            None => return Err(Error::NoNode(path.to_string())),
        }
        tree.fire(path, WatchEvent::Changed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut tree = self.inner.lock();
        let ephemerals: Vec<String> = tree.ephemerals.drain().collect();
        for path in ephemerals {
            tree.remove(&path);
        }
        Ok(())
    }
}
