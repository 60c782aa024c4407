//! Coordination store access.
//!
//! Coin assignments live in a hierarchical key/value store with one-shot
//! change watches (ZooKeeper in production). [`WatchStore`] is the seam to
//! that store; [`WatchManager`] sits on top of it and makes sure that however
//! many sessions follow the same subaccount key, only one upstream watch is
//! open for it at a time.
//!
//! ```text
//!  session A ──┐                       ┌──────────────┐
//!  session B ──┼── WatchManager ── 1 ──│  WatchStore  │
//!  session C ──┘   (fan-out)   watch   └──────────────┘
//! ```

mod memory;
mod zookeeper;

pub use memory::MemoryStore;
pub use zookeeper::ZooKeeperStore;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::SessionId;

/// What happened to a watched node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WatchEvent {
    Changed,
    Deleted,
    /// The store session was lost; the node may or may not have changed.
    Disconnected,
}

/// Resolves once, when the watched node next changes.
pub type WatchFuture = BoxFuture<'static, WatchEvent>;

/// A hierarchical key/value store with one-shot data watches.
///
/// Paths are absolute and `/`-separated. Creating a node requires its parent
/// to exist.
#[async_trait]
pub trait WatchStore: Send + Sync + 'static {
    /// Read a node. Fails with [`Error::NoNode`] if it does not exist.
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// Read a node and arm a one-shot watch on it.
    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture)>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names (not paths) of the node's children.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Create a persistent node. Fails with [`Error::NodeExists`] if it
    /// already exists.
    async fn create(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create a node that disappears when this process's store session ends.
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Overwrite an existing node.
    async fn set(&self, path: &str, data: &[u8]) -> Result<()>;

    /// End the store session, dropping this process's ephemeral nodes.
    ///
    /// Later calls open a new session.
    async fn close(&self) -> Result<()>;
}

/// Config value of `ZKBroker` that selects the in-process store.
pub const MEMORY_BROKER: &str = "memory";

/// Connect to the store named by the config.
pub async fn connect(config: &Config) -> Result<Arc<dyn WatchStore>> {
    if config.uses_memory_store() {
        warn!("Using in-memory watch store; coin assignments are not shared.");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = ZooKeeperStore::connect(&config.zk_brokers).await?;
    Ok(Arc::new(store))
}

/// Join a directory (ending in `/`) and a child name.
pub fn child_path(dir: &str, name: &str) -> String {
    format!("{}{}", dir, name)
}

/// Deduplicating front-end for per-path watches.
///
/// Each path with at least one subscriber has exactly one upstream watch.
/// When it fires, every subscriber receives the event once and the entry is
/// dropped; the next `get_and_watch` for that path opens a fresh upstream
/// watch.
pub struct WatchManager {
    store: Arc<dyn WatchStore>,
    watchers: Arc<Mutex<HashMap<String, NodeWatcher>>>,
    // Per-path gates serializing the opening of an upstream watch, so that
    // concurrent first subscribers of one path do not open two.
    opening: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
}

struct NodeWatcher {
    generation: u64,
    value: Vec<u8>,
    subscribers: HashMap<SessionId, oneshot::Sender<WatchEvent>>,
}

impl WatchManager {
    pub fn new(store: Arc<dyn WatchStore>) -> Self {
        Self {
            store,
            watchers: Arc::new(Mutex::new(HashMap::new())),
            opening: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    /// The underlying store, for reads and writes that need no watch.
    pub fn store(&self) -> &Arc<dyn WatchStore> {
        &self.store
    }

    /// Read `path` and subscribe `subscriber` to its next change.
    ///
    /// A subscriber has at most one channel per path; subscribing again
    /// replaces (and closes) the previous one.
    pub async fn get_and_watch(
        &self,
        path: &str,
        subscriber: SessionId,
    ) -> Result<(Vec<u8>, oneshot::Receiver<WatchEvent>)> {
        if let Some(subscribed) = self.subscribe_existing(path, subscriber) {
            return Ok(subscribed);
        }

        let gate = self
            .opening
            .lock()
            .entry(path.to_string())
            .or_default()
            .clone();
        let opened = {
            let _opening = gate.lock().await;
            match self.subscribe_existing(path, subscriber) {
                Some(subscribed) => Ok(subscribed),
                None => self.open(path, subscriber).await,
            }
        };

        // Last one through drops the gate.
        let mut gates = self.opening.lock();
        if Arc::strong_count(&gate) == 2 {
            gates.remove(path);
        }
        opened
    }

    // Open an upstream watch on `path` with `subscriber` as its first
    // subscriber. Runs under the path's gate.
    async fn open(
        &self,
        path: &str,
        subscriber: SessionId,
    ) -> Result<(Vec<u8>, oneshot::Receiver<WatchEvent>)> {
        let (value, changed) = self.store.get_and_watch(path).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.watchers.lock().insert(
            path.to_string(),
            NodeWatcher {
                generation,
                value: value.clone(),
                subscribers: HashMap::from([(subscriber, tx)]),
            },
        );
        trace!(path, "Opened node watcher.");

        let watchers = self.watchers.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let event = changed.await;
            let mut watchers = watchers.lock();
            if watchers.get(&path).map(|w| w.generation) != Some(generation) {
                return;
            }
            if let Some(watcher) = watchers.remove(&path) {
                debug!(
                    path = %path,
                    %event,
                    subscribers = watcher.subscribers.len(),
                    "Node watcher fired."
                );
                for (_, tx) in watcher.subscribers {
                    let _ = tx.send(event);
                }
            }
        });

        Ok((value, rx))
    }

    fn subscribe_existing(
        &self,
        path: &str,
        subscriber: SessionId,
    ) -> Option<(Vec<u8>, oneshot::Receiver<WatchEvent>)> {
        let mut watchers = self.watchers.lock();
        let watcher = watchers.get_mut(path)?;
        let (tx, rx) = oneshot::channel();
        watcher.subscribers.insert(subscriber, tx);
        Some((watcher.value.clone(), rx))
    }

    /// Drop a subscriber's channel. The upstream watch stays armed until it
    /// fires.
    pub fn release(&self, path: &str, subscriber: SessionId) {
        let mut watchers = self.watchers.lock();
        if let Some(watcher) = watchers.get_mut(path) {
            if watcher.subscribers.remove(&subscriber).is_some() {
                trace!(path, session = %subscriber, "Released watch.");
            }
        }
    }

    /// Number of paths with an open upstream watch.
    pub fn watched_paths(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Create every missing node along `path`.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);

            if self.store.exists(&current).await? {
                continue;
            }
            match self.store.create(&current, &[]).await {
                Ok(()) => debug!(path = %current, "Created node."),
                Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn manager() -> (MemoryStore, WatchManager) {
        let store = MemoryStore::new();
        let manager = WatchManager::new(Arc::new(store.clone()));
        (store, manager)
    }

    /// A store whose reads of one path never complete.
    struct StallingStore {
        inner: MemoryStore,
        stalled: &'static str,
    }

    #[async_trait]
    impl WatchStore for StallingStore {
        async fn get(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.get(path).await
        }

        async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture)> {
            if path == self.stalled {
                std::future::pending::<()>().await;
            }
            self.inner.get_and_watch(path).await
        }

        async fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path).await
        }

        async fn children(&self, path: &str) -> Result<Vec<String>> {
            self.inner.children(path).await
        }

        async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
            self.inner.create(path, data).await
        }

        async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
            self.inner.create_ephemeral(path, data).await
        }

        async fn set(&self, path: &str, data: &[u8]) -> Result<()> {
            self.inner.set(path, data).await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_ensure_path_creates_each_level() {
        let (store, manager) = manager();
        manager.ensure_path("/stratumSwitcher/btc/").await.unwrap();
        assert!(store.exists("/stratumSwitcher").await.unwrap());
        assert!(store.exists("/stratumSwitcher/btc").await.unwrap());

        // Existing levels are left alone.
        manager.ensure_path("/stratumSwitcher/btc/users").await.unwrap();
        assert!(store.exists("/stratumSwitcher/btc/users").await.unwrap());
    }

    #[tokio::test]
    async fn test_subscribers_share_one_upstream_watch() {
        let (store, manager) = manager();
        store.insert("/coins/alice", b"btc");

        let (v1, rx1) = manager
            .get_and_watch("/coins/alice", SessionId::from_raw(1))
            .await
            .unwrap();
        let (v2, rx2) = manager
            .get_and_watch("/coins/alice", SessionId::from_raw(2))
            .await
            .unwrap();
        assert_eq!(v1, b"btc");
        assert_eq!(v2, b"btc");
        assert_eq!(store.armed_watches("/coins/alice"), 1);

        store.set("/coins/alice", b"bch").await.unwrap();

        let e1 = timeout(Duration::from_secs(1), rx1).await.unwrap().unwrap();
        let e2 = timeout(Duration::from_secs(1), rx2).await.unwrap().unwrap();
        assert_eq!(e1, WatchEvent::Changed);
        assert_eq!(e2, WatchEvent::Changed);

        // A fired watcher is gone; the next subscriber sees the new value.
        tokio::task::yield_now().await;
        assert_eq!(manager.watched_paths(), 0);
        let (v3, _rx3) = manager
            .get_and_watch("/coins/alice", SessionId::from_raw(3))
            .await
            .unwrap();
        assert_eq!(v3, b"bch");
    }

    #[tokio::test]
    async fn test_release_closes_only_that_subscriber() {
        let (store, manager) = manager();
        store.insert("/coins/bob", b"btc");

        let (_, rx1) = manager
            .get_and_watch("/coins/bob", SessionId::from_raw(1))
            .await
            .unwrap();
        let (_, rx2) = manager
            .get_and_watch("/coins/bob", SessionId::from_raw(2))
            .await
            .unwrap();

        manager.release("/coins/bob", SessionId::from_raw(1));
        assert!(rx1.await.is_err());

        store.set("/coins/bob", b"ltc").await.unwrap();
        let event = timeout(Duration::from_secs(1), rx2).await.unwrap().unwrap();
        assert_eq!(event, WatchEvent::Changed);
    }

    #[tokio::test]
    async fn test_missing_node_is_no_node() {
        let (_store, manager) = manager();
        let result = manager
            .get_and_watch("/coins/nobody", SessionId::from_raw(1))
            .await;
        assert!(matches!(result, Err(Error::NoNode(_))));
        assert_eq!(manager.watched_paths(), 0);
    }

    #[tokio::test]
    async fn test_delete_fans_out_deleted() {
        let (store, manager) = manager();
        store.insert("/coins/carol", b"btc");
        let (_, rx) = manager
            .get_and_watch("/coins/carol", SessionId::from_raw(9))
            .await
            .unwrap();
        store.delete("/coins/carol");
        let event = timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(event, WatchEvent::Deleted);
    }

    #[tokio::test]
    async fn test_stalled_open_does_not_block_other_paths() {
        let inner = MemoryStore::new();
        inner.insert("/coins/slow", b"btc");
        inner.insert("/coins/fast", b"bch");
        let manager = Arc::new(WatchManager::new(Arc::new(StallingStore {
            inner: inner.clone(),
            stalled: "/coins/slow",
        })));

        let stalled = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let _ = manager
                    .get_and_watch("/coins/slow", SessionId::from_raw(1))
                    .await;
            })
        };
        tokio::task::yield_now().await;

        let (value, _rx) = timeout(
            Duration::from_secs(1),
            manager.get_and_watch("/coins/fast", SessionId::from_raw(2)),
        )
        .await
        .expect("open of another path was blocked")
        .unwrap();
        assert_eq!(value, b"bch");
        assert!(!stalled.is_finished());
        stalled.abort();
    }

    #[tokio::test]
    async fn test_concurrent_first_subscribers_open_one_watch() {
        let (store, manager) = manager();
        store.insert("/coins/dave", b"btc");

        let (a, b) = tokio::join!(
            manager.get_and_watch("/coins/dave", SessionId::from_raw(1)),
            manager.get_and_watch("/coins/dave", SessionId::from_raw(2)),
        );
        assert_eq!(a.unwrap().0, b"btc");
        assert_eq!(b.unwrap().0, b"btc");
        assert_eq!(store.armed_watches("/coins/dave"), 1);
        assert!(manager.opening.lock().is_empty());
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/a/b/", "alice"), "/a/b/alice");
    }
}
