//! ZooKeeper-backed watch store.

use async_trait::async_trait;
use futures::FutureExt;
use std::time::Duration;
use tokio::sync::Mutex;
use zookeeper_client as zk;

use super::{WatchEvent, WatchFuture, WatchStore};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Give up on a connection attempt after this long.
const CONNECTING_TIMEOUT: Duration = Duration::from_secs(60);

/// Wait this long for the server to confirm a session close.
const CLOSING_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ZooKeeperStore {
    cluster: String,
    // None once closed; the next operation reconnects.
    client: Mutex<Option<zk::Client>>,
}

impl ZooKeeperStore {
    /// Connect to a cluster given as `host:port` brokers.
    pub async fn connect(brokers: &[String]) -> Result<Self> {
        let cluster = brokers.join(",");
        let client = open_session(&cluster).await?;
        Ok(Self {
            cluster,
            client: Mutex::new(Some(client)),
        })
    }

    async fn client(&self) -> Result<zk::Client> {
        let mut client = self.client.lock().await;
        if let Some(live) = client.as_ref().filter(|c| !c.state().is_terminated()) {
            return Ok(live.clone());
        }

        let fresh = open_session(&self.cluster).await?;
        *client = Some(fresh.clone());
        Ok(fresh)
    }
}

async fn open_session(cluster: &str) -> Result<zk::Client> {
    info!(%cluster, "Connecting to ZooKeeper...");
    let client = tokio::time::timeout(CONNECTING_TIMEOUT, zk::Client::connect(cluster))
        .await
        .map_err(|_| Error::Store(format!("connecting to {} timed out", cluster)))?
        .map_err(|e| Error::Store(format!("connecting to {}: {}", cluster, e)))?;

    info!(%cluster, "Connected to ZooKeeper.");
    Ok(client)
}

// ZooKeeper rejects trailing slashes except on the root.
fn node_path(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn store_error(path: &str, err: zk::Error) -> Error {
    match err {
        zk::Error::NoNode => Error::NoNode(path.to_string()),
        zk::Error::NodeExists => Error::NodeExists(path.to_string()),
        other => Error::Store(format!("{}: {}", path, other)),
    }
}

fn watch_event(event: &zk::WatchedEvent) -> WatchEvent {
    match event.event_type {
        zk::EventType::NodeDeleted => WatchEvent::Deleted,
        zk::EventType::Session => WatchEvent::Disconnected,
        _ => WatchEvent::Changed,
    }
}

#[async_trait]
impl WatchStore for ZooKeeperStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let path = node_path(path);
        let (data, _stat) = self
            .client()
            .await?
            .get_data(path)
            .await
            .map_err(|e| store_error(path, e))?;
        Ok(data)
    }

    async fn get_and_watch(&self, path: &str) -> Result<(Vec<u8>, WatchFuture)> {
        let path = node_path(path);
        let (data, _stat, watcher) = self
            .client()
            .await?
            .get_and_watch_data(path)
            .await
            .map_err(|e| store_error(path, e))?;

        let changed = async move {
            let event = watcher.changed().await;
            trace!(path = %event.path, event_type = ?event.event_type, "ZooKeeper watch fired.");
            watch_event(&event)
        };
        Ok((data, changed.boxed()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = node_path(path);
        let stat = self
            .client()
            .await?
            .check_stat(path)
            .await
            .map_err(|e| store_error(path, e))?;
        Ok(stat.is_some())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let path = node_path(path);
        self.client()
            .await?
            .list_children(path)
            .await
            .map_err(|e| store_error(path, e))
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = node_path(path);
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        self.client()
            .await?
            .create(path, data, &options)
            .await
            .map_err(|e| store_error(path, e))?;
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = node_path(path);
        let options = zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all());
        self.client()
            .await?
            .create(path, data, &options)
            .await
            .map_err(|e| store_error(path, e))?;
        Ok(())
    }

    async fn set(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = node_path(path);
        self.client()
            .await?
            .set_data(path, data, None)
            .await
            .map_err(|e| store_error(path, e))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(client) = self.client.lock().await.take() else {
            return Ok(());
        };

        // The session ends once the last handle is gone.
        let mut state = client.state_watcher();
        drop(client);
        let closed = async {
            while !state.changed().await.is_terminated() {}
        };
        tokio::time::timeout(CLOSING_TIMEOUT, closed)
            .await
            .map_err(|_| Error::Store(format!("closing session on {} timed out", self.cluster)))?;

        info!(cluster = %self.cluster, "Closed ZooKeeper session.");
        Ok(())
    }
}
