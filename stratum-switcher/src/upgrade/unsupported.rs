//! Platforms without descriptor inheritance cannot hand sessions over.

use tokio::net::TcpListener;

use super::HandoffFailed;
use crate::error::{Error, Result};
use crate::session::DetachedSession;
use crate::watch::WatchStore;

pub struct UpgradeSignal;

impl UpgradeSignal {
    pub fn new() -> Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

pub async fn handoff(
    _listener: &TcpListener,
    _sessions: &mut [DetachedSession],
    _server_id: u8,
    _store: &dyn WatchStore,
) -> HandoffFailed {
    HandoffFailed::Prepare(Error::Unsupported("live upgrade"))
}

pub fn adopt_listener(_fd: i32) -> Result<std::net::TcpListener> {
    Err(Error::Unsupported("live upgrade"))
}

pub fn adopt_stream(_fd: i32) -> Result<std::net::TcpStream> {
    Err(Error::Unsupported("live upgrade"))
}

pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_default()
}
