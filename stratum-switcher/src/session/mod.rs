//! Per-connection session engine.
//!
//! A session walks a miner through the handshake, signs it up with the pool
//! server of the coin its subaccount is assigned to, and then copies bytes
//! both ways while watching the assignment. When the assignment changes (or
//! the server connection fails) the session reconnects to a server without
//! the miner noticing.
//!
//! ```text
//!              Running ──tryReconnect/switch──▶ Reconnecting
//!                 ▲  │                               │
//!                 │  └──tryStop──▶ Stopped ◀──fail───┤
//!                 └──────────────signed up───────────┘
//! ```
//!
//! Every transition out of `Running` bumps a reconnect counter and cancels
//! the current proxy generation. Copiers and the coin watcher remember the
//! counter they were started with; an event from a stale task finds the
//! counter moved on and is dropped.
//!
//! The four stream halves sit in separate slots, always locked in the order
//! client reader, server reader, client writer, server writer.

mod handshake;
mod proxy;
mod upstream;

pub use handshake::{
    set_param, strip_eth_address, ClientHello, Handshake, Stage, WorkerName,
};

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::manager::SwitcherContext;
use crate::stratum::{JsonRpcRequest, JsonRpcResponse, StratumError};
use crate::tracing::prelude::*;
use crate::types::{Dialect, SessionId};

/// Deadline for the first byte from a new client.
pub const PROTOCOL_DETECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline for the whole client handshake.
pub const FIND_WORKER_NAME_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for each back-end response during sign-up.
pub const READ_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra connection attempts after the first when reconnecting.
pub const RECONNECT_RETRY_TIMES: usize = 10;

pub const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Deadline for flushing bytes left over from a server connection to the
/// client.
pub const CLIENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before re-reading the coin assignment after a store error.
pub const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Longest handshake line accepted from a client or server.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
pub enum RunningState {
    Stopped,
    Running,
    Reconnecting,
}

struct SessionState {
    running: RunningState,
    reconnect_counter: u32,
    mining_coin: String,
    /// Cancelled when the current proxy generation must wind down.
    generation: CancellationToken,
}

/// Client-to-server direction state that outlives one server connection.
struct ClientInbound {
    reader: BufReader<OwnedReadHalf>,
    /// Bytes read from the client but not yet written to any server.
    unsent: BytesMut,
    line: LineTracker,
}

impl ClientInbound {
    fn new(reader: BufReader<OwnedReadHalf>) -> Self {
        Self {
            reader,
            unsent: BytesMut::new(),
            line: LineTracker::default(),
        }
    }

    /// Bytes a new server must see first: the interrupted line from its
    /// start, then anything never sent.
    fn take_for_new_server(&mut self) -> BytesMut {
        let mut pending = self.line.take();
        pending.extend_from_slice(&self.unsent);
        self.unsent.clear();
        pending
    }
}

/// Remembers the start of the line currently being written to a server.
#[derive(Default)]
struct LineTracker {
    head: BytesMut,
}

impl LineTracker {
    fn delivered(&mut self, data: &[u8]) {
        match data.iter().rposition(|b| *b == b'\n') {
            Some(pos) => {
                self.head.clear();
                self.head.extend_from_slice(&data[pos + 1..]);
            }
            None => self.head.extend_from_slice(data),
        }
        if self.head.len() > MAX_LINE_LENGTH {
            self.head.clear();
        }
    }

    fn take(&mut self) -> BytesMut {
        std::mem::take(&mut self.head)
    }
}

/// Saved form of a live session, handed to the replacement process on
/// upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(rename = "SessionID")]
    pub session_id: SessionId,

    #[serde(rename = "MiningCoin")]
    pub mining_coin: String,

    /// Absent for ETHProxy clients, which never subscribe.
    #[serde(rename = "StratumSubscribeRequest")]
    pub subscribe: Option<JsonRpcRequest>,

    #[serde(rename = "StratumAuthorizeRequest")]
    pub authorize: JsonRpcRequest,

    #[serde(rename = "ClientConnFD")]
    pub client_fd: i32,

    #[serde(rename = "ServerConnFD")]
    pub server_fd: i32,

    #[serde(rename = "VersionMask", default, skip_serializing_if = "Option::is_none")]
    pub version_mask: Option<u32>,
}

/// A session pulled out of the proxy loop with its sockets intact.
pub struct DetachedSession {
    pub snapshot: SessionSnapshot,
    pub client: std::net::TcpStream,
    pub server: std::net::TcpStream,
}

/// Observable view of a session for the debug endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub client_addr: String,
    pub worker: Option<String>,
    pub coin: String,
    pub dialect: Option<Dialect>,
    pub agent: bool,
    pub state: RunningState,
    pub reconnects: u32,
}

pub struct Session {
    id: SessionId,
    id_hex: String,
    client_addr: SocketAddr,
    ctx: Arc<SwitcherContext>,
    hello: OnceLock<ClientHello>,
    state: Mutex<SessionState>,
    /// Cancelled once, when the session stops for good.
    shutdown: CancellationToken,

    client_inbound: AsyncMutex<Option<ClientInbound>>,
    server_reader: AsyncMutex<Option<BufReader<OwnedReadHalf>>>,
    client_writer: AsyncMutex<Option<OwnedWriteHalf>>,
    server_writer: AsyncMutex<Option<OwnedWriteHalf>>,
    /// The last write to the client stopped inside a line.
    client_mid_line: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        ctx: Arc<SwitcherContext>,
        id: SessionId,
        client: TcpStream,
    ) -> Result<Arc<Self>> {
        let client_addr = client.peer_addr()?;
        let _ = client.set_nodelay(true);
        let (read, write) = client.into_split();
        let shutdown = ctx.shutdown.child_token();

        Ok(Arc::new(Self {
            id,
            id_hex: id.wire_hex(ctx.config.chain_type),
            client_addr,
            hello: OnceLock::new(),
            state: Mutex::new(SessionState {
                running: RunningState::Stopped,
                reconnect_counter: 0,
                mining_coin: String::new(),
                generation: shutdown.child_token(),
            }),
            shutdown,
            client_inbound: AsyncMutex::new(Some(ClientInbound::new(BufReader::new(read)))),
            server_reader: AsyncMutex::new(None),
            client_writer: AsyncMutex::new(Some(write)),
            server_writer: AsyncMutex::new(None),
            client_mid_line: AtomicBool::new(false),
            ctx,
        }))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Client IP as the integer pool servers expect; 0 for IPv6 clients.
    pub fn client_ip_u32(&self) -> u32 {
        match self.client_addr.ip() {
            IpAddr::V4(ip) => u32::from(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped().map(u32::from).unwrap_or(0),
        }
    }

    pub fn mining_coin(&self) -> String {
        self.state.lock().mining_coin.clone()
    }

    pub fn running_state(&self) -> RunningState {
        self.state.lock().running
    }

    pub fn reconnect_counter(&self) -> u32 {
        self.state.lock().reconnect_counter
    }

    pub fn hello(&self) -> Option<&ClientHello> {
        self.hello.get()
    }

    fn is_agent(&self) -> bool {
        self.hello.get().map(|h| h.agent).unwrap_or(false)
    }

    fn worker_label(&self) -> String {
        self.hello
            .get()
            .map(|h| h.worker.full())
            .unwrap_or_default()
    }

    pub fn info(&self) -> SessionInfo {
        let state = self.state.lock();
        let hello = self.hello.get();
        SessionInfo {
            session_id: self.id_hex.clone(),
            client_addr: self.client_addr.to_string(),
            worker: hello.map(|h| h.worker.full()),
            coin: state.mining_coin.clone(),
            dialect: hello.map(|h| h.dialect),
            agent: hello.map(|h| h.agent).unwrap_or(false),
            state: state.running,
            reconnects: state.reconnect_counter,
        }
    }

    /// Drive a freshly accepted connection until it is proxying or gone.
    pub(crate) async fn run(self: Arc<Self>) {
        self.state.lock().running = RunningState::Running;
        debug!(session = %self.id_hex, client = %self.client_addr, "Session started.");

        let signed_up = tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::NotRunning),
            result = self.sign_up() => result,
        };

        match signed_up {
            Ok(()) => self.enter_proxy(),
            Err(e) => {
                debug!(session = %self.id_hex, error = %e, "Sign-up failed.");
                self.stop();
            }
        }
    }

    async fn sign_up(&self) -> Result<()> {
        self.detect_protocol().await?;

        let hello = tokio::time::timeout(FIND_WORKER_NAME_TIMEOUT, self.find_worker_name())
            .await
            .map_err(|_| Error::Timeout("worker name"))??;
        let hello = self.canonicalize_subaccount(hello).await;
        debug!(
            session = %self.id_hex,
            worker = %hello.worker.full(),
            dialect = %hello.dialect,
            "Found worker name."
        );
        let _ = self.hello.set(hello);

        self.find_mining_coin(true).await?;
        self.connect_stratum_server(false).await
    }

    async fn detect_protocol(&self) -> Result<()> {
        let mut inbound = self.client_inbound.lock().await;
        let inbound = inbound.as_mut().ok_or(Error::NotRunning)?;

        let first = tokio::time::timeout(PROTOCOL_DETECT_TIMEOUT, inbound.reader.fill_buf())
            .await
            .map_err(|_| Error::Timeout("first client byte"))??
            .first()
            .copied();

        match first {
            Some(b'{') => Ok(()),
            Some(byte) => {
                debug!(session = %self.id_hex, byte, "Unknown protocol.");
                Err(Error::UnknownProtocol)
            }
            None => Err(Error::Closed("client")),
        }
    }

    async fn find_worker_name(&self) -> Result<ClientHello> {
        let mut handshake = Handshake::new(self.ctx.config.chain_type, self.id);
        let mut inbound = self.client_inbound.lock().await;
        let inbound = inbound.as_mut().ok_or(Error::NotRunning)?;

        while handshake.stage() != Stage::Authorized {
            let line = read_line(&mut inbound.reader, "client").await?;
            let request = match JsonRpcRequest::parse(&line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(
                        session = %self.id_hex,
                        error = %e,
                        line = %String::from_utf8_lossy(&line).trim_end(),
                        "Ignoring undecodable request."
                    );
                    continue;
                }
            };
            trace!(session = %self.id_hex, method = %request.method, "Handshake request.");

            if let Some(reply) = handshake.handle(request) {
                self.write_to_client(&reply.to_line()?).await?;
            }
        }

        handshake.finish().ok_or(Error::NotRunning)
    }

    /// Map the subaccount through the case-insensitive index, if configured.
    async fn canonicalize_subaccount(&self, mut hello: ClientHello) -> ClientHello {
        let Some(index) = &self.ctx.config.zk_user_case_insensitive_index else {
            return hello;
        };

        let path = format!("{}{}", index, hello.worker.subaccount.to_lowercase());
        match self.ctx.watch.store().get(&path).await {
            Ok(name) => {
                let name = String::from_utf8_lossy(&name).trim().to_string();
                if !name.is_empty() && name != hello.worker.subaccount {
                    debug!(
                        session = %self.id_hex,
                        from = %hello.worker.subaccount,
                        to = %name,
                        "Canonicalized subaccount name."
                    );
                    hello.worker.subaccount = name;
                }
            }
            Err(Error::NoNode(_)) => {}
            Err(e) => warn!(session = %self.id_hex, error = %e, "Subaccount index lookup failed."),
        }
        hello
    }

    /// Restore a session handed over by the previous process.
    pub(crate) async fn resume(self: Arc<Self>, snapshot: SessionSnapshot, server: TcpStream) {
        {
            let mut state = self.state.lock();
            state.running = RunningState::Running;
            state.mining_coin = snapshot.mining_coin.clone();
        }

        let _ = server.set_nodelay(true);
        let (read, write) = server.into_split();
        *self.server_reader.lock().await = Some(BufReader::new(read));
        *self.server_writer.lock().await = Some(write);

        let resumed = tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::NotRunning),
            result = self.replay(&snapshot) => result,
        };

        match resumed {
            Ok(()) => {
                info!(
                    session = %self.id_hex,
                    worker = %self.worker_label(),
                    coin = %snapshot.mining_coin,
                    "Session resumed."
                );
                self.enter_proxy();
            }
            Err(e) => {
                warn!(session = %self.id_hex, error = %e, "Resume failed.");
                self.stop();
            }
        }
    }

    async fn replay(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let mut handshake = Handshake::new(self.ctx.config.chain_type, self.id);
        handshake.restore_version_mask(snapshot.version_mask);
        if let Some(subscribe) = &snapshot.subscribe {
            handshake.handle(subscribe.clone());
        }
        handshake.handle(snapshot.authorize.clone());

        let hello = handshake
            .finish()
            .ok_or_else(|| Error::Upgrade("saved handshake does not authorize".into()))?;
        let _ = self.hello.set(hello);

        self.find_mining_coin(false).await?;
        let coin = self.mining_coin();
        if coin != snapshot.mining_coin {
            return Err(Error::Upgrade(format!(
                "coin changed from {} to {} during upgrade",
                snapshot.mining_coin, coin
            )));
        }
        Ok(())
    }

    /// Stop if still running the generation `seen` was taken from.
    pub(crate) fn try_stop(self: &Arc<Self>, seen: u32) {
        {
            let mut state = self.state.lock();
            if state.running != RunningState::Running || state.reconnect_counter != seen {
                return;
            }
            state.running = RunningState::Stopped;
            state.reconnect_counter += 1;
        }
        self.spawn_teardown();
    }

    /// Stop unconditionally, whatever the session is doing.
    pub(crate) fn stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.running == RunningState::Stopped && self.shutdown.is_cancelled() {
                return;
            }
            state.running = RunningState::Stopped;
            state.reconnect_counter += 1;
        }
        self.spawn_teardown();
    }

    fn spawn_teardown(self: &Arc<Self>) {
        self.shutdown.cancel();
        let session = self.clone();
        self.ctx.tasks.spawn(async move { session.teardown().await });
    }

    async fn teardown(&self) {
        self.ctx.registry.unregister(self.id);
        self.release_watch();

        drop(self.client_inbound.lock().await.take());
        drop(self.server_reader.lock().await.take());
        drop(self.client_writer.lock().await.take());
        drop(self.server_writer.lock().await.take());

        self.ctx.ids.free(self.id);
        info!(
            session = %self.id_hex,
            client = %self.client_addr,
            worker = %self.worker_label(),
            "Session stopped."
        );
    }

    fn watch_path(&self) -> Option<String> {
        self.hello
            .get()
            .map(|h| self.ctx.config.coin_path(&h.worker.subaccount))
    }

    fn release_watch(&self) {
        if let Some(path) = self.watch_path() {
            self.ctx.watch.release(&path, self.id);
        }
    }

    /// Take the session out of service for a live upgrade, keeping both
    /// sockets open and flushing any bytes buffered in user space.
    pub(crate) async fn detach(self: &Arc<Self>) -> Result<DetachedSession> {
        let generation = {
            let mut state = self.state.lock();
            if state.running != RunningState::Running {
                return Err(Error::NotRunning);
            }
            state.running = RunningState::Stopped;
            state.reconnect_counter += 1;
            state.generation.clone()
        };
        generation.cancel();
        self.ctx.registry.unregister(self.id);
        self.release_watch();

        let hello = self.hello.get().cloned().ok_or(Error::NotRunning)?;

        let inbound = self.client_inbound.lock().await.take();
        let server_reader = self.server_reader.lock().await.take();
        let client_writer = self.client_writer.lock().await.take();
        let server_writer = self.server_writer.lock().await.take();
        self.shutdown.cancel();
        self.ctx.ids.free(self.id);

        let (Some(inbound), Some(server_reader), Some(mut client_writer), Some(mut server_writer)) =
            (inbound, server_reader, client_writer, server_writer)
        else {
            return Err(Error::NotRunning);
        };

        if !server_reader.buffer().is_empty() {
            tokio::time::timeout(
                CLIENT_DRAIN_TIMEOUT,
                client_writer.write_all(server_reader.buffer()),
            )
            .await
            .map_err(|_| Error::Timeout("client drain"))??;
        }
        let mut pending = inbound.unsent;
        pending.extend_from_slice(inbound.reader.buffer());
        if !pending.is_empty() {
            server_writer.write_all(&pending).await?;
        }

        let client = inbound
            .reader
            .into_inner()
            .reunite(client_writer)
            .map_err(|e| Error::Upgrade(e.to_string()))?
            .into_std()?;
        let server = server_reader
            .into_inner()
            .reunite(server_writer)
            .map_err(|e| Error::Upgrade(e.to_string()))?
            .into_std()?;

        Ok(DetachedSession {
            snapshot: SessionSnapshot {
                session_id: self.id,
                mining_coin: self.mining_coin(),
                subscribe: hello.saved_subscribe(),
                authorize: hello.saved_authorize(),
                client_fd: -1,
                server_fd: -1,
                version_mask: hello.version_mask,
            },
            client,
            server,
        })
    }

    async fn write_to_client(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.client_writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotRunning)?;
        writer.write_all(data).await?;
        Ok(())
    }

    /// Write bytes left over from a server connection to the client.
    async fn flush_to_client(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.client_writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotRunning)?;
        tokio::time::timeout(CLIENT_DRAIN_TIMEOUT, writer.write_all(data))
            .await
            .map_err(|_| Error::Timeout("client drain"))??;
        self.note_client_write(data);
        Ok(())
    }

    fn note_client_write(&self, data: &[u8]) {
        if let Some(last) = data.last() {
            self.client_mid_line.store(*last != b'\n', Ordering::Relaxed);
        }
    }

    fn client_mid_line(&self) -> bool {
        self.client_mid_line.load(Ordering::Relaxed)
    }

    /// Report an error to a client that is still in its handshake.
    async fn reply_error(&self, error: &StratumError) {
        let response =
            JsonRpcResponse::error(serde_json::Value::Null, error, self.ctx.server_id);
        if let Ok(line) = response.to_line() {
            let _ = self.write_to_client(&line).await;
        }
    }

    /// Sleep unless the session shuts down first.
    async fn pause(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::NotRunning),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Read one newline-terminated line (newline included).
pub(crate) async fn read_line<R>(reader: &mut R, peer: &'static str) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .take(MAX_LINE_LENGTH as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if n == 0 {
        return Err(Error::Closed(peer));
    }
    if line.last() != Some(&b'\n') {
        return Err(if n >= MAX_LINE_LENGTH {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("line from {} too long", peer),
            ))
        } else {
            Error::Closed(peer)
        });
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainType;

    #[tokio::test]
    async fn test_read_line() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\npartial";
        let mut reader = BufReader::new(data);
        assert_eq!(read_line(&mut reader, "test").await.unwrap(), b"{\"a\":1}\n");
        assert_eq!(read_line(&mut reader, "test").await.unwrap(), b"{\"b\":2}\n");
        assert!(matches!(
            read_line(&mut reader, "test").await,
            Err(Error::Closed("test"))
        ));
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let data = vec![b'x'; MAX_LINE_LENGTH + 10];
        let mut reader = BufReader::new(data.as_slice());
        assert!(matches!(
            read_line(&mut reader, "test").await,
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_line_tracker() {
        let mut line = LineTracker::default();
        line.delivered(b"{\"id\":1}\n{\"id\"");
        line.delivered(b":2,");
        assert_eq!(&line.take()[..], b"{\"id\":2,");

        line.delivered(b"{\"id\":3}\n");
        assert!(line.take().is_empty());
    }

    #[test]
    fn test_line_tracker_gives_up_on_huge_lines() {
        let mut line = LineTracker::default();
        line.delivered(&vec![b'x'; MAX_LINE_LENGTH + 1]);
        assert!(line.take().is_empty());
    }

    #[test]
    fn test_snapshot_json_keys() {
        let snapshot = SessionSnapshot {
            session_id: SessionId::new(ChainType::Bitcoin, 1, 2),
            mining_coin: "btc".into(),
            subscribe: None,
            authorize: JsonRpcRequest::new(serde_json::json!(2), "mining.authorize", vec![]),
            client_fd: 7,
            server_fd: 8,
            version_mask: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["SessionID"], serde_json::json!(0x0100_0002));
        assert_eq!(json["ClientConnFD"], serde_json::json!(7));
        assert!(json.get("VersionMask").is_none());

        let back: SessionSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }
}
