//! Loopback fixtures: a scripted pool server, a line-oriented miner and a
//! switcher running over an in-memory store.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use stratum_switcher::config::Config;
use stratum_switcher::manager::SessionManager;
use stratum_switcher::upgrade::RuntimeData;
use stratum_switcher::watch::MemoryStore;

pub const WAIT: Duration = Duration::from_secs(5);

/// Root of coin assignments in every test config.
pub const WATCH_DIR: &str = "/switcher/";

/// A request as seen by a mock pool, tagged with the pool connection
/// (counted from 1) it arrived on.
#[derive(Debug, Clone)]
pub struct PoolRequest {
    pub conn: usize,
    pub method: String,
    pub params: Value,
}

#[derive(Default)]
struct PoolScript {
    /// Answer subscribes the way Ethereum pools do.
    ethereum: bool,
    /// Session id to return instead of the one sent.
    session_id_override: Option<String>,
    /// Whole subscribe result to return instead of the usual one.
    subscribe_result: Option<Value>,
    /// Authorize requests to refuse before accepting.
    reject_authorizes: usize,
    /// Raw writers of each connection.
    pushers: HashMap<usize, mpsc::UnboundedSender<Vec<u8>>>,
}

pub struct MockPool {
    pub addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<PoolRequest>,
    script: Arc<Mutex<PoolScript>>,
    connections: Arc<Mutex<CancellationToken>>,
}

impl MockPool {
    /// A pool answering Ethereum subscribes (`true`, or the NiceHash array).
    pub async fn start_ethereum() -> Self {
        let pool = Self::start().await;
        pool.script.lock().ethereum = true;
        pool
    }

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, requests) = mpsc::unbounded_channel();
        let script = Arc::new(Mutex::new(PoolScript::default()));
        let connections = Arc::new(Mutex::new(CancellationToken::new()));

        let conn_count = Arc::new(AtomicUsize::new(0));
        let (script_, connections_) = (script.clone(), connections.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let conn = conn_count.fetch_add(1, Ordering::SeqCst) + 1;
                let kill = connections_.lock().clone();
                tokio::spawn(serve_pool_conn(stream, conn, tx.clone(), script_.clone(), kill));
            }
        });

        Self {
            addr,
            requests,
            script,
            connections,
        }
    }

    pub fn override_session_id(&self, id: &str) {
        self.script.lock().session_id_override = Some(id.to_string());
    }

    pub fn override_subscribe_result(&self, result: Value) {
        self.script.lock().subscribe_result = Some(result);
    }

    pub fn reject_authorizes(&self, count: usize) {
        self.script.lock().reject_authorizes = count;
    }

    /// Write raw bytes on connection `conn` (counted from 1).
    pub fn push(&self, conn: usize, bytes: Vec<u8>) {
        let pusher = self.script.lock().pushers[&conn].clone();
        pusher.send(bytes).unwrap();
    }

    /// Drop every open connection; later connections are served normally.
    pub fn kill_connections(&self) {
        let mut token = self.connections.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Next request the pool received.
    pub async fn request(&mut self) -> PoolRequest {
        self.request_within(WAIT).await
    }

    pub async fn request_within(&mut self, wait: Duration) -> PoolRequest {
        tokio::time::timeout(wait, self.requests.recv())
            .await
            .expect("pool request timed out")
            .expect("pool stopped")
    }

    /// Next request with `method`, skipping others.
    pub async fn request_for(&mut self, method: &str) -> PoolRequest {
        self.request_for_within(method, WAIT).await
    }

    pub async fn request_for_within(&mut self, method: &str, wait: Duration) -> PoolRequest {
        loop {
            let request = self.request_within(wait).await;
            if request.method == method {
                return request;
            }
        }
    }

    /// Assert nothing arrives for a short while.
    pub async fn assert_quiet(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(300), self.requests.recv()).await;
        assert!(next.is_err(), "unexpected pool request: {:?}", next);
    }
}

async fn serve_pool_conn(
    stream: TcpStream,
    conn: usize,
    requests: mpsc::UnboundedSender<PoolRequest>,
    script: Arc<Mutex<PoolScript>>,
    kill: CancellationToken,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let (pusher, mut pushed) = mpsc::unbounded_channel::<Vec<u8>>();
    script.lock().pushers.insert(conn, pusher);

    loop {
        let line = tokio::select! {
            _ = kill.cancelled() => return,
            Some(bytes) = pushed.recv() => {
                tokio::select! {
                    _ = kill.cancelled() => return,
                    written = write.write_all(&bytes) => if written.is_err() {
                        return;
                    },
                }
                continue;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
        };
        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(_) => continue,
        };
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        let _ = requests.send(PoolRequest {
            conn,
            method: method.clone(),
            params: params.clone(),
        });

        let mut replies = Vec::new();
        match method.as_str() {
            "mining.configure" => {
                replies.push(json!({"id": id, "result": {"version-rolling": true}, "error": null}));
            }
            "mining.subscribe" => {
                let script = script.lock();
                let sid_param = if script.ethereum { 2 } else { 1 };
                let sid = script
                    .session_id_override
                    .clone()
                    .unwrap_or_else(|| params[sid_param].as_str().unwrap_or_default().to_string());
                let result = match &script.subscribe_result {
                    Some(result) => result.clone(),
                    None if !script.ethereum => json!([[["mining.notify", sid]], sid, 8]),
                    None if params[1]
                        .as_str()
                        .unwrap_or_default()
                        .to_ascii_lowercase()
                        .starts_with("ethereumstratum/") =>
                    {
                        json!([["mining.notify", sid, "EthereumStratum/1.0.0"], sid])
                    }
                    None => json!(true),
                };
                // Notifications may precede the response.
                replies.push(json!({"id": null, "method": "mining.set_difficulty", "params": [conn]}));
                replies.push(json!({"id": id, "result": result, "error": null}));
            }
            "mining.authorize" => {
                let accepted = {
                    let mut script = script.lock();
                    if script.reject_authorizes > 0 {
                        script.reject_authorizes -= 1;
                        false
                    } else {
                        true
                    }
                };
                replies.push(json!({"id": id, "result": accepted, "error": null}));
                if accepted {
                    replies.push(json!({"id": null, "method": "mining.notify", "params": [format!("job-{}", conn)]}));
                }
            }
            _ => replies.push(json!({"id": id, "result": true, "error": null})),
        }

        for reply in replies {
            let mut bytes = serde_json::to_vec(&reply).unwrap();
            bytes.push(b'\n');
            if write.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

/// A miner speaking newline-delimited JSON.
pub struct Miner {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Miner {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, write) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    pub async fn send(&mut self, message: Value) {
        let mut bytes = serde_json::to_vec(&message).unwrap();
        bytes.push(b'\n');
        self.write.write_all(&bytes).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
    }

    /// Next message, or `None` once the switcher closed the connection.
    pub async fn recv(&mut self) -> Option<Value> {
        self.recv_within(WAIT).await
    }

    pub async fn recv_within(&mut self, wait: Duration) -> Option<Value> {
        let line = tokio::time::timeout(wait, self.lines.next_line())
            .await
            .expect("miner read timed out");
        match line {
            Ok(Some(line)) => Some(serde_json::from_str(&line).unwrap()),
            _ => None,
        }
    }

    /// Next raw line without its newline, or `None` once closed.
    pub async fn recv_line_within(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.lines.next_line())
            .await
            .expect("miner read timed out")
            .ok()
            .flatten()
    }

    /// Next message that carries `method`, skipping others.
    pub async fn recv_method(&mut self, method: &str) -> Value {
        loop {
            let message = self.recv().await.expect("connection closed");
            if message["method"] == json!(method) {
                return message;
            }
        }
    }

    /// Next message that is a response to request `id`.
    pub async fn recv_response(&mut self, id: Value) -> Value {
        self.recv_response_within(id, WAIT).await
    }

    pub async fn recv_response_within(&mut self, id: Value, wait: Duration) -> Value {
        loop {
            let message = self.recv_within(wait).await.expect("connection closed");
            if message.get("method").is_none() && message["id"] == id {
                return message;
            }
        }
    }

    pub async fn assert_closed(&mut self) {
        while let Some(message) = self.recv().await {
            assert!(
                message.get("method").is_some() || message["error"].is_null(),
                "unexpected message before close: {}",
                message
            );
        }
    }

    /// Subscribe and authorize as a Bitcoin miner. Returns the
    /// extranonce1 (session id) handed out.
    pub async fn sign_up(&mut self, user_agent: &str, worker: &str) -> String {
        self.send(json!({"id": 1, "method": "mining.subscribe", "params": [user_agent]}))
            .await;
        let subscribed = self.recv_response(json!(1)).await;
        let extranonce1 = subscribed["result"][1].as_str().unwrap().to_string();

        self.send(json!({"id": 2, "method": "mining.authorize", "params": [worker, "x"]}))
            .await;
        extranonce1
    }
}

/// A switcher on a loopback port over an in-memory store.
pub struct Switcher {
    pub addr: SocketAddr,
    pub store: MemoryStore,
    pub manager: Arc<SessionManager>,
    pub shutdown: CancellationToken,
}

/// Address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Config for server 1 on `chain` with the given coins, plus `extra`
/// top-level fields.
pub fn config(chain: &str, servers: &[(&str, SocketAddr)], extra: &str) -> Config {
    let servers: Vec<String> = servers
        .iter()
        .map(|(coin, addr)| format!(r#""{}": {{"URL": "{}"}}"#, coin, addr))
        .collect();
    let extra = if extra.is_empty() {
        String::new()
    } else {
        format!(",{}", extra)
    };
    Config::from_json(&format!(
        r#"{{
            "ServerID": 1,
            "ChainType": "{}",
            "ListenAddr": "127.0.0.1:0",
            "StratumServerMap": {{ {} }},
            "ZKBroker": ["memory"],
            "ZKSwitcherWatchDir": "{}"
            {}
        }}"#,
        chain,
        servers.join(", "),
        WATCH_DIR,
        extra
    ))
    .unwrap()
}

impl Switcher {
    /// Serve `btc` and `bch` from the given pools.
    pub async fn start(btc: &MockPool, bch: &MockPool) -> Self {
        Self::start_with(config("Bitcoin", &[("btc", btc.addr), ("bch", bch.addr)], "")).await
    }

    pub async fn start_with(config: Config) -> Self {
        let store = MemoryStore::new();
        let shutdown = CancellationToken::new();
        let manager = SessionManager::new(
            config,
            Arc::new(store.clone()),
            shutdown.clone(),
            TaskTracker::new(),
        )
        .await
        .unwrap();
        let manager = Arc::new(manager);

        let listener = manager.bind().await.unwrap();
        Self::serve(manager, listener, store, shutdown)
    }

    /// Take over from a previous process the way a restarted binary does.
    pub async fn restored(config: Config, store: MemoryStore, runtime: RuntimeData) -> Self {
        let shutdown = CancellationToken::new();
        let manager = SessionManager::restoring(
            config,
            Arc::new(store.clone()),
            shutdown.clone(),
            TaskTracker::new(),
            &runtime,
        )
        .await
        .unwrap();
        let manager = Arc::new(manager);

        let listener = manager
            .restore(runtime)
            .unwrap()
            .expect("runtime data carries a listener");
        Self::serve(manager, listener, store, shutdown)
    }

    fn serve(
        manager: Arc<SessionManager>,
        listener: TcpListener,
        store: MemoryStore,
        shutdown: CancellationToken,
    ) -> Self {
        let addr = listener.local_addr().unwrap();
        let runner = manager.clone();
        tokio::spawn(async move { runner.run(listener).await });

        Self {
            addr,
            store,
            manager,
            shutdown,
        }
    }

    pub fn assign(&self, subaccount: &str, coin: &str) {
        self.store
            .insert(&format!("{}{}", WATCH_DIR, subaccount), coin.as_bytes());
    }

    /// Wait until `count` sessions are proxying.
    pub async fn wait_for_sessions(&self, count: usize) {
        self.wait_until(|| self.manager.context().registry.len() == count)
            .await;
    }

    /// Wait until `count` session ids are allocated.
    pub async fn wait_for_ids(&self, count: u32) {
        self.wait_until(|| self.manager.context().ids.count() == count)
            .await;
    }

    async fn wait_until(&self, done: impl Fn() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("switcher did not settle");
    }
}

impl Drop for Switcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
