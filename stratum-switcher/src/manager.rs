//! Session manager.
//!
//! Owns the listener, the id allocator and the table of proxying sessions.
//! Everything sessions share lives in one [`SwitcherContext`].

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::{DetachedSession, Session, SessionInfo};
use crate::session_id::SessionIdAllocator;
use crate::tracing::prelude::*;
use crate::types::SessionId;
use crate::upgrade::{self, HandoffFailed, RuntimeData, UpgradeSignal};
use crate::watch::{child_path, WatchManager, WatchStore};

/// State shared by the manager and every session.
pub struct SwitcherContext {
    pub config: Config,
    pub server_id: u8,
    /// Whether the server id is held by an ephemeral node in the store
    /// rather than fixed by the config.
    pub claimed_server_id: bool,
    pub ids: SessionIdAllocator,
    pub watch: WatchManager,
    pub registry: SessionRegistry,
    /// Permits for concurrent auto-registration waits; `None` when
    /// auto-registration is off.
    pub auto_reg: Option<Semaphore>,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
}

/// Sessions currently proxying, by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn register(&self, session: Arc<Session>) {
        self.sessions.lock().insert(session.id(), session);
    }

    pub fn unregister(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Snapshot of the table, ordered by id.
    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }

    pub fn infos(&self) -> Vec<SessionInfo> {
        self.list().iter().map(|s| s.info()).collect()
    }
}

/// Pause between attempts to reclaim a server id still held by the
/// previous process's store session.
const RECLAIM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Attempts before giving up on reclaiming a server id.
const RECLAIM_ATTEMPTS: u32 = 60;

/// How a manager comes by its server id.
enum ServerIdClaim {
    /// Set in the config.
    Fixed(u8),
    /// Lowest free id in the assignment directory.
    Assign,
    /// The id a previous process held, taken over after a live upgrade.
    Reclaim(u8),
}

pub struct SessionManager {
    ctx: Arc<SwitcherContext>,
}

impl SessionManager {
    /// Prepare the store layout, settle the server id and build the shared
    /// context.
    pub async fn new(
        config: Config,
        store: Arc<dyn WatchStore>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
    ) -> Result<Self> {
        let claim = match config.server_id {
            0 => ServerIdClaim::Assign,
            id => ServerIdClaim::Fixed(id),
        };
        Self::build(config, store, shutdown, tasks, claim).await
    }

    /// Like [`SessionManager::new`], for a process taking over from the one
    /// that wrote `runtime`. A self-assigned server id is claimed again in
    /// the store under the same number, so that the restored session ids
    /// stay unique.
    pub async fn restoring(
        config: Config,
        store: Arc<dyn WatchStore>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
        runtime: &RuntimeData,
    ) -> Result<Self> {
        let claim = match config.server_id {
            0 => ServerIdClaim::Reclaim(runtime.server_id),
            id => ServerIdClaim::Fixed(id),
        };
        Self::build(config, store, shutdown, tasks, claim).await
    }

    async fn build(
        config: Config,
        store: Arc<dyn WatchStore>,
        shutdown: CancellationToken,
        tasks: TaskTracker,
        claim: ServerIdClaim,
    ) -> Result<Self> {
        let watch = WatchManager::new(store);
        watch.ensure_path(&config.zk_switcher_watch_dir).await?;

        let (server_id, claimed_server_id) = match claim {
            ServerIdClaim::Fixed(id) => (id, false),
            ServerIdClaim::Assign => (assign_server_id(&watch, &config).await?, true),
            ServerIdClaim::Reclaim(id) => (reclaim_server_id(&watch, &config, id).await?, true),
        };
        let ids = SessionIdAllocator::new(config.chain_type, server_id)?;

        let auto_reg = if config.enable_user_auto_reg {
            watch.ensure_path(&config.zk_auto_reg_watch_dir).await?;
            let permits = match config.auto_reg_max_wait_users {
                0 => Semaphore::MAX_PERMITS,
                n => n,
            };
            Some(Semaphore::new(permits))
        } else {
            None
        };

        info!(
            server_id,
            chain = %config.chain_type,
            coins = config.stratum_servers.len(),
            "Session manager ready."
        );

        Ok(Self {
            ctx: Arc::new(SwitcherContext {
                config,
                server_id,
                claimed_server_id,
                ids,
                watch,
                registry: SessionRegistry::default(),
                auto_reg,
                shutdown,
                tasks,
            }),
        })
    }

    pub fn context(&self) -> &Arc<SwitcherContext> {
        &self.ctx
    }

    pub fn server_id(&self) -> u8 {
        self.ctx.server_id
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.ctx.config.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "Listening for miners.");
        Ok(listener)
    }

    /// Accept miners until shut down. SIGUSR2 starts a live upgrade; this
    /// only returns if the process was not replaced.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        let mut upgrade_signal = UpgradeSignal::new()?;

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                _ = upgrade_signal.recv() => {
                    let error = self.upgrade(&listener).await;
                    error!(error = %error, "Upgrade failed; carrying on.");
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        trace!(%addr, "Accepted connection.");
                        self.accept(stream);
                    }
                    Err(e) => warn!(error = %e, "Accept failed."),
                },
            }
        }

        debug!("Accept loop stopped.");
        Ok(())
    }

    fn accept(&self, stream: TcpStream) {
        let id = match self.ctx.ids.alloc() {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Cannot allocate session id; closing connection.");
                return;
            }
        };

        match Session::new(self.ctx.clone(), id, stream) {
            Ok(session) => {
                self.ctx.tasks.spawn(session.run());
            }
            Err(e) => {
                debug!(session = %id, error = %e, "Dropping connection.");
                self.ctx.ids.free(id);
            }
        }
    }

    /// Take every proxying session out of service, sockets intact.
    pub async fn export_sessions(&self) -> Vec<DetachedSession> {
        let sessions = self.ctx.registry.list();
        let results = futures::future::join_all(sessions.iter().map(|s| s.detach())).await;

        let mut detached = Vec::new();
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(d) => detached.push(d),
                Err(e) => warn!(session = %session.id(), error = %e, "Cannot export session."),
            }
        }
        info!(sessions = detached.len(), "Exported sessions.");
        detached
    }

    /// Resume detached sessions in this process. Returns how many started.
    pub fn adopt(&self, sessions: Vec<DetachedSession>) -> usize {
        let mut adopted = 0;
        for detached in sessions {
            let id = detached.snapshot.session_id;
            match self.adopt_one(detached) {
                Ok(()) => adopted += 1,
                Err(e) => warn!(session = %id, error = %e, "Cannot resume session."),
            }
        }
        adopted
    }

    fn adopt_one(&self, detached: DetachedSession) -> Result<()> {
        let DetachedSession {
            snapshot,
            client,
            server,
        } = detached;
        let id = snapshot.session_id;

        client.set_nonblocking(true)?;
        server.set_nonblocking(true)?;
        let client = TcpStream::from_std(client)?;
        let server = TcpStream::from_std(server)?;

        self.ctx.ids.resume(id)?;
        match Session::new(self.ctx.clone(), id, client) {
            Ok(session) => {
                self.ctx.tasks.spawn(session.resume(snapshot, server));
                Ok(())
            }
            Err(e) => {
                self.ctx.ids.free(id);
                Err(e)
            }
        }
    }

    /// Take over from a previous process. Returns the inherited listener,
    /// if it handed one over.
    pub fn restore(&self, runtime: RuntimeData) -> Result<Option<TcpListener>> {
        if runtime.server_id != self.ctx.server_id {
            return Err(Error::Upgrade(format!(
                "runtime data is for server {}, this is server {}",
                runtime.server_id, self.ctx.server_id
            )));
        }

        let listener = match runtime.listener_fd {
            Some(fd) => Some(TcpListener::from_std(upgrade::adopt_listener(fd)?)?),
            None => None,
        };

        let mut detached = Vec::new();
        for snapshot in runtime.sessions {
            let streams = upgrade::adopt_stream(snapshot.client_fd)
                .and_then(|client| Ok((client, upgrade::adopt_stream(snapshot.server_fd)?)));
            match streams {
                Ok((client, server)) => detached.push(DetachedSession {
                    snapshot,
                    client,
                    server,
                }),
                Err(e) => warn!(session = %snapshot.session_id, error = %e, "Cannot adopt session sockets."),
            }
        }

        let total = detached.len();
        let adopted = self.adopt(detached);
        info!(adopted, total, "Restored sessions from previous process.");
        Ok(listener)
    }

    /// Replace this process with a fresh copy of the binary, handing over
    /// the listener and every proxying session. Only returns on failure,
    /// after putting the sessions back to work.
    async fn upgrade(&self, listener: &TcpListener) -> Error {
        info!("Live upgrade requested.");
        let mut sessions = self.export_sessions().await;
        let failed = upgrade::handoff(
            listener,
            &mut sessions,
            self.ctx.server_id,
            self.ctx.watch.store().as_ref(),
        )
        .await;

        let error = match failed {
            HandoffFailed::Prepare(e) => e,
            HandoffFailed::Exec(e) => {
                // The store session, and the server id node with it, went
                // away for the new process.
                if self.ctx.claimed_server_id {
                    if let Err(e) =
                        reclaim_server_id(&self.ctx.watch, &self.ctx.config, self.ctx.server_id)
                            .await
                    {
                        error!(error = %e, "Cannot reclaim server id after failed upgrade.");
                    }
                }
                e
            }
        };

        let adopted = self.adopt(sessions);
        info!(adopted, "Resumed sessions after failed upgrade.");
        error
    }

    /// Stop every registered session.
    pub fn stop_all(&self) {
        let sessions = self.ctx.registry.list();
        info!(sessions = sessions.len(), "Stopping all sessions.");
        for session in sessions {
            session.stop();
        }
    }
}

// Contents of a server id node, for operators browsing the store.
fn server_meta(config: &Config) -> String {
    let mut coins: Vec<&String> = config.stratum_servers.keys().collect();
    coins.sort();
    json!({
        "ChainType": config.chain_type.to_string(),
        "Coins": coins,
        "HostName": upgrade::hostname(),
        "ListenAddr": config.listen_addr,
    })
    .to_string()
}

/// Claim the lowest free server id under `ZKServerIDAssignDir`.
async fn assign_server_id(watch: &WatchManager, config: &Config) -> Result<u8> {
    let dir = &config.zk_server_id_assign_dir;
    watch.ensure_path(dir).await?;

    let used: HashSet<u8> = watch
        .store()
        .children(dir)
        .await?
        .iter()
        .filter_map(|name| name.parse().ok())
        .collect();

    let meta = server_meta(config);
    for id in (1..=u8::MAX).filter(|id| !used.contains(id)) {
        let path = child_path(dir, &id.to_string());
        match watch.store().create_ephemeral(&path, meta.as_bytes()).await {
            Ok(()) => {
                info!(server_id = id, %path, "Assigned server id.");
                return Ok(id);
            }
            Err(Error::NodeExists(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::Config("no free server id left".into()))
}

/// Claim exactly `id` under `ZKServerIDAssignDir`.
///
/// The node may still belong to the store session of the process being
/// replaced; it goes away when that session ends, so `NodeExists` is
/// retried for a while.
async fn reclaim_server_id(watch: &WatchManager, config: &Config, id: u8) -> Result<u8> {
    let dir = &config.zk_server_id_assign_dir;
    watch.ensure_path(dir).await?;

    let path = child_path(dir, &id.to_string());
    let meta = server_meta(config);
    for attempt in 1..=RECLAIM_ATTEMPTS {
        match watch.store().create_ephemeral(&path, meta.as_bytes()).await {
            Ok(()) => {
                info!(server_id = id, %path, "Reclaimed server id.");
                return Ok(id);
            }
            Err(Error::NodeExists(_)) => {
                debug!(server_id = id, attempt, "Server id still held; waiting.");
                tokio::time::sleep(RECLAIM_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }

    error!(server_id = id, %path, "Server id never became free.");
    Err(Error::Config(format!(
        "server id {} is still held in {}",
        id, dir
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::MemoryStore;

    fn config(server_id: u8) -> Config {
        Config::from_json(&format!(
            r#"{{
                "ServerID": {},
                "ChainType": "Bitcoin",
                "ListenAddr": "127.0.0.1:0",
                "StratumServerMap": {{"btc": {{"URL": "127.0.0.1:1"}}}},
                "ZKBroker": ["memory"],
                "ZKSwitcherWatchDir": "/stratumSwitcher/btc/"
            }}"#,
            server_id
        ))
        .unwrap()
    }

    async fn manager(store: &MemoryStore, server_id: u8) -> Result<SessionManager> {
        SessionManager::new(
            config(server_id),
            Arc::new(store.clone()),
            CancellationToken::new(),
            TaskTracker::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_fixed_server_id() {
        let store = MemoryStore::new();
        let manager = manager(&store, 7).await.unwrap();
        assert_eq!(manager.server_id(), 7);
        assert!(store.exists("/stratumSwitcher/btc").await.unwrap());
        assert!(manager.context().auto_reg.is_none());
    }

    #[tokio::test]
    async fn test_server_id_assignment_skips_used() {
        let store = MemoryStore::new();
        store.insert("/stratumSwitcher/serverIDs/1", b"{}");
        store.insert("/stratumSwitcher/serverIDs/2", b"{}");

        let manager = manager(&store, 0).await.unwrap();
        assert_eq!(manager.server_id(), 3);

        let meta: serde_json::Value =
            serde_json::from_slice(&store.get("/stratumSwitcher/serverIDs/3").await.unwrap())
                .unwrap();
        assert_eq!(meta["ChainType"], json!("bitcoin"));
        assert_eq!(meta["Coins"], json!(["btc"]));
    }

    #[tokio::test]
    async fn test_server_id_exhausted() {
        let store = MemoryStore::new();
        for id in 1..=255 {
            store.insert(&format!("/stratumSwitcher/serverIDs/{}", id), b"");
        }
        assert!(matches!(manager(&store, 0).await, Err(Error::Config(_))));
    }

    async fn restoring(store: &MemoryStore, server_id: u8, runtime: u8) -> Result<SessionManager> {
        SessionManager::restoring(
            config(server_id),
            Arc::new(store.clone()),
            CancellationToken::new(),
            TaskTracker::new(),
            &RuntimeData::new(runtime),
        )
        .await
    }

    const ASSIGN_DIR: &str = "/stratumSwitcher/serverIDs/";

    #[tokio::test]
    async fn test_restoring_reclaims_server_id() {
        let store = MemoryStore::new();
        let old = manager(&store, 0).await.unwrap();
        assert_eq!(old.server_id(), 1);

        // The old process closes its store session before exec.
        store.close().await.unwrap();
        assert!(!store.exists(&format!("{}1", ASSIGN_DIR)).await.unwrap());

        let restored = restoring(&store, 0, 1).await.unwrap();
        assert_eq!(restored.server_id(), 1);
        assert!(restored.context().claimed_server_id);
        assert!(store.exists(&format!("{}1", ASSIGN_DIR)).await.unwrap());

        let other = manager(&store, 0).await.unwrap();
        assert_ne!(other.server_id(), restored.server_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_waits_for_old_session() {
        let store = MemoryStore::new();
        store.insert(&format!("{}4", ASSIGN_DIR), b"{}");

        let expiring = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            expiring.delete(&format!("{}4", ASSIGN_DIR));
        });

        let restored = restoring(&store, 0, 4).await.unwrap();
        assert_eq!(restored.server_id(), 4);
        assert!(store.exists(&format!("{}4", ASSIGN_DIR)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_gives_up_on_held_id() {
        let store = MemoryStore::new();
        store.insert(&format!("{}4", ASSIGN_DIR), b"{}");
        assert!(matches!(
            restoring(&store, 0, 4).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_restoring_with_fixed_id_claims_nothing() {
        let store = MemoryStore::new();
        let restored = restoring(&store, 5, 5).await.unwrap();
        assert_eq!(restored.server_id(), 5);
        assert!(!restored.context().claimed_server_id);
        assert!(!store.exists("/stratumSwitcher/serverIDs").await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_rejects_other_server() {
        let store = MemoryStore::new();
        let manager = manager(&store, 1).await.unwrap();
        let result = manager.restore(RuntimeData::new(2));
        assert!(matches!(result, Err(Error::Upgrade(_))));
    }

    #[tokio::test]
    async fn test_accept_allocates_session_id() {
        let store = MemoryStore::new();
        let manager = manager(&store, 1).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let _client = client.unwrap();
        manager.accept(accepted.unwrap().0);
        assert_eq!(manager.context().ids.count(), 1);
        manager.context().shutdown.cancel();
    }
}
