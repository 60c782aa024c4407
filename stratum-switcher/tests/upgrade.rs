//! Taking over a listener and live sessions from a previous process.

#![cfg(unix)]

mod common;

use common::{config, Miner, MockPool, Switcher};
use serde_json::json;
use std::os::fd::IntoRawFd;

use stratum_switcher::upgrade::RuntimeData;

#[tokio::test]
async fn test_restore_adopts_listener_and_sessions() {
    let mut btc = MockPool::start().await;
    let bch = MockPool::start().await;
    let (btc_addr, bch_addr) = (btc.addr, bch.addr);
    let make_config = move || config("Bitcoin", &[("btc", btc_addr), ("bch", bch_addr)], "");

    let old = Switcher::start_with(make_config()).await;
    old.assign("alice", "btc");

    let mut miner = Miner::connect(old.addr).await;
    miner.sign_up("cgminer/4.10", "alice.rig1").await;
    miner.recv_method("mining.notify").await;
    old.wait_for_sessions(1).await;
    btc.request_for("mining.authorize").await;

    // What the old process writes before exec.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let mut runtime = RuntimeData::new(1);
    runtime.listener_fd = Some(listener.into_raw_fd());
    for detached in old.manager.export_sessions().await {
        let mut snapshot = detached.snapshot;
        snapshot.client_fd = detached.client.into_raw_fd();
        snapshot.server_fd = detached.server.into_raw_fd();
        runtime.sessions.push(snapshot);
    }
    assert_eq!(runtime.sessions.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.json");
    runtime.save_to(&path).unwrap();
    let runtime = RuntimeData::load_from(&path).unwrap();

    let new = Switcher::restored(make_config(), old.store.clone(), runtime).await;
    assert_eq!(new.addr, listen_addr);
    new.wait_for_sessions(1).await;
    new.wait_for_ids(1).await;

    // Same pool connection, no second sign-up.
    miner
        .send(json!({"id": 4, "method": "mining.submit", "params": []}))
        .await;
    assert_eq!(btc.request_for("mining.submit").await.conn, 1);
    assert_eq!(miner.recv_response(json!(4)).await["result"], json!(true));

    // The inherited listener takes new miners.
    let mut second = Miner::connect(new.addr).await;
    assert_eq!(second.sign_up("cgminer", "alice.rig2").await, "01000001");
}

#[tokio::test]
async fn test_restore_rejects_other_server_id() {
    let btc = MockPool::start().await;
    let bch = MockPool::start().await;
    let switcher = Switcher::start(&btc, &bch).await;

    let runtime = RuntimeData::new(2);
    assert!(switcher.manager.restore(runtime).is_err());
}
