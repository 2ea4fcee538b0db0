// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::{Mocks, TestClient, TestManager, TestServer, api_config, application_config};
use electrum_api::domain::{
    ChainNotification, HistoryEntry, Touched, hash_to_hex, hex_to_hash, status::status_hash,
};
use indexer_common::domain::{BlockHash, Event, HashX, TxHash};
use serde_json::{Value, json};
use std::{collections::HashSet, sync::atomic::Ordering, time::Duration};
use tokio::time::{sleep, timeout};

const ATTEMPTS: usize = 200;
const POLL: Duration = Duration::from_millis(25);

async fn wait_until<F>(what: &str, mut condition: F)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..ATTEMPTS {
        if condition().await {
            return;
        }
        sleep(POLL).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_admission_pauses_and_resumes_listeners() {
    let server = TestServer::start(api_config(10)).await;
    let tcp_addr = server.tcp_addr().await;

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(TestClient::connect(tcp_addr).await);
    }

    // At the maximum the external listener stops; the RPC listener stays.
    wait_until("listener paused", async || {
        server
            .manager
            .local_addr(electrum_api::infra::api::ServiceProtocol::Tcp)
            .await
            .is_none()
    })
    .await;
    assert!(
        server
            .manager
            .local_addr(electrum_api::infra::api::ServiceProtocol::Rpc)
            .await
            .is_some()
    );
    assert!(tokio::net::TcpStream::connect(tcp_addr).await.is_err());

    // Dropping one session reaches the low watermark of 9 and resumes.
    clients.pop();
    wait_until("listener resumed", async || {
        server
            .manager
            .local_addr(electrum_api::infra::api::ServiceProtocol::Tcp)
            .await
            .is_some()
    })
    .await;

    let resumed_addr = server.tcp_addr().await;
    let _client = TestClient::connect(resumed_addr).await;

    server.stop().await;
}

#[tokio::test]
async fn test_reorg_invalidates_height_caches() {
    let mocks = Mocks::default();
    mocks
        .db
        .put_tx_hashes(100, vec![TxHash::from([0x42; 32])]);

    let server = TestServer::start_with_mocks(api_config(100), mocks).await;
    let db = &server.mocks.db;

    // Warm the cache: a second read is served without a db fetch.
    server
        .manager
        .tx_hashes_at_blockheight(100)
        .await
        .expect("tx hashes");
    server
        .manager
        .tx_hashes_at_blockheight(100)
        .await
        .expect("tx hashes");
    assert_eq!(db.0.tx_hashes_calls.load(Ordering::Relaxed), 1);

    // A reorg bumps the generation and clears the cache.
    wait_until("reorg handled", async || {
        server.mocks.bp.signal_backed_up();
        server.manager.reorg_count() == 1
    })
    .await;

    server
        .manager
        .tx_hashes_at_blockheight(100)
        .await
        .expect("tx hashes");
    assert_eq!(db.0.tx_hashes_calls.load(Ordering::Relaxed), 2);

    server.stop().await;
}

#[tokio::test]
async fn test_scripthash_subscribe_status() {
    let scripthash = "11".repeat(32);
    let hashx = electrum_api::domain::scripthash_to_hashx(&scripthash).expect("valid scripthash");

    let mocks = Mocks::default();
    mocks.db.put_history(
        hashx,
        vec![HistoryEntry {
            tx_hash: hex_to_hash(&"11".repeat(32)).expect("valid hash"),
            height: 100,
        }],
    );

    let server = TestServer::start_with_mocks(api_config(100), mocks).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    // A script with history digests its history string.
    let response = client
        .call("blockchain.scripthash.subscribe", json!([scripthash]))
        .await;
    let expected = status_hash(&format!("{}:100:", "11".repeat(32)));
    assert_eq!(response["result"], json!(expected));

    // No history at all digests to null.
    let response = client
        .call("blockchain.scripthash.subscribe", json!(["22".repeat(32)]))
        .await;
    assert_eq!(response["result"], Value::Null);

    server.stop().await;
}

#[tokio::test]
async fn test_scripthash_notification_on_new_history() {
    let scripthash = "11".repeat(32);
    let hashx = electrum_api::domain::scripthash_to_hashx(&scripthash).expect("valid scripthash");

    let server = TestServer::start(api_config(100)).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    let response = client
        .call("blockchain.scripthash.subscribe", json!([scripthash]))
        .await;
    assert_eq!(response["result"], Value::Null);

    // New confirmed history arrives and the height moves.
    server.mocks.db.put_history(
        hashx,
        vec![HistoryEntry {
            tx_hash: hex_to_hash(&"33".repeat(32)).expect("valid hash"),
            height: 1,
        }],
    );
    server
        .notifications
        .send(ChainNotification {
            height: 1,
            touched: Touched {
                hashxs: HashSet::from([hashx]),
                ..Touched::default()
            },
        })
        .await
        .expect("send notification");

    let notification = timeout(
        Duration::from_secs(5),
        client.next_notification("blockchain.scripthash.subscribe"),
    )
    .await
    .expect("notification before timeout");

    let expected = status_hash(&format!("{}:1:", "33".repeat(32)));
    assert_eq!(notification["params"], json!([scripthash, expected]));

    server.stop().await;
}

#[tokio::test]
async fn test_tsc_merkle_single_transaction_block() {
    let display_hash = "aa".repeat(32);
    let internal = hex_to_hash(&display_hash).expect("valid hash");

    let mocks = Mocks::default();
    mocks.db.put_tx_hashes(5, vec![internal]);
    let mut header = vec![0u8; 80];
    header[36..68].copy_from_slice(internal.as_ref());
    mocks.db.put_header(5, header);

    let server = TestServer::start_with_mocks(api_config(100), mocks).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    let response = client
        .call(
            "blockchain.transaction.get_tsc_merkle",
            json!([display_hash, 5, "txid", "merkle_root"]),
        )
        .await;

    let result = &response["result"];
    assert_eq!(result["nodes"], json!([]));
    assert_eq!(result["target"], json!(display_hash));
    assert_eq!(result["index"], json!(0));
    assert_eq!(result["txOrId"], json!(display_hash));
    assert_eq!(result["proofType"], json!("branch"));

    server.stop().await;
}

#[tokio::test]
async fn test_stale_session_is_disconnected() {
    let mut config = api_config(100);
    config.session_timeout = Duration::from_secs(1);

    let server = TestServer::start(config).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    // The client never sends anything, so the reaper cuts it off.
    let closed = timeout(Duration::from_secs(10), client.closed())
        .await
        .expect("server closes the connection");
    assert!(closed);

    server.stop().await;
}

#[tokio::test]
async fn test_estimatefee_single_flight() {
    let mocks = Mocks::default();
    *mocks.daemon.0.fee_delay.lock() = Duration::from_millis(50);
    mocks.bp.set_tip(BlockHash::from([0x77; 32]));

    let manager = TestManager::new(
        application_config(),
        api_config(100),
        mocks.db.clone(),
        mocks.mempool.clone(),
        mocks.daemon.clone(),
        mocks.peers.clone(),
        mocks.bp.clone(),
        Event::new(),
    )
    .expect("create session manager");

    let calls = (0..5).map(|_| manager.estimate_fee(6, Some("ECONOMICAL")));
    let results = futures::future::join_all(calls).await;

    let feerates = results
        .into_iter()
        .map(|result| result.expect("estimate fee").0)
        .collect::<Vec<_>>();
    assert!(feerates.iter().all(|feerate| *feerate == feerates[0]));
    assert_eq!(mocks.daemon.0.estimate_fee_calls.load(Ordering::Relaxed), 1);

    // A new tip triggers recomputation.
    mocks.bp.set_tip(BlockHash::from([0x78; 32]));
    manager
        .estimate_fee(6, Some("ECONOMICAL"))
        .await
        .expect("estimate fee");
    assert_eq!(mocks.daemon.0.estimate_fee_calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_history_cache_error_stickiness() {
    let mut config = api_config(100);
    // A tiny response budget: the history limit becomes max_send / 99.
    config.max_send = 350_000;

    let hashx = HashX::from([0x11; 11]);
    let oversized = (0..(350_000 / 99))
        .map(|height| HistoryEntry {
            tx_hash: TxHash::from([0x11; 32]),
            height: height as u32,
        })
        .collect::<Vec<_>>();

    let mocks = Mocks::default();
    mocks.db.put_history(hashx, oversized);

    let manager = TestManager::new(
        application_config(),
        config,
        mocks.db.clone(),
        mocks.mempool.clone(),
        mocks.daemon.clone(),
        mocks.peers.clone(),
        mocks.bp.clone(),
        Event::new(),
    )
    .expect("create session manager");

    let error = manager.limited_history(hashx).await.expect_err("too large");
    assert_eq!(error.message, "history too large");

    // Shrinking the underlying history does not help until invalidation:
    // the error is cached.
    mocks.db.put_history(hashx, Vec::new());
    let error = manager.limited_history(hashx).await.expect_err("sticky");
    assert_eq!(error.message, "history too large");
}

#[tokio::test]
async fn test_rpc_commands_and_group_accounting() {
    let mut config = api_config(100);
    config.cost_soft_limit = 1000.0;
    config.cost_hard_limit = 10_000.0;

    let server = TestServer::start(config).await;

    let mut tcp_client = TestClient::connect(server.tcp_addr().await).await;
    let response = tcp_client.call("server.ping", json!([])).await;
    assert_eq!(response["result"], Value::Null);

    let mut rpc_client = TestClient::connect(server.rpc_addr().await).await;

    let info = rpc_client.call("getinfo", json!([])).await;
    assert_eq!(info["result"]["coin"], json!("Evrmore"));
    assert_eq!(info["result"]["sessions"]["count"], json!(2));

    // One timeslice group holding both sessions.
    let groups = rpc_client.call("groups", json!([])).await;
    let rows = groups["result"].as_array().expect("group rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], json!("t0"));
    assert_eq!(rows[0][1], json!(2));

    // Find the TCP session and disconnect it by id.
    let sessions = rpc_client.call("sessions", json!([])).await;
    let tcp_row = sessions["result"]
        .as_array()
        .expect("session rows")
        .iter()
        .find(|row| row[1].as_str().is_some_and(|flags| flags.starts_with('T')))
        .expect("tcp session row")
        .clone();
    let tcp_id = tcp_row[0].as_u64().expect("session id");

    let disconnected = rpc_client
        .call("disconnect", json!([[tcp_id.to_string()]]))
        .await;
    assert_eq!(
        disconnected["result"],
        json!([format!("disconnecting session {tcp_id}")])
    );
    assert!(
        timeout(Duration::from_secs(5), tcp_client.closed())
            .await
            .expect("tcp session closed")
    );

    // The departed session's cost is retained by its groups.
    wait_until("session removed", async || {
        server.manager.session_count() == 1
    })
    .await;
    let groups = rpc_client.call("groups", json!([])).await;
    let rows = groups["result"].as_array().expect("group rows");
    assert_eq!(rows[0][1], json!(1));
    assert!(rows[0][3].as_f64().expect("retained cost") > 0.0);

    server.stop().await;
}

#[tokio::test]
async fn test_server_version_negotiation() {
    let server = TestServer::start(api_config(100)).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    let response = client
        .call("server.version", json!(["test client", "1.10"]))
        .await;
    let result = response["result"].as_array().expect("version pair");
    assert!(
        result[0]
            .as_str()
            .expect("server id")
            .starts_with("corvid-indexer")
    );
    assert_eq!(result[1], json!("1.10"));

    // Only once per session.
    let response = client
        .call("server.version", json!(["test client", "1.10"]))
        .await;
    assert_eq!(response["error"]["code"], json!(1));
    assert_eq!(
        response["error"]["message"],
        json!("server.version already sent")
    );

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_method_and_batch() {
    let server = TestServer::start(api_config(100)).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    let response = client.call("no.such.method", json!([])).await;
    assert_eq!(response["error"]["code"], json!(-32601));

    // A batch produces one array response in order.
    client
        .send_raw(
            &json!([
                { "jsonrpc": "2.0", "id": 101, "method": "server.ping", "params": [] },
                { "jsonrpc": "2.0", "id": 102, "method": "server.donation_address", "params": [] },
            ])
            .to_string(),
        )
        .await;
    let batch = client.read_message().await;
    let responses = batch.as_array().expect("batch response");
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0]["id"], json!(101));
    assert_eq!(responses[1]["id"], json!(102));

    server.stop().await;
}

#[tokio::test]
async fn test_block_header_roundtrip() {
    let mocks = Mocks::default();
    let mut header = vec![0u8; 80];
    header[0] = 0x01;
    mocks.db.put_header(7, header.clone());
    mocks.db.set_height(7);

    let server = TestServer::start_with_mocks(api_config(100), mocks).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    let response = client.call("blockchain.block.header", json!([7])).await;
    assert_eq!(response["result"], json!(const_hex::encode(&header)));

    // Out of range heights are refused, not crashed on.
    let response = client.call("blockchain.block.header", json!([1000])).await;
    assert_eq!(response["error"]["code"], json!(1));

    server.stop().await;
}

#[tokio::test]
async fn test_headers_subscription_notified_on_height_change() {
    let mocks = Mocks::default();
    mocks.db.put_header(1, vec![1u8; 80]);

    let server = TestServer::start_with_mocks(api_config(100), mocks).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    let response = client
        .call("blockchain.headers.subscribe", json!([]))
        .await;
    assert_eq!(response["result"]["height"], json!(0));

    server.mocks.db.set_height(1);
    server
        .notifications
        .send(ChainNotification {
            height: 1,
            touched: Touched::default(),
        })
        .await
        .expect("send notification");

    let notification = timeout(
        Duration::from_secs(5),
        client.next_notification("blockchain.headers.subscribe"),
    )
    .await
    .expect("header notification");
    assert_eq!(notification["params"][0]["height"], json!(1));
    assert_eq!(
        notification["params"][0]["hex"],
        json!(const_hex::encode([1u8; 80]))
    );

    server.stop().await;
}

#[tokio::test]
async fn test_transaction_merkle_uses_display_hashes() {
    let tx_a = hex_to_hash(&"aa".repeat(32)).expect("valid hash");
    let tx_b = hex_to_hash(&"bb".repeat(32)).expect("valid hash");

    let mocks = Mocks::default();
    mocks.db.put_tx_hashes(3, vec![tx_a, tx_b]);

    let server = TestServer::start_with_mocks(api_config(100), mocks).await;
    let mut client = TestClient::connect(server.tcp_addr().await).await;

    let response = client
        .call(
            "blockchain.transaction.get_merkle",
            json!(["bb".repeat(32), 3]),
        )
        .await;
    assert_eq!(response["result"]["pos"], json!(1));
    assert_eq!(response["result"]["block_height"], json!(3));
    assert_eq!(response["result"]["merkle"], json!([hash_to_hex(&tx_a)]));

    // A hash missing from the block is a client error.
    let response = client
        .call(
            "blockchain.transaction.get_merkle",
            json!(["cc".repeat(32), 3]),
        )
        .await;
    assert_eq!(response["error"]["code"], json!(1));

    server.stop().await;
}
