// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! In-memory collaborators and a line-based test client for exercising the
//! session layer end to end.

use electrum_api::{
    application,
    domain::{
        AssetFilter, AssetMeta, AssetMetaEvent, AssociationEvent, BroadcastMessage,
        ChainNotification, FrozenEntry, H160Qualification, Height, HistoryEntry, MempoolReissue,
        MempoolSummary, Qualification, QualifierAssociation, QualifierQualification, Utxo,
        VerifierString,
        chain::{BlockProcessor, PeerError, PeerManager},
        daemon::{Daemon, DaemonError, NetworkInfo},
        mempool::Mempool,
        storage::{Db, DbError, MerkleNode},
    },
    infra::api::{Config, manager::SessionManager},
};
use indexer_common::domain::{BlockHash, ByteArray, ByteVec, Event, H160, HashX, MerkleRoot, TxHash};
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::sleep,
};

pub type TestManager = SessionManager<MockDb, MockMempool, MockDaemon, MockPeers, MockBp>;

// --- Database

#[derive(Default)]
pub struct MockDbInner {
    pub height: AtomicU32,
    pub flush_count: AtomicU64,
    pub headers: parking_lot::Mutex<HashMap<Height, Vec<u8>>>,
    pub histories: parking_lot::Mutex<HashMap<HashX, Vec<HistoryEntry>>>,
    pub utxos: parking_lot::Mutex<HashMap<HashX, Vec<Utxo>>>,
    pub tx_hashes: parking_lot::Mutex<HashMap<Height, Vec<TxHash>>>,
    pub tx_hashes_calls: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MockDb(pub Arc<MockDbInner>);

impl MockDb {
    pub fn set_height(&self, height: Height) {
        self.0.height.store(height, Ordering::Relaxed);
    }

    pub fn put_header(&self, height: Height, header: Vec<u8>) {
        self.0.headers.lock().insert(height, header);
    }

    pub fn put_history(&self, hashx: HashX, history: Vec<HistoryEntry>) {
        self.0.histories.lock().insert(hashx, history);
    }

    pub fn put_tx_hashes(&self, height: Height, tx_hashes: Vec<TxHash>) {
        self.0.tx_hashes.lock().insert(height, tx_hashes);
    }
}

impl Db for MockDb {
    fn height(&self) -> Height {
        self.0.height.load(Ordering::Relaxed)
    }

    fn flush_count(&self) -> u64 {
        self.0.flush_count.load(Ordering::Relaxed)
    }

    async fn raw_header(&self, height: Height) -> Result<Option<ByteVec>, DbError> {
        Ok(self.0.headers.lock().get(&height).cloned().map(ByteVec))
    }

    async fn read_headers(&self, start: Height, count: usize) -> Result<(ByteVec, usize), DbError> {
        let headers = self.0.headers.lock();
        let mut concatenated = Vec::new();
        let mut read = 0;
        for height in start.. {
            if read == count {
                break;
            }
            match headers.get(&height) {
                Some(header) => {
                    concatenated.extend_from_slice(header);
                    read += 1;
                }
                None => break,
            }
        }
        Ok((ByteVec(concatenated), read))
    }

    async fn header_branch_and_root(
        &self,
        _length: usize,
        height: Height,
    ) -> Result<(Vec<ByteArray<32>>, MerkleRoot), DbError> {
        let header = self
            .0
            .headers
            .lock()
            .get(&height)
            .cloned()
            .ok_or_else(|| DbError("no header".to_string()))?;
        let root = MerkleRoot::try_from(&header[36..68]).expect("header has a merkle root");
        Ok((Vec::new(), root))
    }

    async fn tx_hashes_at_blockheight(&self, height: Height) -> Result<Vec<TxHash>, DbError> {
        self.0.tx_hashes_calls.fetch_add(1, Ordering::Relaxed);
        self.0
            .tx_hashes
            .lock()
            .get(&height)
            .cloned()
            .ok_or_else(|| DbError(format!("no block at height {height}")))
    }

    async fn merkle_branch_and_root(
        &self,
        tx_hashes: &[TxHash],
        tx_pos: usize,
        _tsc_format: bool,
    ) -> Result<(Vec<MerkleNode>, MerkleRoot), DbError> {
        // A fake tree good enough for tests: the branch is every other
        // hash, the root is the first hash.
        let branch = tx_hashes
            .iter()
            .enumerate()
            .filter(|(pos, _)| *pos != tx_pos)
            .map(|(_, hash)| MerkleNode::Hash(*hash))
            .collect();
        let root = tx_hashes
            .first()
            .map(|hash| MerkleRoot::from(*hash.as_bytes()))
            .unwrap_or_default();
        Ok((branch, root))
    }

    async fn limited_history(
        &self,
        hashx: HashX,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, DbError> {
        let mut history = self.0.histories.lock().get(&hashx).cloned().unwrap_or_default();
        history.truncate(limit);
        Ok(history)
    }

    async fn all_utxos(&self, hashx: HashX, _filter: &AssetFilter) -> Result<Vec<Utxo>, DbError> {
        Ok(self.0.utxos.lock().get(&hashx).cloned().unwrap_or_default())
    }

    async fn lookup_asset_meta(&self, _asset: &str) -> Result<Option<AssetMeta>, DbError> {
        Ok(None)
    }

    async fn lookup_asset_meta_history(
        &self,
        _asset: &str,
    ) -> Result<Vec<AssetMetaEvent>, DbError> {
        Ok(Vec::new())
    }

    async fn assets_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, DbError> {
        Ok(Vec::new())
    }

    async fn lookup_messages(&self, _asset: &str) -> Result<Vec<BroadcastMessage>, DbError> {
        Ok(Vec::new())
    }

    async fn qualifications_for_qualifier(
        &self,
        _asset: &str,
    ) -> Result<BTreeMap<String, Qualification>, DbError> {
        Ok(BTreeMap::new())
    }

    async fn qualifications_for_qualifier_history(
        &self,
        _asset: &str,
    ) -> Result<Vec<QualifierQualification>, DbError> {
        Ok(Vec::new())
    }

    async fn qualifications_for_h160(
        &self,
        _h160: H160,
    ) -> Result<BTreeMap<String, Qualification>, DbError> {
        Ok(BTreeMap::new())
    }

    async fn qualifications_for_h160_history(
        &self,
        _h160: H160,
    ) -> Result<Vec<H160Qualification>, DbError> {
        Ok(Vec::new())
    }

    async fn is_h160_qualified(&self, _h160: H160, _asset: &str) -> Result<bool, DbError> {
        Ok(false)
    }

    async fn is_restricted_frozen(&self, _asset: &str) -> Result<Option<FrozenEntry>, DbError> {
        Ok(None)
    }

    async fn restricted_frozen_history(&self, _asset: &str) -> Result<Vec<FrozenEntry>, DbError> {
        Ok(Vec::new())
    }

    async fn restricted_string(&self, _asset: &str) -> Result<Option<VerifierString>, DbError> {
        Ok(None)
    }

    async fn restricted_string_history(
        &self,
        _asset: &str,
    ) -> Result<Vec<VerifierString>, DbError> {
        Ok(Vec::new())
    }

    async fn qualifier_associations(
        &self,
        _qualifier: &str,
    ) -> Result<BTreeMap<String, QualifierAssociation>, DbError> {
        Ok(BTreeMap::new())
    }

    async fn qualifier_associations_history(
        &self,
        _qualifier: &str,
    ) -> Result<Vec<AssociationEvent>, DbError> {
        Ok(Vec::new())
    }
}

// --- Mempool

#[derive(Default)]
pub struct MockMempoolInner {
    pub summaries: parking_lot::Mutex<HashMap<HashX, Vec<MempoolSummary>>>,
}

#[derive(Clone, Default)]
pub struct MockMempool(pub Arc<MockMempoolInner>);

impl Mempool for MockMempool {
    async fn transaction_summaries(&self, hashx: HashX) -> Vec<MempoolSummary> {
        self.0.summaries.lock().get(&hashx).cloned().unwrap_or_default()
    }

    async fn unordered_utxos(&self, _hashx: HashX, _filter: &AssetFilter) -> Vec<Utxo> {
        Vec::new()
    }

    async fn potential_spends(&self, _hashx: HashX) -> HashSet<(TxHash, u32)> {
        HashSet::new()
    }

    async fn balance_delta(
        &self,
        _hashx: HashX,
        _filter: &AssetFilter,
    ) -> HashMap<Option<String>, i64> {
        HashMap::new()
    }

    async fn asset_creation_if_any(&self, _asset: &str) -> Option<AssetMeta> {
        None
    }

    async fn asset_reissues_if_any(&self, _asset: &str) -> Option<MempoolReissue> {
        None
    }

    async fn broadcasts(&self, _asset: &str) -> Vec<BroadcastMessage> {
        Vec::new()
    }

    async fn h160_tags(&self, _h160: H160) -> BTreeMap<String, Qualification> {
        BTreeMap::new()
    }

    async fn qualifier_tags(&self, _qualifier: &str) -> BTreeMap<String, Qualification> {
        BTreeMap::new()
    }

    async fn is_frozen(&self, _asset: &str) -> Option<FrozenEntry> {
        None
    }

    async fn restricted_verifier(&self, _asset: &str) -> Option<VerifierString> {
        None
    }

    async fn restricted_assets_associated_with_qualifier(
        &self,
        _qualifier: &str,
    ) -> BTreeMap<String, QualifierAssociation> {
        BTreeMap::new()
    }

    async fn compact_fee_histogram(&self) -> Vec<(f64, u64)> {
        Vec::new()
    }
}

// --- Daemon

pub struct MockDaemonInner {
    pub estimate_fee_calls: AtomicU64,
    pub feerate: parking_lot::Mutex<Option<f64>>,
    pub fee_delay: parking_lot::Mutex<Duration>,
}

impl Default for MockDaemonInner {
    fn default() -> Self {
        Self {
            estimate_fee_calls: AtomicU64::new(0),
            feerate: parking_lot::Mutex::new(Some(0.0001)),
            fee_delay: parking_lot::Mutex::new(Duration::ZERO),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockDaemon(pub Arc<MockDaemonInner>);

impl Daemon for MockDaemon {
    async fn get_raw_transaction(
        &self,
        tx_hash: &str,
        _verbose: bool,
    ) -> Result<Value, DaemonError> {
        Ok(json!(format!("raw:{tx_hash}")))
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, DaemonError> {
        Ok(NetworkInfo {
            version: 1_020_300,
            subversion: "/MockDaemon:1.2.3/".to_string(),
            relayfee: 0.00001,
        })
    }

    async fn estimate_smart_fee(
        &self,
        _number: u32,
        _mode: Option<&str>,
    ) -> Result<Option<f64>, DaemonError> {
        self.0.estimate_fee_calls.fetch_add(1, Ordering::Relaxed);
        let delay = *self.0.fee_delay.lock();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        Ok(*self.0.feerate.lock())
    }

    async fn broadcast_transaction(&self, _raw_tx: &[u8]) -> Result<String, DaemonError> {
        Ok("00".repeat(32))
    }

    async fn list_addresses_by_asset(
        &self,
        _asset: &str,
        _only_total: bool,
        _count: u32,
        _start: u32,
    ) -> Result<Value, DaemonError> {
        Ok(json!({}))
    }

    fn cached_height(&self) -> Height {
        0
    }

    fn logged_url(&self) -> String {
        "mock://daemon".to_string()
    }

    fn set_url(&self, _url: &str) -> Result<(), DaemonError> {
        Ok(())
    }
}

// --- Peers

#[derive(Clone, Default)]
pub struct MockPeers;

impl PeerManager for MockPeers {
    async fn discover_peers(&self) {
        std::future::pending::<()>().await;
    }

    async fn add_local_rpc_peer(&self, _real_name: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn on_add_peer(&self, _features: Value, _remote: SocketAddr) -> bool {
        true
    }

    fn on_peers_subscribe(&self, _is_tor: bool) -> Vec<Value> {
        Vec::new()
    }

    fn proxy_address(&self) -> Option<IpAddr> {
        None
    }

    fn info(&self) -> Value {
        json!("0 peers")
    }

    fn rpc_data(&self) -> Value {
        json!([])
    }

    fn send_topic_updates(&self, _topic: &str, _payload: &str) {}
}

// --- Block processor

#[derive(Default)]
pub struct MockBpInner {
    pub tip: parking_lot::Mutex<BlockHash>,
    pub backed_up: Notify,
}

#[derive(Clone, Default)]
pub struct MockBp(pub Arc<MockBpInner>);

impl MockBp {
    pub fn set_tip(&self, tip: BlockHash) {
        *self.0.tip.lock() = tip;
    }

    pub fn signal_backed_up(&self) {
        self.0.backed_up.notify_waiters();
    }
}

impl BlockProcessor for MockBp {
    fn tip(&self) -> BlockHash {
        *self.0.tip.lock()
    }

    async fn backed_up(&self) {
        self.0.backed_up.notified().await;
    }

    fn force_chain_reorg(&self, _count: u32) -> bool {
        true
    }
}

// --- Server harness

pub struct Mocks {
    pub db: MockDb,
    pub mempool: MockMempool,
    pub daemon: MockDaemon,
    pub peers: MockPeers,
    pub bp: MockBp,
}

impl Default for Mocks {
    fn default() -> Self {
        let db = MockDb::default();
        // A genesis header so header subscription results can initialize.
        db.put_header(0, vec![0u8; 80]);

        Self {
            db,
            mempool: MockMempool::default(),
            daemon: MockDaemon::default(),
            peers: MockPeers,
            bp: MockBp::default(),
        }
    }
}

pub fn application_config() -> application::Config {
    application::Config {
        coin: "Evrmore".to_string(),
        ticker: "evr".to_string(),
        genesis_hash: "00".repeat(32),
    }
}

pub fn api_config(max_sessions: usize) -> Config {
    Config {
        services: vec![
            "tcp://127.0.0.1:0".parse().expect("valid service"),
            "rpc://127.0.0.1:0".parse().expect("valid service"),
        ],
        report_services: Vec::new(),
        ssl_certfile: None,
        ssl_keyfile: None,
        max_sessions,
        session_timeout: Duration::from_secs(600),
        max_recv: 1_000_000,
        max_send: 1_000_000,
        cost_soft_limit: 100_000.0,
        cost_hard_limit: 1_000_000.0,
        bw_unit_cost: 5000,
        initial_concurrent: 10,
        request_sleep: Duration::from_millis(0),
        request_timeout: Duration::from_secs(30),
        log_sessions: None,
        drop_client: None,
        anon_logs: false,
        donation_address: String::new(),
        banner_file: None,
        tor_banner_file: None,
    }
}

pub struct TestServer {
    pub manager: Arc<TestManager>,
    pub mocks: Mocks,
    pub notifications: mpsc::Sender<ChainNotification>,
    pub shutdown: Event,
    serve: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(config: Config) -> Self {
        Self::start_with_mocks(config, Mocks::default()).await
    }

    pub async fn start_with_mocks(config: Config, mocks: Mocks) -> Self {
        let shutdown = Event::new();
        let manager = TestManager::new(
            application_config(),
            config,
            mocks.db.clone(),
            mocks.mempool.clone(),
            mocks.daemon.clone(),
            mocks.peers.clone(),
            mocks.bp.clone(),
            shutdown.clone(),
        )
        .expect("create session manager");

        let ready = Event::new();
        ready.set();

        let (notifications, notifications_rx) = mpsc::channel(16);
        let serve = tokio::spawn(manager.clone().serve(notifications_rx, ready));
        manager.server_listening().wait().await;

        Self {
            manager,
            mocks,
            notifications,
            shutdown,
            serve,
        }
    }

    pub async fn tcp_addr(&self) -> SocketAddr {
        self.manager
            .local_addr(electrum_api::infra::api::ServiceProtocol::Tcp)
            .await
            .expect("tcp listener is running")
    }

    pub async fn rpc_addr(&self) -> SocketAddr {
        self.manager
            .local_addr(electrum_api::infra::api::ServiceProtocol::Rpc)
            .await
            .expect("rpc listener is running")
    }

    pub async fn stop(self) {
        self.shutdown.set();
        let _ = self.serve.await;
    }
}

// --- Client

pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
            next_id: 0,
        }
    }

    pub async fn send_raw(&mut self, payload: &str) {
        self.writer
            .write_all(payload.as_bytes())
            .await
            .expect("send");
        self.writer.write_all(b"\n").await.expect("send newline");
    }

    pub async fn read_message(&mut self) -> Value {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.expect("read line");
        assert!(read > 0, "connection closed");
        serde_json::from_str(&line).expect("valid JSON")
    }

    /// Send a request and await its response, skipping interleaved
    /// notifications.
    pub async fn call(&mut self, method: &str, params: Value) -> Value {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.send_raw(&request.to_string()).await;

        loop {
            let message = self.read_message().await;
            if message.get("id") == Some(&json!(id)) {
                return message;
            }
        }
    }

    /// Await a notification for the given method.
    pub async fn next_notification(&mut self, method: &str) -> Value {
        loop {
            let message = self.read_message().await;
            if message.get("method") == Some(&json!(method)) {
                return message;
            }
        }
    }

    /// True when the server has closed the connection.
    pub async fn closed(&mut self) -> bool {
        let mut line = String::new();
        matches!(self.reader.read_line(&mut line).await, Ok(0))
    }
}
