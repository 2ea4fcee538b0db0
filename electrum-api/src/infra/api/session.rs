// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! One session per live connection. A session owns its subscription sets,
//! its cost state and its request-handler table; the handler implementations
//! live in the sibling `blockchain`, `assets` and `server` modules.

use crate::{
    domain::{
        Touched,
        chain::{BlockProcessor, PeerManager},
        cost::{Concurrency, CostTracker, concurrency_target, throttle_sleep},
        daemon::Daemon,
        mempool::Mempool,
        storage::Db,
    },
    infra::api::{
        ServiceProtocol,
        jsonrpc::{
            self, HandlerError, HandlerResult, Incoming, Params, ProtocolVersion, RpcCall,
            RpcError,
        },
        listener::{ReadEvent, SessionReader, SessionWriter, TransportError},
        manager::SessionManager,
    },
};
use indexer_common::domain::HashX;
use log::{debug, info};
use serde_json::{Value, json};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{select, task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;

pub const PROTOCOL_MIN: ProtocolVersion = ProtocolVersion(1, 4);
pub const PROTOCOL_MAX: ProtocolVersion = ProtocolVersion(1, 11);
pub const PROTOCOL_BAD: [ProtocolVersion; 1] = [ProtocolVersion(1, 9)];

/// Maximum number of headers served by one `block.headers` call.
pub const MAX_CHUNK_SIZE: usize = 2016;

pub fn server_version() -> String {
    format!("corvid-indexer {}", server_version_short())
}

pub fn server_version_short() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Session parameters published once at serve time, shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub cost_soft_limit: f64,
    pub cost_hard_limit: f64,
    pub cost_decay_per_sec: f64,
    pub bw_cost_per_byte: f64,
    pub cost_sleep: Duration,
    pub initial_concurrent: u32,
    pub request_timeout: Duration,
    pub log_new: bool,
}

impl SessionSettings {
    pub fn from_config(config: &crate::infra::api::Config) -> Self {
        Self {
            cost_soft_limit: config.cost_soft_limit,
            cost_hard_limit: config.cost_hard_limit,
            cost_decay_per_sec: config.cost_hard_limit / 10_000.0,
            bw_cost_per_byte: 1.0 / config.bw_unit_cost as f64,
            cost_sleep: config.request_sleep,
            initial_concurrent: config.initial_concurrent,
            request_timeout: config.request_timeout,
            log_new: false,
        }
    }
}

/// Request handlers, dispatched by method name through the table installed
/// for the session kind and negotiated protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    // Blockchain
    BlockHeader,
    BlockHeaders,
    EstimateFee,
    HeadersSubscribe,
    RelayFee,
    ScripthashGetBalance,
    ScripthashGetHistory,
    ScripthashGetMempool,
    ScripthashListUnspent,
    ScripthashSubscribe,
    ScripthashUnsubscribe,
    TransactionBroadcast,
    TransactionGet,
    TransactionMerkle,
    TransactionTscMerkle,
    TransactionIdFromPos,
    FeeHistogram,
    // Server
    AddPeer,
    Banner,
    DonationAddress,
    Features,
    PeersSubscribe,
    Ping,
    Version,
    TopicUpdate,
    // Assets, tags, restricted assets
    AssetGetMeta,
    AssetGetMetaHistory,
    AssetSubscribe,
    AssetUnsubscribe,
    AssetsWithPrefix,
    ListAddressesByAsset,
    GetMessages,
    IsQualified,
    QualificationsForQualifier,
    QualificationsForQualifierHistory,
    QualificationsForH160,
    QualificationsForH160History,
    IsRestrictedFrozen,
    RestrictedFrozenHistory,
    GetRestrictedString,
    GetRestrictedStringHistory,
    QualifierAssociations,
    QualifierAssociationsHistory,
    QualifierTagSubscribe,
    QualifierTagUnsubscribe,
    H160TagSubscribe,
    H160TagUnsubscribe,
    BroadcastsSubscribe,
    BroadcastsUnsubscribe,
    FrozenSubscribe,
    FrozenUnsubscribe,
    VerifierSubscribe,
    VerifierUnsubscribe,
    AssociationsSubscribe,
    AssociationsUnsubscribe,
    // Operator commands
    RpcAddPeer,
    RpcDaemonUrl,
    RpcDisconnect,
    RpcGetInfo,
    RpcGroups,
    RpcLog,
    RpcPeers,
    RpcQuery,
    RpcReorg,
    RpcSessions,
    RpcStop,
}

pub type HandlerTable = HashMap<&'static str, Handler>;

/// The electrum handler table: the base set extended by the 1.11 and 1.12
/// method families, later entries overlaying earlier ones.
pub fn electrum_handlers() -> HandlerTable {
    let mut handlers = HandlerTable::from([
        ("blockchain.block.header", Handler::BlockHeader),
        ("blockchain.block.headers", Handler::BlockHeaders),
        ("blockchain.estimatefee", Handler::EstimateFee),
        ("blockchain.headers.subscribe", Handler::HeadersSubscribe),
        ("blockchain.relayfee", Handler::RelayFee),
        (
            "blockchain.scripthash.get_balance",
            Handler::ScripthashGetBalance,
        ),
        (
            "blockchain.scripthash.get_history",
            Handler::ScripthashGetHistory,
        ),
        (
            "blockchain.scripthash.get_mempool",
            Handler::ScripthashGetMempool,
        ),
        (
            "blockchain.scripthash.listunspent",
            Handler::ScripthashListUnspent,
        ),
        ("blockchain.scripthash.subscribe", Handler::ScripthashSubscribe),
        (
            "blockchain.scripthash.unsubscribe",
            Handler::ScripthashUnsubscribe,
        ),
        ("blockchain.transaction.broadcast", Handler::TransactionBroadcast),
        ("blockchain.transaction.get", Handler::TransactionGet),
        ("blockchain.transaction.get_merkle", Handler::TransactionMerkle),
        (
            "blockchain.transaction.get_tsc_merkle",
            Handler::TransactionTscMerkle,
        ),
        (
            "blockchain.transaction.id_from_pos",
            Handler::TransactionIdFromPos,
        ),
        ("mempool.get_fee_histogram", Handler::FeeHistogram),
        ("server.add_peer", Handler::AddPeer),
        ("server.banner", Handler::Banner),
        ("server.donation_address", Handler::DonationAddress),
        ("server.features", Handler::Features),
        ("server.peers.subscribe", Handler::PeersSubscribe),
        ("server.ping", Handler::Ping),
        ("server.version", Handler::Version),
        ("blockchain.asset.subscribe", Handler::AssetSubscribe),
        ("blockchain.asset.unsubscribe", Handler::AssetUnsubscribe),
        ("blockchain.asset.check_tag", Handler::IsQualified),
        ("blockchain.asset.all_tags", Handler::QualificationsForH160),
        ("blockchain.asset.is_frozen", Handler::IsRestrictedFrozen),
        ("blockchain.asset.validator_string", Handler::GetRestrictedString),
        (
            "blockchain.asset.restricted_associations",
            Handler::QualifierAssociations,
        ),
        ("blockchain.asset.broadcasts", Handler::GetMessages),
        (
            "blockchain.asset.get_assets_with_prefix",
            Handler::AssetsWithPrefix,
        ),
        (
            "blockchain.asset.list_addresses_by_asset",
            Handler::ListAddressesByAsset,
        ),
        ("blockchain.asset.get_meta", Handler::AssetGetMeta),
    ]);

    // 1.11
    handlers.extend([
        (
            "blockchain.asset.verifier_string",
            Handler::GetRestrictedString,
        ),
        ("blockchain.tag.check", Handler::IsQualified),
        (
            "blockchain.tag.qualifier.list",
            Handler::QualificationsForQualifier,
        ),
        ("blockchain.tag.h160.list", Handler::QualificationsForH160),
        (
            "blockchain.tag.qualifier.subscribe",
            Handler::QualifierTagSubscribe,
        ),
        (
            "blockchain.tag.qualifier.unsubscribe",
            Handler::QualifierTagUnsubscribe,
        ),
        ("blockchain.tag.h160.subscribe", Handler::H160TagSubscribe),
        ("blockchain.tag.h160.unsubscribe", Handler::H160TagUnsubscribe),
        (
            "blockchain.asset.broadcasts.subscribe",
            Handler::BroadcastsSubscribe,
        ),
        (
            "blockchain.asset.broadcasts.unsubscribe",
            Handler::BroadcastsUnsubscribe,
        ),
        ("blockchain.asset.is_frozen.subscribe", Handler::FrozenSubscribe),
        (
            "blockchain.asset.is_frozen.unsubscribe",
            Handler::FrozenUnsubscribe,
        ),
        (
            "blockchain.asset.verifier_string.subscribe",
            Handler::VerifierSubscribe,
        ),
        (
            "blockchain.asset.verifier_string.unsubscribe",
            Handler::VerifierUnsubscribe,
        ),
        (
            "blockchain.asset.restricted_associations.subscribe",
            Handler::AssociationsSubscribe,
        ),
        (
            "blockchain.asset.restricted_associations.unsubscribe",
            Handler::AssociationsUnsubscribe,
        ),
    ]);

    // 1.12
    handlers.extend([
        ("blockchain.asset.get_meta_history", Handler::AssetGetMetaHistory),
        (
            "blockchain.asset.verifier_string_history",
            Handler::GetRestrictedStringHistory,
        ),
        (
            "blockchain.tag.qualifier.history",
            Handler::QualificationsForQualifierHistory,
        ),
        (
            "blockchain.tag.h160.history",
            Handler::QualificationsForH160History,
        ),
        (
            "blockchain.asset.frozen_history",
            Handler::RestrictedFrozenHistory,
        ),
        (
            "blockchain.asset.restricted_associations_history",
            Handler::QualifierAssociationsHistory,
        ),
    ]);

    handlers.extend([("topic.update", Handler::TopicUpdate)]);

    handlers
}

/// The operator command table for local RPC sessions.
pub fn rpc_handlers() -> HandlerTable {
    HandlerTable::from([
        ("add_peer", Handler::RpcAddPeer),
        ("daemon_url", Handler::RpcDaemonUrl),
        ("disconnect", Handler::RpcDisconnect),
        ("getinfo", Handler::RpcGetInfo),
        ("groups", Handler::RpcGroups),
        ("log", Handler::RpcLog),
        ("peers", Handler::RpcPeers),
        ("query", Handler::RpcQuery),
        ("reorg", Handler::RpcReorg),
        ("sessions", Handler::RpcSessions),
        ("stop", Handler::RpcStop),
    ])
}

/// Mutable session state. This is a leaf lock: never acquire any other lock
/// while holding it.
pub struct SessionState {
    pub client: String,
    pub sv_seen: bool,
    pub is_peer: bool,
    pub subscribe_headers: bool,
    pub protocol: ProtocolVersion,
    pub handlers: HandlerTable,
    pub cost: CostTracker,
    pub cost_decay_per_sec: f64,
    pub last_recalc_cost: f64,
    pub hashx_subs: HashMap<HashX, String>,
    pub mempool_statuses: HashMap<HashX, Option<String>>,
    pub asset_subs: HashSet<String>,
    pub qualifier_tag_subs: HashSet<String>,
    pub h160_tag_subs: HashSet<indexer_common::domain::H160>,
    pub broadcast_subs: HashSet<String>,
    pub frozen_subs: HashSet<String>,
    pub validator_subs: HashSet<String>,
    pub qualifier_validator_subs: HashSet<String>,
    pub topics: HashSet<String>,
}

pub struct Session<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    pub manager: Arc<SessionManager<D, M, R, P, B>>,
    id: u64,
    kind: ServiceProtocol,
    remote: SocketAddr,
    start_time: f64,
    max_response_size: usize,
    pub(crate) state: parking_lot::Mutex<SessionState>,
    pub(crate) concurrency: Concurrency,
    writer: tokio::sync::Mutex<SessionWriter>,
    close_token: CancellationToken,
    close_after_send: AtomicBool,
    task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    cost_bits: AtomicU64,
    last_recv_bits: AtomicU64,
    pub(crate) recv_count: AtomicU64,
    pub(crate) recv_size: AtomicU64,
    pub(crate) send_count: AtomicU64,
    pub(crate) send_size: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) txs_sent: AtomicU64,
    log_me: AtomicBool,
}

impl<D, M, R, P, B> Session<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    /// Create a session for an accepted connection, register it with the
    /// manager and start its read loop.
    pub fn spawn(
        manager: Arc<SessionManager<D, M, R, P, B>>,
        kind: ServiceProtocol,
        remote: SocketAddr,
        reader: SessionReader,
        writer: SessionWriter,
    ) -> Arc<Self> {
        let settings = manager.settings();
        let id = manager.assign_session_id();
        let is_rpc = kind.is_rpc();
        // Connection cost for external sessions.
        let initial_cost = if is_rpc { 0.0 } else { 5.0 };

        let state = SessionState {
            client: if is_rpc { "RPC" } else { "unknown" }.to_string(),
            sv_seen: false,
            is_peer: false,
            subscribe_headers: false,
            protocol: PROTOCOL_MIN,
            handlers: if is_rpc {
                rpc_handlers()
            } else {
                electrum_handlers()
            },
            cost: CostTracker::new(initial_cost),
            cost_decay_per_sec: settings.cost_decay_per_sec,
            last_recalc_cost: 0.0,
            hashx_subs: HashMap::new(),
            mempool_statuses: HashMap::new(),
            asset_subs: HashSet::new(),
            qualifier_tag_subs: HashSet::new(),
            h160_tag_subs: HashSet::new(),
            broadcast_subs: HashSet::new(),
            frozen_subs: HashSet::new(),
            validator_subs: HashSet::new(),
            qualifier_validator_subs: HashSet::new(),
            topics: HashSet::new(),
        };

        let now = unix_time();
        let session = Arc::new(Self {
            manager: manager.clone(),
            id,
            kind,
            remote,
            start_time: now,
            max_response_size: if is_rpc { 0 } else { manager.max_send() },
            state: parking_lot::Mutex::new(state),
            concurrency: Concurrency::new(settings.initial_concurrent),
            writer: tokio::sync::Mutex::new(writer),
            close_token: CancellationToken::new(),
            close_after_send: AtomicBool::new(false),
            task: parking_lot::Mutex::new(None),
            cost_bits: AtomicU64::new(initial_cost.to_bits()),
            last_recv_bits: AtomicU64::new(now.to_bits()),
            recv_count: AtomicU64::new(0),
            recv_size: AtomicU64::new(0),
            send_count: AtomicU64::new(0),
            send_size: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            txs_sent: AtomicU64::new(0),
            log_me: AtomicBool::new(settings.log_new),
        });

        info!(
            conn_id = id;
            "{} {}, {} total",
            kind.kind(),
            session.remote_address_string(true),
            manager.session_count() + 1
        );

        manager.add_session(&session);
        session.recalc_concurrency();

        let task = tokio::spawn({
            let session = session.clone();
            async move { session.run(reader).await }
        });
        *session.task.lock() = Some(task);

        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ServiceProtocol {
        self.kind
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn remote_address_string(&self, for_log: bool) -> String {
        SessionWriter::describe_peer(self.remote, for_log && self.manager.config().anon_logs)
    }

    pub fn last_recv(&self) -> f64 {
        f64::from_bits(self.last_recv_bits.load(Ordering::Relaxed))
    }

    pub fn log_me(&self) -> bool {
        self.log_me.load(Ordering::Relaxed)
    }

    pub fn set_log_me(&self, log_me: bool) {
        self.log_me.store(log_me, Ordering::Relaxed);
    }

    pub fn is_closing(&self) -> bool {
        self.close_token.is_cancelled()
    }

    /// Status flags: kind initial, C when closing, L when logged, then the
    /// concurrency target.
    pub fn flags(&self) -> String {
        let mut flags = self.kind.kind()[..1].to_string();
        if self.is_closing() {
            flags.push('C');
        }
        if self.log_me() {
            flags.push('L');
        }
        flags.push_str(&self.concurrency.target().to_string());
        flags
    }

    pub fn protocol_version_string(&self) -> String {
        if self.kind.is_rpc() {
            "RPC".to_string()
        } else {
            self.state.lock().protocol.to_string()
        }
    }

    pub fn client(&self) -> String {
        self.state.lock().client.clone()
    }

    pub fn sub_count(&self) -> usize {
        self.state.lock().hashx_subs.len()
    }

    pub fn unanswered_request_count(&self) -> u32 {
        self.concurrency.in_flight()
    }

    /// The session cost as of the last decay, readable without the state
    /// lock.
    pub fn cost(&self) -> f64 {
        f64::from_bits(self.cost_bits.load(Ordering::Relaxed))
    }

    pub fn extra_cost(&self) -> f64 {
        self.manager.extra_cost(self.id, self.cost())
    }

    pub fn bump_cost(&self, delta: f64) {
        let (cost, needs_recalc) = {
            let mut state = self.state.lock();
            state.cost.bump(delta);
            let cost_decay_per_sec = state.cost_decay_per_sec;
            let cost = state.cost.decay(cost_decay_per_sec);
            let needs_recalc = (cost - state.last_recalc_cost).abs()
                > self.manager.settings().cost_hard_limit / 100.0;
            (cost, needs_recalc)
        };
        self.cost_bits.store(cost.to_bits(), Ordering::Relaxed);

        if needs_recalc && let Some(session) = self.manager.session_by_id(self.id) {
            session.recalc_concurrency();
        }
    }

    pub fn set_cost_decay_per_sec(&self, decay_per_sec: f64) {
        self.state.lock().cost_decay_per_sec = decay_per_sec;
    }

    /// Derive the concurrency target from the current cost plus group cost;
    /// at the hard limit schedule a disconnect.
    pub fn recalc_concurrency(self: &Arc<Self>) {
        let cost = {
            let mut state = self.state.lock();
            let cost = state.cost.decay(state.cost_decay_per_sec);
            state.last_recalc_cost = cost;
            cost
        };
        self.cost_bits.store(cost.to_bits(), Ordering::Relaxed);

        let settings = self.manager.settings();
        let value = cost + self.extra_cost();

        match concurrency_target(
            value,
            settings.cost_soft_limit,
            settings.cost_hard_limit,
            settings.initial_concurrent,
        ) {
            Some(target) => self.concurrency.set_target(target),

            None => {
                self.on_disconnect_due_to_excessive_session_cost();
                let session = self.clone();
                tokio::spawn(async move { session.close(Duration::from_secs(1)).await });
            }
        }
    }

    fn on_disconnect_due_to_excessive_session_cost(&self) {
        let groups = self.manager.group_names_of(self.id);
        info!(
            conn_id = self.id;
            "closing session over res usage. ip: {}. groups: {groups:?}",
            self.remote.ip()
        );
    }

    fn throttle(&self) -> Duration {
        let settings = self.manager.settings();
        throttle_sleep(
            self.cost() + self.extra_cost(),
            settings.cost_soft_limit,
            settings.cost_hard_limit,
            settings.cost_sleep,
        )
    }

    /// Request a graceful close, aborting the session task after the given
    /// deadline.
    pub async fn close(&self, force_after: Duration) {
        self.close_token.cancel();

        let task = self.task.lock().take();
        if let Some(mut task) = task
            && timeout(force_after, &mut task).await.is_err()
        {
            task.abort();
        }
    }

    // --- Read loop

    async fn run(self: Arc<Self>, mut reader: SessionReader) {
        let mut in_flight = JoinSet::new();
        let mut clean_exit = true;

        loop {
            select! {
                _ = self.close_token.cancelled() => {
                    clean_exit = false;
                    break;
                }

                event = reader.next() => match event {
                    Ok(Some(ReadEvent::Message(payload))) => {
                        self.on_recv(&payload);

                        let permit = self.concurrency.acquire().await;
                        let throttle = self.throttle();
                        let session = self.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            if !throttle.is_zero() {
                                tokio::time::sleep(throttle).await;
                            }
                            session.process_payload(payload).await;
                        });
                    }

                    Ok(Some(ReadEvent::Ping(payload))) => {
                        let _ = self.writer.lock().await.pong(payload).await;
                    }

                    Ok(None) => break,

                    Err(TransportError::OversizedRequest) => {
                        info!(conn_id = self.id; "oversized request, closing session");
                        clean_exit = false;
                        break;
                    }

                    Err(error) => {
                        debug!(conn_id = self.id, error:%; "transport error");
                        clean_exit = false;
                        break;
                    }
                }
            }
        }

        if clean_exit {
            // Let in-flight requests finish before deregistering.
            while in_flight.join_next().await.is_some() {}
        } else {
            in_flight.shutdown().await;
        }

        self.writer.lock().await.shutdown().await;
        self.connection_lost();
    }

    fn on_recv(&self, payload: &str) {
        self.recv_count.fetch_add(1, Ordering::Relaxed);
        self.recv_size
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.last_recv_bits
            .store(unix_time().to_bits(), Ordering::Relaxed);
        self.bump_cost(payload.len() as f64 * self.manager.settings().bw_cost_per_byte);
    }

    fn connection_lost(&self) {
        self.manager.remove_session(self.id, self.cost());

        let mut msg = String::new();
        let initial = f64::from(self.manager.settings().initial_concurrent);
        if f64::from(self.concurrency.target()) < initial * 0.8 {
            msg.push_str(" whilst throttled");
        }
        let send_size = self.send_size.load(Ordering::Relaxed);
        if send_size >= 1_000_000 {
            msg.push_str(&format!(
                ".  Sent {send_size} bytes in {} messages",
                self.send_count.load(Ordering::Relaxed)
            ));
        }
        if !msg.is_empty() {
            info!(conn_id = self.id; "disconnected{msg}");
        }
    }

    // --- Request processing

    async fn process_payload(self: &Arc<Self>, payload: String) {
        match Incoming::parse(&payload) {
            Err(error) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.send_json(jsonrpc::error_response(&Value::Null, &error))
                    .await;
            }

            Ok(Incoming::Single(call)) => {
                if let Some(response) = self.process_call(call).await {
                    self.send_json(response).await;
                }
            }

            Ok(Incoming::Batch(calls)) => {
                let mut responses = Vec::new();
                for call in calls {
                    if let Some(response) = self.process_call(call).await {
                        responses.push(response);
                    }
                }
                if !responses.is_empty() {
                    self.send_json(Value::Array(responses)).await;
                }
            }
        }

        if self.close_after_send.load(Ordering::Relaxed) {
            self.close_token.cancel();
        }

        self.recalc_concurrency();
    }

    /// Handle one call; `None` for client notifications, which are
    /// discarded.
    async fn process_call(self: &Arc<Self>, call: Value) -> Option<Value> {
        let call = match RpcCall::parse(call) {
            Ok(call) => call,

            Err(error) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                return Some(jsonrpc::error_response(&Value::Null, &error));
            }
        };
        let RpcCall { id, method, params } = call;

        let handler = self.state.lock().handlers.get(method.as_str()).copied();

        // Generic topic subscription, not part of any handler table.
        if handler.is_none() && method == "subscribe_topics" {
            let result = self.subscribe_topics(params);
            return id.map(|id| self.build_response(&id, result));
        }

        self.manager.count_method(match handler {
            Some(_) => method.as_str(),
            None => "invalid method",
        });

        let id = id?;

        let result = match handler {
            None => Err(RpcError::method_not_found(&method).into()),

            Some(handler) => {
                let request_timeout = self.manager.settings().request_timeout;
                match timeout(request_timeout, self.invoke(handler, params)).await {
                    Ok(result) => result,
                    Err(_) => Err(RpcError::bad_request("request timed out").into()),
                }
            }
        };

        Some(self.build_response(&id, result))
    }

    fn build_response(&self, id: &Value, result: HandlerResult) -> Value {
        match result {
            Ok(result) => {
                let response = jsonrpc::result_response(id, &result);
                let size = response.to_string().len();
                if self.max_response_size > 0 && size > self.max_response_size {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    let error =
                        RpcError::bad_request(format!("response too large ({size} bytes)"));
                    return jsonrpc::error_response(id, &error);
                }
                response
            }

            Err(HandlerError::Rpc(error)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                jsonrpc::error_response(id, &error)
            }

            Err(HandlerError::Disconnect(error)) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.close_after_send.store(true, Ordering::Relaxed);
                jsonrpc::error_response(id, &error)
            }
        }
    }

    async fn send_json(&self, value: Value) {
        let payload = value.to_string();

        self.send_count.fetch_add(1, Ordering::Relaxed);
        self.send_size
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.bump_cost(payload.len() as f64 * self.manager.settings().bw_cost_per_byte);

        if let Err(error) = self.writer.lock().await.send(&payload).await {
            debug!(conn_id = self.id, error:%; "cannot send, closing session");
            self.close_token.cancel();
        }
    }

    pub async fn send_notification(&self, method: &str, params: Value) {
        self.send_json(jsonrpc::notification(method, params)).await;
    }

    fn subscribe_topics(&self, params: Params) -> HandlerResult {
        let topics = match params {
            Params::Positional(values) => values
                .into_iter()
                .map(|value| value.as_str().map(ToOwned::to_owned))
                .collect::<Option<HashSet<_>>>(),
            _ => None,
        };
        let Some(topics) = topics else {
            return Err(RpcError::bad_request("expected a list of topic strings").into());
        };

        let joined = topics.iter().cloned().collect::<Vec<_>>().join(", ");
        self.state.lock().topics.extend(topics);

        Ok(json!(format!("Subscribed to topics: {joined}")))
    }

    /// Dispatch through the handler table.
    async fn invoke(self: &Arc<Self>, handler: Handler, params: Params) -> HandlerResult {
        match handler {
            Handler::BlockHeader => self.block_header(params).await,
            Handler::BlockHeaders => self.block_headers(params).await,
            Handler::EstimateFee => self.estimatefee(params).await,
            Handler::HeadersSubscribe => self.headers_subscribe().await,
            Handler::RelayFee => self.relayfee().await,
            Handler::ScripthashGetBalance => self.scripthash_get_balance(params).await,
            Handler::ScripthashGetHistory => self.scripthash_get_history(params).await,
            Handler::ScripthashGetMempool => self.scripthash_get_mempool(params).await,
            Handler::ScripthashListUnspent => self.scripthash_listunspent(params).await,
            Handler::ScripthashSubscribe => self.scripthash_subscribe(params).await,
            Handler::ScripthashUnsubscribe => self.scripthash_unsubscribe(params).await,
            Handler::TransactionBroadcast => self.transaction_broadcast(params).await,
            Handler::TransactionGet => self.transaction_get(params).await,
            Handler::TransactionMerkle => self.transaction_merkle(params).await,
            Handler::TransactionTscMerkle => self.transaction_tsc_merkle(params).await,
            Handler::TransactionIdFromPos => self.transaction_id_from_pos(params).await,
            Handler::FeeHistogram => self.fee_histogram().await,
            Handler::AddPeer => self.add_peer(params).await,
            Handler::Banner => self.banner().await,
            Handler::DonationAddress => self.donation_address().await,
            Handler::Features => self.server_features().await,
            Handler::PeersSubscribe => self.peers_subscribe().await,
            Handler::Ping => self.ping().await,
            Handler::Version => self.server_version(params).await,
            Handler::TopicUpdate => self.topic_update(params).await,
            Handler::AssetGetMeta => self.asset_get_meta(params).await,
            Handler::AssetGetMetaHistory => self.asset_get_meta_history(params).await,
            Handler::AssetSubscribe => self.asset_subscribe(params).await,
            Handler::AssetUnsubscribe => self.asset_unsubscribe(params).await,
            Handler::AssetsWithPrefix => self.assets_with_prefix(params).await,
            Handler::ListAddressesByAsset => self.list_addresses_by_asset(params).await,
            Handler::GetMessages => self.get_messages(params).await,
            Handler::IsQualified => self.is_qualified(params).await,
            Handler::QualificationsForQualifier => {
                self.qualifications_for_qualifier(params).await
            }
            Handler::QualificationsForQualifierHistory => {
                self.qualifications_for_qualifier_history(params).await
            }
            Handler::QualificationsForH160 => self.qualifications_for_h160(params).await,
            Handler::QualificationsForH160History => {
                self.qualifications_for_h160_history(params).await
            }
            Handler::IsRestrictedFrozen => self.is_restricted_frozen(params).await,
            Handler::RestrictedFrozenHistory => self.restricted_frozen_history(params).await,
            Handler::GetRestrictedString => self.get_restricted_string(params).await,
            Handler::GetRestrictedStringHistory => {
                self.get_restricted_string_history(params).await
            }
            Handler::QualifierAssociations => self.qualifier_associations(params).await,
            Handler::QualifierAssociationsHistory => {
                self.qualifier_associations_history(params).await
            }
            Handler::QualifierTagSubscribe => self.qualifier_tag_subscribe(params).await,
            Handler::QualifierTagUnsubscribe => self.qualifier_tag_unsubscribe(params).await,
            Handler::H160TagSubscribe => self.h160_tag_subscribe(params).await,
            Handler::H160TagUnsubscribe => self.h160_tag_unsubscribe(params).await,
            Handler::BroadcastsSubscribe => self.broadcasts_subscribe(params).await,
            Handler::BroadcastsUnsubscribe => self.broadcasts_unsubscribe(params).await,
            Handler::FrozenSubscribe => self.frozen_subscribe(params).await,
            Handler::FrozenUnsubscribe => self.frozen_unsubscribe(params).await,
            Handler::VerifierSubscribe => self.verifier_subscribe(params).await,
            Handler::VerifierUnsubscribe => self.verifier_unsubscribe(params).await,
            Handler::AssociationsSubscribe => self.associations_subscribe(params).await,
            Handler::AssociationsUnsubscribe => self.associations_unsubscribe(params).await,
            Handler::RpcAddPeer => self.manager.rpc_add_peer(params).await,
            Handler::RpcDaemonUrl => self.manager.rpc_daemon_url(params).await,
            Handler::RpcDisconnect => self.manager.rpc_disconnect(params).await,
            Handler::RpcGetInfo => self.manager.rpc_getinfo().await,
            Handler::RpcGroups => self.manager.rpc_groups().await,
            Handler::RpcLog => self.manager.rpc_log(params).await,
            Handler::RpcPeers => self.manager.rpc_peers().await,
            Handler::RpcQuery => self.manager.rpc_query(params).await,
            Handler::RpcReorg => self.manager.rpc_reorg(params).await,
            Handler::RpcSessions => self.manager.rpc_sessions().await,
            Handler::RpcStop => self.manager.rpc_stop().await,
        }
    }

    // --- Notifications

    /// Push notifications for everything this session subscribes to that was
    /// touched. Local RPC sessions ignore notifications.
    pub async fn notify(
        self: Arc<Self>,
        touched: Arc<Touched>,
        height_changed: bool,
    ) -> Result<(), HandlerError> {
        if self.kind.is_rpc() {
            return Ok(());
        }

        let (subscribe_headers, asset_subs, qualifier_subs, h160_subs, broadcast_subs, frozen_subs, validator_subs, qv_subs) = {
            let state = self.state.lock();
            (
                state.subscribe_headers,
                state.asset_subs.clone(),
                state.qualifier_tag_subs.clone(),
                state.h160_tag_subs.clone(),
                state.broadcast_subs.clone(),
                state.frozen_subs.clone(),
                state.validator_subs.clone(),
                state.qualifier_validator_subs.clone(),
            )
        };

        if height_changed && subscribe_headers {
            let args = json!([self.manager.hsub_results()]);
            self.send_notification("blockchain.headers.subscribe", args)
                .await;
        }

        let touched_assets = touched
            .assets
            .iter()
            .filter(|asset| asset_subs.contains(*asset))
            .cloned()
            .collect::<Vec<_>>();
        if !touched_assets.is_empty() {
            for asset in &touched_assets {
                let status = self.asset_status(asset).await?;
                self.send_notification("blockchain.asset.subscribe", json!([asset, status]))
                    .await;
            }
            info!(conn_id = self.id; "notified of {} reissued asset(s)", touched_assets.len());
        }

        let touched_qualifiers = touched
            .qualifier_tags
            .iter()
            .filter(|qualifier| qualifier_subs.contains(*qualifier))
            .cloned()
            .collect::<Vec<_>>();
        if !touched_qualifiers.is_empty() {
            for qualifier in &touched_qualifiers {
                let status = self.tags_for_qualifier_status(qualifier).await?;
                self.send_notification(
                    "blockchain.tag.qualifier.subscribe",
                    json!([qualifier, status]),
                )
                .await;
            }
            info!(conn_id = self.id; "notified of {} qualifier tagging(s)", touched_qualifiers.len());
        }

        let touched_h160s = touched
            .h160_tags
            .iter()
            .filter(|h160| h160_subs.contains(*h160))
            .copied()
            .collect::<Vec<_>>();
        if !touched_h160s.is_empty() {
            for h160 in &touched_h160s {
                let h160_hex = h160.to_string();
                let status = self.tags_for_h160_status(*h160).await?;
                self.send_notification("blockchain.tag.h160.subscribe", json!([h160_hex, status]))
                    .await;
            }
            info!(conn_id = self.id; "notified of {} h160 tagging(s)", touched_h160s.len());
        }

        let touched_broadcasts = touched
            .broadcasts
            .iter()
            .filter(|asset| broadcast_subs.contains(*asset))
            .cloned()
            .collect::<Vec<_>>();
        if !touched_broadcasts.is_empty() {
            for asset in &touched_broadcasts {
                let status = self.broadcasts_status(asset).await?;
                self.send_notification(
                    "blockchain.asset.broadcasts.subscribe",
                    json!([asset, status]),
                )
                .await;
            }
            info!(conn_id = self.id; "notified of {} broadcast(s)", touched_broadcasts.len());
        }

        let touched_freezes = touched
            .freezes
            .iter()
            .filter(|asset| frozen_subs.contains(*asset))
            .cloned()
            .collect::<Vec<_>>();
        if !touched_freezes.is_empty() {
            for asset in &touched_freezes {
                let result = self.is_restricted_frozen_inner(asset, true).await?;
                self.send_notification(
                    "blockchain.asset.is_frozen.subscribe",
                    json!([asset, result]),
                )
                .await;
            }
            info!(conn_id = self.id; "notified of {} freeze(s)", touched_freezes.len());
        }

        let touched_verifiers = touched
            .verifiers
            .iter()
            .filter(|asset| validator_subs.contains(*asset))
            .cloned()
            .collect::<Vec<_>>();
        if !touched_verifiers.is_empty() {
            for asset in &touched_verifiers {
                let result = self.get_restricted_string_inner(asset, true).await?;
                self.send_notification(
                    "blockchain.asset.verifier_string.subscribe",
                    json!([asset, result]),
                )
                .await;
            }
            info!(conn_id = self.id; "notified of {} verifier change(s)", touched_verifiers.len());
        }

        let touched_qv = touched
            .qualifier_associations
            .iter()
            .filter(|asset| qv_subs.contains(*asset))
            .cloned()
            .collect::<Vec<_>>();
        if !touched_qv.is_empty() {
            for asset in &touched_qv {
                let status = self.qualifier_associations_status(asset).await?;
                self.send_notification(
                    "blockchain.asset.restricted_associations.subscribe",
                    json!([format!("#{asset}"), status]),
                )
                .await;
            }
            info!(conn_id = self.id; "notified of {} qualifier(s) in verifier strings", touched_qv.len());
        }

        self.notify_scripthashes(&touched.hashxs, height_changed)
            .await;

        Ok(())
    }

    async fn notify_scripthashes(self: &Arc<Self>, touched: &HashSet<HashX>, height_changed: bool) {
        let (touched_subs, mempool_statuses) = {
            let state = self.state.lock();
            let touched_subs = touched
                .iter()
                .filter_map(|hashx| {
                    state
                        .hashx_subs
                        .get(hashx)
                        .map(|alias| (*hashx, alias.clone()))
                })
                .collect::<Vec<_>>();
            (touched_subs, state.mempool_statuses.clone())
        };

        if touched_subs.is_empty() && !(height_changed && !mempool_statuses.is_empty()) {
            return;
        }

        let mut changed = Vec::new();

        for (hashx, alias) in &touched_subs {
            let status = self.subscription_address_status(*hashx).await;
            changed.push((alias.clone(), status));
        }

        // Mempool-derived statuses also depend on the confirmed state of
        // other transactions, so re-evaluate them whenever the height moves.
        if height_changed {
            let notified = touched_subs
                .iter()
                .map(|(hashx, _)| *hashx)
                .collect::<HashSet<_>>();
            for (hashx, old_status) in mempool_statuses {
                if notified.contains(&hashx) {
                    continue;
                }
                let alias = self.state.lock().hashx_subs.get(&hashx).cloned();
                if let Some(alias) = alias {
                    let status = self.subscription_address_status(hashx).await;
                    if status != old_status {
                        changed.push((alias, status));
                    }
                }
            }
        }

        let changed_count = changed.len();
        for (alias, status) in changed {
            self.send_notification("blockchain.scripthash.subscribe", json!([alias, status]))
                .await;
        }

        if changed_count > 0 {
            info!(conn_id = self.id; "notified of {changed_count} address(es)");
        }
    }
}
