// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! The session manager: session registry and groups, shared caches, the
//! listeners and the background supervisors.

use crate::{
    application,
    domain::{
        ChainNotification, Height, HistoryEntry, Touched, hash_to_hex,
        chain::{BlockProcessor, PeerManager},
        daemon::{Daemon, DaemonError},
        mempool::Mempool,
        storage::{Db, MerkleNode},
    },
    infra::api::{
        Config, Service, ServiceProtocol,
        jsonrpc::RpcError,
        listener::{self, ServerHandle, TlsContext, ip_group_name},
        session::{Session, SessionSettings, unix_time},
    },
};
use anyhow::{Context, anyhow};
use indexer_common::domain::{BlockHash, ByteVec, Event, HashX, TxHash};
use itertools::Itertools;
use log::{error, info, warn};
use lru::LruCache;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    select,
    sync::{Notify, mpsc},
    task::JoinSet,
    time::sleep,
};

const CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

/// Blocks with at least this many transactions get a per-height merkle
/// accelerator.
const MERKLE_CACHE_THRESHOLD: usize = 200;

/// Period of the concurrency recompute supervisor.
const RECALC_PERIOD: Duration = Duration::from_secs(300);

/// A group of sessions sharing cost attribution; it keeps the cost of
/// departed members as decaying retained cost.
pub struct SessionGroup {
    pub name: String,
    pub weight: f64,
    pub sessions: HashSet<u64>,
    pub retained_cost: f64,
}

struct SessionEntry<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    session: Arc<Session<D, M, R, P, B>>,
    groups: Vec<String>,
}

struct Registry<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    sessions: HashMap<u64, SessionEntry<D, M, R, P, B>>,
    groups: HashMap<String, SessionGroup>,
}

impl<D, M, R, P, B> Registry<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    fn group_session_cost(&self, group: &SessionGroup) -> f64 {
        group
            .sessions
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .map(|entry| entry.session.cost())
            .sum()
    }

    fn group_cost(&self, group: &SessionGroup) -> f64 {
        group.retained_cost + self.group_session_cost(group)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HsubResults {
    pub hex: String,
    pub height: Height,
}

#[derive(Debug, Default)]
struct Notified {
    height: Option<Height>,
    hsub_results: Option<HsubResults>,
}

#[derive(Clone)]
struct FeeEstimate {
    tip: Option<BlockHash>,
    feerate: Option<f64>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

/// A TSC-format merkle proof.
pub struct TscProof {
    pub index: usize,
    pub txid_or_tx: Value,
    pub target: String,
    pub nodes: Vec<String>,
}

#[derive(Default)]
struct CacheStats {
    history_lookups: AtomicU64,
    history_hits: AtomicU64,
    tx_hashes_lookups: AtomicU64,
    tx_hashes_hits: AtomicU64,
    merkle_lookups: AtomicU64,
    merkle_hits: AtomicU64,
}

pub struct SessionManager<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    application_config: application::Config,
    config: Config,
    db: D,
    mempool: M,
    daemon: R,
    peers: P,
    bp: B,
    drop_client: Option<Regex>,
    tls: Option<TlsContext>,
    settings: parking_lot::RwLock<SessionSettings>,
    start_time: f64,
    next_session_id: AtomicU64,
    registry: parking_lot::Mutex<Registry<D, M, R, P, B>>,
    servers: tokio::sync::Mutex<HashMap<Service, ServerHandle>>,
    pub(crate) session_event: Notify,
    server_listening: Event,
    shutdown: Event,
    notified: parking_lot::Mutex<Notified>,
    history_cache: parking_lot::Mutex<LruCache<HashX, Result<Arc<Vec<HistoryEntry>>, RpcError>>>,
    tx_hashes_cache: parking_lot::Mutex<LruCache<Height, Arc<Vec<TxHash>>>>,
    merkle_cache: parking_lot::Mutex<LruCache<Height, Arc<Vec<TxHash>>>>,
    estimatefee_cache: parking_lot::Mutex<LruCache<(u32, Option<String>), FeeEstimate>>,
    reorg_count: AtomicU64,
    txs_sent: AtomicU64,
    method_counts: parking_lot::Mutex<HashMap<String, u64>>,
    cache_stats: CacheStats,
}

impl<D, M, R, P, B> SessionManager<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        application_config: application::Config,
        mut config: Config,
        db: D,
        mempool: M,
        daemon: R,
        peers: P,
        bp: B,
        shutdown: Event,
    ) -> anyhow::Result<Arc<Self>> {
        config.max_send = config.max_send.max(350_000);

        let drop_client = config
            .drop_client
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("compile drop_client pattern")?;

        let tls = match (&config.ssl_certfile, &config.ssl_keyfile) {
            (Some(certfile), Some(keyfile)) => {
                Some(TlsContext::new(certfile.clone(), keyfile.clone()))
            }
            _ => None,
        };

        let settings = SessionSettings::from_config(&config);

        Ok(Arc::new(Self {
            application_config,
            config,
            db,
            mempool,
            daemon,
            peers,
            bp,
            drop_client,
            tls,
            settings: parking_lot::RwLock::new(settings),
            start_time: unix_time(),
            next_session_id: AtomicU64::new(0),
            registry: parking_lot::Mutex::new(Registry {
                sessions: HashMap::new(),
                groups: HashMap::new(),
            }),
            servers: tokio::sync::Mutex::new(HashMap::new()),
            session_event: Notify::new(),
            server_listening: Event::new(),
            shutdown,
            notified: parking_lot::Mutex::new(Notified::default()),
            history_cache: parking_lot::Mutex::new(LruCache::new(CACHE_SIZE)),
            tx_hashes_cache: parking_lot::Mutex::new(LruCache::new(CACHE_SIZE)),
            merkle_cache: parking_lot::Mutex::new(LruCache::new(CACHE_SIZE)),
            estimatefee_cache: parking_lot::Mutex::new(LruCache::new(CACHE_SIZE)),
            reorg_count: AtomicU64::new(0),
            txs_sent: AtomicU64::new(0),
            method_counts: parking_lot::Mutex::new(HashMap::new()),
            cache_stats: CacheStats::default(),
        }))
    }

    // --- Accessors

    pub fn db(&self) -> &D {
        &self.db
    }

    pub fn mempool(&self) -> &M {
        &self.mempool
    }

    pub fn daemon(&self) -> &R {
        &self.daemon
    }

    pub fn peers(&self) -> &P {
        &self.peers
    }

    pub fn bp(&self) -> &B {
        &self.bp
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn application_config(&self) -> &application::Config {
        &self.application_config
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings.read().clone()
    }

    pub fn set_log_new(&self, log_new: bool) {
        self.settings.write().log_new = log_new;
    }

    pub fn log_new(&self) -> bool {
        self.settings.read().log_new
    }

    pub fn drop_client(&self) -> Option<&Regex> {
        self.drop_client.as_ref()
    }

    pub fn max_recv(&self) -> usize {
        self.config.max_recv
    }

    pub fn max_send(&self) -> usize {
        self.config.max_send
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn server_listening(&self) -> &Event {
        &self.server_listening
    }

    pub fn shutdown_event(&self) -> &Event {
        &self.shutdown
    }

    pub fn assign_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    pub fn txs_sent(&self) -> u64 {
        self.txs_sent.load(Ordering::Relaxed)
    }

    pub fn reorg_count(&self) -> u64 {
        self.reorg_count.load(Ordering::Relaxed)
    }

    pub fn count_method(&self, method: &str) {
        *self
            .method_counts
            .lock()
            .entry(method.to_string())
            .or_default() += 1;
        metrics::counter!("electrum_requests_total", "method" => method.to_string()).increment(1);
    }

    pub fn hsub_results(&self) -> Value {
        self.notified
            .lock()
            .hsub_results
            .as_ref()
            .map(|results| json!(results))
            .unwrap_or(Value::Null)
    }

    /// The listening address of the first server with the given protocol.
    pub async fn local_addr(&self, protocol: ServiceProtocol) -> Option<std::net::SocketAddr> {
        self.servers
            .lock()
            .await
            .iter()
            .find(|(service, _)| service.protocol == protocol)
            .map(|(_, handle)| handle.local_addr())
    }

    // --- Session registry and groups

    fn timeslice_group_name(&self, session_start: f64) -> String {
        format!("t{}", ((session_start - self.start_time) / 300.0) as i64)
    }

    pub fn add_session(&self, session: &Arc<Session<D, M, R, P, B>>) {
        self.session_event.notify_one();

        let named_groups = [
            (Some(self.timeslice_group_name(session.start_time())), 0.03),
            (ip_group_name(session.remote_address().ip()), 1.0),
        ];

        let mut registry = self.registry.lock();
        let mut groups = Vec::new();
        for (name, weight) in named_groups {
            let Some(name) = name else { continue };
            let group = registry
                .groups
                .entry(name.clone())
                .or_insert_with(|| SessionGroup {
                    name: name.clone(),
                    weight,
                    sessions: HashSet::new(),
                    retained_cost: 0.0,
                });
            group.sessions.insert(session.id());
            groups.push(name);
        }
        registry.sessions.insert(
            session.id(),
            SessionEntry {
                session: session.clone(),
                groups,
            },
        );

        metrics::gauge!("electrum_sessions").increment(1.0);
    }

    /// Remove a session, moving its final cost into the retained cost of its
    /// groups.
    pub fn remove_session(&self, id: u64, cost: f64) {
        self.session_event.notify_one();

        let mut registry = self.registry.lock();
        let Some(entry) = registry.sessions.remove(&id) else {
            return;
        };
        for name in entry.groups {
            if let Some(group) = registry.groups.get_mut(&name) {
                group.retained_cost += cost;
                group.sessions.remove(&id);
            }
        }

        metrics::gauge!("electrum_sessions").decrement(1.0);
    }

    /// The group-attributed cost of a session. A session may be deregistered
    /// concurrently with a notification; it then contributes nothing.
    pub fn extra_cost(&self, id: u64, session_cost: f64) -> f64 {
        let registry = self.registry.lock();
        let Some(entry) = registry.sessions.get(&id) else {
            return 0.0;
        };

        entry
            .groups
            .iter()
            .filter_map(|name| registry.groups.get(name))
            .map(|group| (registry.group_cost(group) - session_cost) * group.weight)
            .sum()
    }

    pub fn group_names_of(&self, id: u64) -> Vec<String> {
        self.registry
            .lock()
            .sessions
            .get(&id)
            .map(|entry| entry.groups.clone())
            .unwrap_or_default()
    }

    pub(crate) fn sessions(&self) -> Vec<Arc<Session<D, M, R, P, B>>> {
        self.registry
            .lock()
            .sessions
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub(crate) fn session_by_id(&self, id: u64) -> Option<Arc<Session<D, M, R, P, B>>> {
        self.registry
            .lock()
            .sessions
            .get(&id)
            .map(|entry| entry.session.clone())
    }

    pub(crate) fn group_sessions(&self, name: &str) -> Vec<Arc<Session<D, M, R, P, B>>> {
        let registry = self.registry.lock();
        registry
            .groups
            .get(name)
            .map(|group| {
                group
                    .sessions
                    .iter()
                    .filter_map(|id| registry.sessions.get(id))
                    .map(|entry| entry.session.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn group_names(&self) -> HashSet<String> {
        self.registry.lock().groups.keys().cloned().collect()
    }

    // --- Serving

    /// Start the local RPC listener immediately, then the external listeners
    /// once `ready` is triggered, then run the supervisors until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        notifications: mpsc::Receiver<ChainNotification>,
        ready: Event,
    ) -> anyhow::Result<()> {
        let rpc_services = self
            .config
            .services
            .iter()
            .filter(|service| service.protocol.is_rpc())
            .cloned()
            .collect::<Vec<_>>();
        self.start_servers(rpc_services).await;

        ready.wait().await;

        *self.settings.write() = SessionSettings::from_config(&self.config);

        let config = &self.config;
        info!("max session count: {}", config.max_sessions);
        info!("session timeout: {:?}", config.session_timeout);
        info!("session cost hard limit {}", config.cost_hard_limit);
        info!("session cost soft limit {}", config.cost_soft_limit);
        info!("bandwidth unit cost {}", config.bw_unit_cost);
        info!("request sleep {:?}", config.request_sleep);
        info!("request timeout {:?}", config.request_timeout);
        info!("initial concurrent {}", config.initial_concurrent);
        info!("max response size {} bytes", config.max_send);
        info!("max receive size {} bytes", config.max_recv);
        if let Some(drop_client) = &self.drop_client {
            info!("drop clients matching: {}", drop_client.as_str());
        }
        for service in &config.report_services {
            info!("advertising service {service}");
        }

        let height = self.db.height();
        self.refresh_hsub_results(height)
            .await
            .context("initialize header subscription results")?;

        self.start_external_servers().await;

        // Peer discovery starts after the external servers because we
        // connect to ourself.
        let mut supervisors: JoinSet<anyhow::Result<()>> = JoinSet::new();
        supervisors.spawn({
            let peers = self.peers.clone();
            async move {
                peers.discover_peers().await;
                Ok(())
            }
        });
        supervisors.spawn(self.clone().notify_loop(notifications));
        supervisors.spawn(self.clone().clear_stale_sessions());
        supervisors.spawn(self.clone().handle_chain_reorgs());
        supervisors.spawn(self.clone().recalc_concurrency_loop());
        supervisors.spawn(self.clone().log_sessions_loop());
        supervisors.spawn(self.clone().manage_servers());

        let result = loop {
            select! {
                _ = self.shutdown.wait() => break Ok(()),

                joined = supervisors.join_next() => match joined {
                    Some(Ok(Ok(()))) => warn!("supervisor completed unexpectedly"),
                    Some(Ok(Err(error))) => break Err(error),
                    Some(Err(error)) if error.is_panic() => {
                        break Err(anyhow!("supervisor panicked: {error}"));
                    }
                    Some(Err(_)) => {}
                    None => break Ok(()),
                }
            }
        };

        // Teardown runs on every exit path: servers first, then sessions.
        info!("stopping servers");
        self.stop_servers(|_| true).await;
        supervisors.shutdown().await;

        info!("closing connections...");
        let mut closes = JoinSet::new();
        for session in self.sessions() {
            closes.spawn(async move { session.close(Duration::from_secs(1)).await });
        }
        while closes.join_next().await.is_some() {}
        info!("connections closed");

        result
    }

    fn tls_acceptor(&self) -> Result<tokio_rustls::TlsAcceptor, listener::ListenerError> {
        self.tls
            .as_ref()
            .ok_or(listener::ListenerError::TlsNotConfigured)?
            .acceptor()
    }

    async fn start_servers(self: &Arc<Self>, services: Vec<Service>) {
        for service in services {
            let tls = if service.protocol.uses_tls() {
                match self.tls_acceptor() {
                    Ok(acceptor) => Some(acceptor),
                    Err(error) => {
                        error!(
                            "{} server failed to listen on {service}: {error}",
                            service.protocol.kind()
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            match listener::start_service(self.clone(), service.clone(), tls) {
                Ok(handle) => {
                    info!("{} server listening on {service}", service.protocol.kind());
                    self.servers.lock().await.insert(service, handle);
                }

                Err(error) => {
                    error!(
                        "{} server failed to listen on {service}: {error}",
                        service.protocol.kind()
                    );
                }
            }
        }
    }

    pub(crate) async fn start_external_servers(self: &Arc<Self>) {
        let external = self
            .config
            .services
            .iter()
            .filter(|service| !service.protocol.is_rpc())
            .cloned()
            .collect();
        self.start_servers(external).await;
        self.server_listening.set();
    }

    /// Close matching servers, then await their closure sequentially.
    pub(crate) async fn stop_servers(&self, matching: impl Fn(&Service) -> bool) {
        let mut servers = self.servers.lock().await;
        let stopped = servers
            .keys()
            .filter(|service| matching(service))
            .cloned()
            .collect::<Vec<_>>();

        let mut handles = Vec::new();
        for service in stopped {
            if let Some(handle) = servers.remove(&service) {
                info!("closing down server for {service}");
                handle.close();
                handles.push(handle);
            }
        }
        drop(servers);

        for handle in handles {
            handle.wait_closed().await;
        }
    }

    // --- Supervisors

    /// Admission control: pause external listeners at the session maximum,
    /// resume once the count has dropped to the low watermark.
    async fn manage_servers(self: Arc<Self>) -> anyhow::Result<()> {
        let mut paused = false;
        let max_sessions = self.config.max_sessions;
        let low_watermark = max_sessions * 19 / 20;

        loop {
            self.session_event.notified().await;

            if !paused && self.session_count() >= max_sessions {
                info!(
                    "maximum sessions {max_sessions} reached, stopping new connections until \
                     count drops to {low_watermark}"
                );
                self.stop_servers(|service| !service.protocol.is_rpc())
                    .await;
                paused = true;
            }

            if paused && self.session_count() <= low_watermark {
                info!("resuming listening for incoming connections");
                self.start_external_servers().await;
                paused = false;
            }
        }
    }

    /// Cut off sessions that have not sent anything for the session timeout.
    async fn clear_stale_sessions(self: Arc<Self>) -> anyhow::Result<()> {
        // Check once a minute, or more often for timeouts under a minute.
        let period = Duration::from_secs(60).min(self.config.session_timeout);

        loop {
            sleep(period).await;

            let stale_cutoff = unix_time() - self.config.session_timeout.as_secs_f64();
            let stale_sessions = self
                .sessions()
                .into_iter()
                .filter(|session| session.last_recv() < stale_cutoff)
                .collect::<Vec<_>>();
            self.disconnect_sessions(stale_sessions, "closing stale", Duration::from_secs(1))
                .await;
        }
    }

    /// Clear height-keyed caches whenever the block processor backs up.
    async fn handle_chain_reorgs(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            self.bp.backed_up().await;
            info!("reorg signalled; clearing tx_hashes and merkle caches");
            self.reorg_count.fetch_add(1, Ordering::Relaxed);
            self.tx_hashes_cache.lock().clear();
            self.merkle_cache.lock().clear();
        }
    }

    /// Periodically decay retained group cost, drop dead groups and
    /// recompute per-session concurrency.
    async fn recalc_concurrency_loop(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            sleep(RECALC_PERIOD).await;
            self.recalc_concurrency();
        }
    }

    pub(crate) fn recalc_concurrency(&self) {
        let hard_limit = self.settings.read().cost_hard_limit;
        let refund = RECALC_PERIOD.as_secs_f64() * hard_limit / 5000.0;

        let sessions = {
            let mut registry = self.registry.lock();

            let mut dead_groups = Vec::new();
            for group in registry.groups.values_mut() {
                group.retained_cost = (group.retained_cost - refund).max(0.0);
                if group.retained_cost == 0.0 && group.sessions.is_empty() {
                    dead_groups.push(group.name.clone());
                }
            }
            for name in dead_groups {
                registry.groups.remove(&name);
            }

            registry
                .sessions
                .values()
                .map(|entry| entry.session.clone())
                .collect::<Vec<_>>()
        };

        // Subscriptions have an on-going cost, so they slow the decay.
        for session in sessions {
            session
                .set_cost_decay_per_sec(hard_limit / (10_000.0 + 5.0 * session.sub_count() as f64));
            session.recalc_concurrency();
        }
    }

    /// Periodically dump the session table when configured.
    async fn log_sessions_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let Some(interval) = self.config.log_sessions else {
            std::future::pending::<()>().await;
            unreachable!()
        };

        loop {
            sleep(interval).await;
            for line in self.session_data(true) {
                info!("{line}");
            }
            info!("{}", self.get_info());
        }
    }

    async fn notify_loop(
        self: Arc<Self>,
        mut notifications: mpsc::Receiver<ChainNotification>,
    ) -> anyhow::Result<()> {
        while let Some(ChainNotification { height, touched }) = notifications.recv().await {
            self.notify_sessions(height, touched).await?;
        }

        warn!("notification channel closed");
        Ok(())
    }

    pub(crate) async fn disconnect_sessions(
        &self,
        sessions: Vec<Arc<Session<D, M, R, P, B>>>,
        reason: &str,
        force_after: Duration,
    ) {
        if sessions.is_empty() {
            return;
        }

        let session_ids = sessions.iter().map(|session| session.id()).join(", ");
        info!("{reason} session ids {session_ids}");

        let mut closes = JoinSet::new();
        for session in sessions {
            closes.spawn(async move { session.close(force_after).await });
        }
        while closes.join_next().await.is_some() {}
    }

    // --- Notifications

    /// Refresh the cached header subscription response for the given height
    /// and record it as the notified height.
    async fn refresh_hsub_results(&self, height: Height) -> anyhow::Result<()> {
        // A reorg could race and leave the db height lower.
        let height = height.min(self.db.height());
        let raw = self
            .raw_header(height)
            .await
            .map_err(|error| anyhow!("{error}"))?;

        let mut notified = self.notified.lock();
        notified.hsub_results = Some(HsubResults {
            hex: raw.to_string(),
            height,
        });
        notified.height = Some(height);

        Ok(())
    }

    /// Fan a chain notification out to every session concurrently; a failing
    /// session does not affect the others.
    pub async fn notify_sessions(&self, height: Height, touched: Touched) -> anyhow::Result<()> {
        let height_changed = self.notified.lock().height != Some(height);
        if height_changed {
            self.refresh_hsub_results(height).await?;

            let mut history_cache = self.history_cache.lock();
            for hashx in &touched.hashxs {
                history_cache.pop(hashx);
            }
        }

        let touched = Arc::new(touched);
        let mut notifies = JoinSet::new();
        for session in self.sessions() {
            notifies.spawn(session.notify(touched.clone(), height_changed));
        }
        while let Some(joined) = notifies.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(error:%; "session notification failed"),
                Err(error) if error.is_cancelled() => {}
                Err(error) => warn!(error:%; "session notification panicked"),
            }
        }

        metrics::counter!("electrum_notifications_total").increment(1);

        Ok(())
    }

    // --- Daemon passthroughs

    pub async fn broadcast_transaction(&self, raw_tx: &[u8]) -> Result<String, DaemonError> {
        let hex_hash = self.daemon.broadcast_transaction(raw_tx).await?;
        self.txs_sent.fetch_add(1, Ordering::Relaxed);
        Ok(hex_hash)
    }

    // --- Caches

    /// The raw header at a height, as a bad-request error when out of range.
    pub async fn raw_header(&self, height: Height) -> Result<ByteVec, RpcError> {
        self.db
            .raw_header(height)
            .await?
            .ok_or_else(|| RpcError::bad_request(format!("height {height} out of range")))
    }

    /// The limited history of a script and its cost. An oversized history is
    /// cached as an error and re-raised for every caller until invalidation.
    pub async fn limited_history(
        &self,
        hashx: HashX,
    ) -> Result<(Arc<Vec<HistoryEntry>>, f64), RpcError> {
        // Each history entry is about 99 bytes when encoded as JSON.
        let limit = self.config.max_send / 99;
        let mut cost = 0.1;

        self.cache_stats
            .history_lookups
            .fetch_add(1, Ordering::Relaxed);
        let cached = self.history_cache.lock().get(&hashx).cloned();
        if let Some(result) = cached {
            self.cache_stats.history_hits.fetch_add(1, Ordering::Relaxed);
            return result.map(|history| (history, cost));
        }

        let result = match self.db.limited_history(hashx, limit).await {
            Ok(history) => {
                cost += 0.1 + history.len() as f64 * 0.001;
                if history.len() >= limit {
                    Err(RpcError::bad_request("history too large"))
                } else {
                    Ok(Arc::new(history))
                }
            }
            Err(error) => return Err(error.into()),
        };
        self.history_cache.lock().put(hashx, result.clone());

        result.map(|history| (history, cost))
    }

    /// The ordered tx hashes of a block and the cost of getting them. A
    /// result fetched under a superseded reorg generation is discarded and
    /// fetched again.
    pub async fn tx_hashes_at_blockheight(
        &self,
        height: Height,
    ) -> Result<(Arc<Vec<TxHash>>, f64), RpcError> {
        self.cache_stats
            .tx_hashes_lookups
            .fetch_add(1, Ordering::Relaxed);
        if let Some(tx_hashes) = self.tx_hashes_cache.lock().get(&height).cloned() {
            self.cache_stats
                .tx_hashes_hits
                .fetch_add(1, Ordering::Relaxed);
            return Ok((tx_hashes, 0.1));
        }

        let tx_hashes = loop {
            let reorg_count = self.reorg_count.load(Ordering::Relaxed);
            let tx_hashes = self
                .db
                .tx_hashes_at_blockheight(height)
                .await
                .map_err(|error| RpcError::bad_request(format!("db error: {error}")))?;
            if reorg_count == self.reorg_count.load(Ordering::Relaxed) {
                break Arc::new(tx_hashes);
            }
        };

        let cost = 0.25 + tx_hashes.len() as f64 * 0.000_1;
        self.tx_hashes_cache.lock().put(height, tx_hashes.clone());

        Ok((tx_hashes, cost))
    }

    /// The merkle branch for a transaction position, via the per-height
    /// accelerator for large blocks.
    async fn merkle_branch(
        &self,
        height: Height,
        tx_hashes: &Arc<Vec<TxHash>>,
        tx_pos: usize,
        tsc_format: bool,
    ) -> Result<(Vec<String>, indexer_common::domain::MerkleRoot, f64), RpcError> {
        let tx_hash_count = tx_hashes.len();
        let mut cost = tx_hash_count as f64;

        let hashes = if tx_hash_count >= MERKLE_CACHE_THRESHOLD {
            self.cache_stats.merkle_lookups.fetch_add(1, Ordering::Relaxed);
            let cached = self.merkle_cache.lock().get(&height).cloned();
            match cached {
                Some(hashes) => {
                    self.cache_stats.merkle_hits.fetch_add(1, Ordering::Relaxed);
                    cost = 10.0 * (tx_hash_count as f64).sqrt();
                    hashes
                }
                None => {
                    self.merkle_cache.lock().put(height, tx_hashes.clone());
                    tx_hashes.clone()
                }
            }
        } else {
            tx_hashes.clone()
        };

        let (branch, root) = self
            .db
            .merkle_branch_and_root(&hashes, tx_pos, tsc_format)
            .await?;

        let branch = branch
            .into_iter()
            .map(|node| match node {
                MerkleNode::Hash(hash) => hash_to_hex(&hash),
                MerkleNode::Duplicate => "*".to_string(),
            })
            .collect();

        Ok((branch, root, cost / 2500.0))
    }

    /// The branch, position and cost for a transaction hash.
    pub async fn merkle_branch_for_tx_hash(
        &self,
        height: Height,
        tx_hash: TxHash,
    ) -> Result<(Vec<String>, usize, f64), RpcError> {
        let (tx_hashes, tx_hashes_cost) = self.tx_hashes_at_blockheight(height).await?;
        let tx_pos = tx_hashes
            .iter()
            .position(|hash| *hash == tx_hash)
            .ok_or_else(|| {
                RpcError::bad_request(format!(
                    "tx {} not in block at height {height}",
                    hash_to_hex(&tx_hash)
                ))
            })?;

        let (branch, _root, merkle_cost) =
            self.merkle_branch(height, &tx_hashes, tx_pos, false).await?;
        Ok((branch, tx_pos, tx_hashes_cost + merkle_cost))
    }

    /// The branch, transaction hash and cost for a block position.
    pub async fn merkle_branch_for_tx_pos(
        &self,
        height: Height,
        tx_pos: usize,
    ) -> Result<(Vec<String>, String, f64), RpcError> {
        let (tx_hashes, tx_hashes_cost) = self.tx_hashes_at_blockheight(height).await?;
        let tx_hash = tx_hashes.get(tx_pos).ok_or_else(|| {
            RpcError::bad_request(format!(
                "no tx at position {tx_pos} in block at height {height}"
            ))
        })?;

        let (branch, _root, merkle_cost) =
            self.merkle_branch(height, &tx_hashes, tx_pos, false).await?;
        Ok((branch, hash_to_hex(tx_hash), tx_hashes_cost + merkle_cost))
    }

    /// A TSC-format merkle proof for a transaction hash.
    pub async fn tsc_merkle_proof_for_tx_hash(
        &self,
        height: Height,
        tx_hash: TxHash,
        txid_or_tx: &str,
        target_type: &str,
    ) -> Result<(TscProof, f64), RpcError> {
        let (tx_hashes, tx_hashes_cost) = self.tx_hashes_at_blockheight(height).await?;
        let tx_pos = tx_hashes
            .iter()
            .position(|hash| *hash == tx_hash)
            .ok_or_else(|| {
                RpcError::bad_request(format!(
                    "tx {} not in block at height {height}",
                    hash_to_hex(&tx_hash)
                ))
            })?;

        let (nodes, root, merkle_cost) =
            self.merkle_branch(height, &tx_hashes, tx_pos, true).await?;

        let header_cost = 0.25;
        let raw_header = self.raw_header(height).await.map_err(|_| {
            RpcError::bad_request(format!("block header at height {height} not found"))
        })?;
        let header_bytes = raw_header.as_ref();
        if header_bytes.len() < 68 {
            return Err(RpcError::bad_request(format!(
                "block header at height {height} not found"
            )));
        }
        let root_from_header = &header_bytes[36..68];

        if root.as_ref() != root_from_header {
            return Err(RpcError::bad_request(
                "db error. Merkle root from cached block header does not match the derived \
                 merkle root",
            ));
        }

        let target = match target_type {
            "block_header" => raw_header.to_string(),
            "merkle_root" => {
                let root = TxHash::try_from(root_from_header)
                    .expect("merkle root is 32 bytes");
                hash_to_hex(&root)
            }
            _ => {
                let block_hash =
                    TxHash::from(<[u8; 32]>::from(Sha256::digest(Sha256::digest(header_bytes))));
                hash_to_hex(&block_hash)
            }
        };

        let (txid_or_tx, tx_fetch_cost) = if txid_or_tx == "tx" {
            let txid = hash_to_hex(&tx_hash);
            let raw_tx = self.daemon.get_raw_transaction(&txid, false).await?;
            (raw_tx, 1.0)
        } else {
            (json!(hash_to_hex(&tx_hash)), 0.0)
        };

        let proof = TscProof {
            index: tx_pos,
            txid_or_tx,
            target,
            nodes,
        };

        Ok((
            proof,
            tx_hashes_cost + merkle_cost + tx_fetch_cost + header_cost,
        ))
    }

    /// Fee estimation with a single-flight per `(block target, mode)` cache
    /// entry: concurrent callers at one tip produce one daemon request.
    pub async fn estimate_fee(
        &self,
        number: u32,
        mode: Option<&str>,
    ) -> Result<(f64, f64), RpcError> {
        let key = (number, mode.map(ToOwned::to_owned));

        let entry = {
            let mut cache = self.estimatefee_cache.lock();
            match cache.get(&key).cloned() {
                Some(entry) => entry,
                None => {
                    let entry = FeeEstimate {
                        tip: None,
                        feerate: None,
                        lock: Arc::new(tokio::sync::Mutex::new(())),
                    };
                    cache.put(key.clone(), entry.clone());
                    entry
                }
            }
        };

        if let (Some(tip), Some(feerate)) = (entry.tip, entry.feerate)
            && tip == self.bp.tip()
        {
            return Ok((feerate, 0.0));
        }

        let lock = entry.lock.clone();
        let _guard = lock.lock().await;

        // Re-check after waiting: the winner may have filled the entry.
        let entry = self.estimatefee_cache.lock().get(&key).cloned();
        if let Some(FeeEstimate {
            tip: Some(tip),
            feerate: Some(feerate),
            ..
        }) = entry
            && tip == self.bp.tip()
        {
            return Ok((feerate, 0.0));
        }

        let tip = self.bp.tip();
        let feerate = match self.daemon.estimate_smart_fee(number, mode).await? {
            Some(feerate) => feerate,
            // No estimate available; fall back to the minimum relay fee.
            None => self.daemon.get_network_info().await?.relayfee,
        };

        self.estimatefee_cache.lock().put(
            key,
            FeeEstimate {
                tip: Some(tip),
                feerate: Some(feerate),
                lock: lock.clone(),
            },
        );

        Ok((feerate, 2.0))
    }

    // --- Operator data

    pub(crate) fn method_counts(&self) -> HashMap<String, u64> {
        self.method_counts.lock().clone()
    }

    pub(crate) fn cache_info(&self) -> Value {
        let stats = &self.cache_stats;
        let fmt = |lookups: &AtomicU64, hits: &AtomicU64, entries: usize| {
            format!(
                "{} lookups {} hits {} entries",
                lookups.load(Ordering::Relaxed),
                hits.load(Ordering::Relaxed),
                entries
            )
        };

        json!({
            "history cache": fmt(
                &stats.history_lookups,
                &stats.history_hits,
                self.history_cache.lock().len()
            ),
            "merkle cache": fmt(
                &stats.merkle_lookups,
                &stats.merkle_hits,
                self.merkle_cache.lock().len()
            ),
            "tx hashes cache": fmt(
                &stats.tx_hashes_lookups,
                &stats.tx_hashes_hits,
                self.tx_hashes_cache.lock().len()
            ),
        })
    }

    pub(crate) fn group_data_snapshot(&self) -> Vec<(String, f64, f64, Vec<u64>)> {
        let registry = self.registry.lock();
        registry
            .groups
            .values()
            .map(|group| {
                (
                    group.name.clone(),
                    registry.group_session_cost(group),
                    group.retained_cost,
                    group.sessions.iter().copied().collect(),
                )
            })
            .collect()
    }
}
