// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use indexer_common::domain::BlockHash;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Handle onto the block processor.
#[trait_variant::make(Send)]
pub trait BlockProcessor: Clone + Send + Sync + 'static {
    /// The current chain tip.
    fn tip(&self) -> BlockHash;

    /// Resolves each time the processor backs up over a chain
    /// reorganization.
    async fn backed_up(&self);

    /// Schedule a forced reorg of `count` blocks; `false` while still
    /// catching up with the daemon.
    fn force_chain_reorg(&self, count: u32) -> bool;
}

#[derive(Debug, Clone, Error)]
#[error("peer error: {0}")]
pub struct PeerError(pub String);

/// Handle onto peer discovery and the peer table.
#[trait_variant::make(Send)]
pub trait PeerManager: Clone + Send + Sync + 'static {
    /// Run peer discovery until cancelled.
    async fn discover_peers(&self);

    /// Add a peer given its real name, e.g. `"host t50001 s50002"`.
    async fn add_local_rpc_peer(&self, real_name: &str) -> Result<(), PeerError>;

    /// Handle `server.add_peer` from a remote session; `true` if accepted.
    async fn on_add_peer(&self, features: serde_json::Value, remote: SocketAddr) -> bool;

    /// The peer list for `server.peers.subscribe`.
    fn on_peers_subscribe(&self, is_tor: bool) -> Vec<serde_json::Value>;

    /// The proxy address if a Tor proxy is configured.
    fn proxy_address(&self) -> Option<IpAddr>;

    /// A one-line summary for `getinfo`.
    fn info(&self) -> serde_json::Value;

    /// Detailed peer data for the operator `peers` command.
    fn rpc_data(&self) -> serde_json::Value;

    /// Relay a topic update to subscribed peers.
    fn send_topic_updates(&self, topic: &str, payload: &str);
}
