// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use crate::domain::Height;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("daemon error: {0}")]
pub struct DaemonError(pub String);

/// The subset of `getnetworkinfo` the session layer consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    pub version: u64,
    pub subversion: String,
    pub relayfee: f64,
}

/// RPC client of the chain daemon.
#[trait_variant::make(Send)]
pub trait Daemon: Clone + Send + Sync + 'static {
    /// The raw transaction, or the daemon's verbose decoding of it.
    async fn get_raw_transaction(
        &self,
        tx_hash: &str,
        verbose: bool,
    ) -> Result<serde_json::Value, DaemonError>;

    async fn get_network_info(&self) -> Result<NetworkInfo, DaemonError>;

    /// The estimated fee rate per kilobyte, `None` if the daemon has no
    /// estimate for the given block target.
    async fn estimate_smart_fee(
        &self,
        number: u32,
        mode: Option<&str>,
    ) -> Result<Option<f64>, DaemonError>;

    /// Submit a raw transaction, returning its display-hex hash.
    async fn broadcast_transaction(&self, raw_tx: &[u8]) -> Result<String, DaemonError>;

    async fn list_addresses_by_asset(
        &self,
        asset: &str,
        only_total: bool,
        count: u32,
        start: u32,
    ) -> Result<serde_json::Value, DaemonError>;

    /// The most recently observed daemon height.
    fn cached_height(&self) -> Height;

    /// The daemon URL with credentials elided, for logs.
    fn logged_url(&self) -> String;

    /// Replace the daemon URL.
    fn set_url(&self, url: &str) -> Result<(), DaemonError>;
}
