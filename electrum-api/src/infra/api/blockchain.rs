// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! Handlers for the `blockchain.*` and `mempool.*` method families.

use crate::{
    domain::{
        AssetFilter, Height, hash_to_hex,
        chain::{BlockProcessor, PeerManager},
        daemon::Daemon,
        mempool::Mempool,
        status,
        storage::Db,
    },
    infra::api::{
        jsonrpc::{
            HandlerError, HandlerResult, Params, RpcError, assert_boolean, assert_raw_bytes,
            assert_scripthash, assert_string, assert_tx_hash, check_asset, check_asset_str,
            non_negative_integer,
        },
        session::{MAX_CHUNK_SIZE, Session},
    },
};
use indexer_common::domain::HashX;
use log::info;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::Ordering;

/// Fee estimation modes accepted by `blockchain.estimatefee`; a whitelist so
/// unknown modes cannot force cache misses.
const ESTIMATEFEE_MODES: [Option<&str>; 3] = [None, Some("CONSERVATIVE"), Some("ECONOMICAL")];

fn parse_asset_filter(value: Option<Value>) -> Result<AssetFilter, RpcError> {
    match value {
        None | Some(Value::Bool(false)) | Some(Value::Null) => Ok(AssetFilter::BaseOnly),
        Some(Value::Bool(true)) => Ok(AssetFilter::All),
        Some(Value::String(asset)) => {
            check_asset_str(&asset)?;
            Ok(AssetFilter::Single(asset))
        }
        Some(Value::Array(assets)) => {
            let assets = assets
                .into_iter()
                .map(|asset| match asset {
                    Value::Null => Ok(None),
                    Value::String(asset) => {
                        check_asset_str(&asset)?;
                        Ok(Some(asset))
                    }
                    _ => Err(RpcError::bad_request("asset must be a list, string, or boolean")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AssetFilter::Selection(assets))
        }
        Some(_) => Err(RpcError::bad_request(
            "asset must be a list, string, or boolean",
        )),
    }
}

impl<D, M, R, P, B> Session<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    // --- Address statuses

    /// The status of a script, updating the mempool-derived status record:
    /// an entry is present exactly when the last status depended on at least
    /// one mempool transaction.
    pub(crate) async fn address_status(&self, hashx: HashX) -> Result<Option<String>, HandlerError> {
        let (history, cost) = self.manager.limited_history(hashx).await?;
        let mempool = self.manager.mempool().transaction_summaries(hashx).await;

        let status_string = status::address_status_string(&history, &mempool);
        self.bump_cost(cost + 0.1 + status_string.len() as f64 * 0.000_02);

        let status = (!status_string.is_empty()).then(|| status::status_hash(&status_string));

        {
            let mut state = self.state.lock();
            if mempool.is_empty() {
                state.mempool_statuses.remove(&hashx);
            } else {
                state.mempool_statuses.insert(hashx, status.clone());
            }
        }

        Ok(status)
    }

    /// As [`Self::address_status`], but a status that cannot be computed
    /// discards the subscription.
    pub(crate) async fn subscription_address_status(&self, hashx: HashX) -> Option<String> {
        match self.address_status(hashx).await {
            Ok(status) => status,
            Err(_) => {
                self.unsubscribe_hashx(hashx);
                None
            }
        }
    }

    pub(crate) fn unsubscribe_hashx(&self, hashx: HashX) -> Option<String> {
        let mut state = self.state.lock();
        state.mempool_statuses.remove(&hashx);
        state.hashx_subs.remove(&hashx)
    }

    pub(crate) async fn scripthash_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let scripthash = reader.required("scripthash")?;
        reader.finish()?;

        let alias = assert_string(&scripthash)?;
        let hashx = assert_scripthash(&scripthash)?;

        // Store the subscription only after the status succeeds.
        let status = self.address_status(hashx).await?;
        self.state.lock().hashx_subs.insert(hashx, alias);

        Ok(json!(status))
    }

    pub(crate) async fn scripthash_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let scripthash = reader.required("scripthash")?;
        reader.finish()?;

        self.bump_cost(0.1);
        let hashx = assert_scripthash(&scripthash)?;

        Ok(json!(self.unsubscribe_hashx(hashx).is_some()))
    }

    // --- Histories and balances

    async fn unconfirmed_history(&self, hashx: HashX) -> Vec<Value> {
        let summaries = self.manager.mempool().transaction_summaries(hashx).await;
        self.bump_cost(0.25 + summaries.len() as f64 / 50.0);

        summaries
            .iter()
            .map(|summary| {
                json!({
                    "tx_hash": hash_to_hex(&summary.hash),
                    "height": -i64::from(summary.has_unconfirmed_inputs),
                    "fee": summary.fee,
                })
            })
            .collect()
    }

    pub(crate) async fn scripthash_get_history(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let scripthash = reader.required("scripthash")?;
        reader.finish()?;
        let hashx = assert_scripthash(&scripthash)?;

        let (history, cost) = self.manager.limited_history(hashx).await?;
        self.bump_cost(cost);

        let mut entries = history
            .iter()
            .map(|entry| {
                json!({ "tx_hash": hash_to_hex(&entry.tx_hash), "height": entry.height })
            })
            .collect::<Vec<_>>();
        entries.extend(self.unconfirmed_history(hashx).await);

        Ok(Value::Array(entries))
    }

    pub(crate) async fn scripthash_get_mempool(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let scripthash = reader.required("scripthash")?;
        reader.finish()?;
        let hashx = assert_scripthash(&scripthash)?;

        Ok(Value::Array(self.unconfirmed_history(hashx).await))
    }

    pub(crate) async fn scripthash_get_balance(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let scripthash = reader.required("scripthash")?;
        let filter = parse_asset_filter(reader.optional("asset"))?;
        reader.finish()?;
        let hashx = assert_scripthash(&scripthash)?;

        let utxos = self.manager.db().all_utxos(hashx, &filter).await?;
        let mut confirmed = HashMap::<Option<String>, u64>::new();
        for utxo in &utxos {
            *confirmed.entry(utxo.asset.clone()).or_default() += utxo.value;
        }
        let unconfirmed = self.manager.mempool().balance_delta(hashx, &filter).await;
        self.bump_cost(1.0 + utxos.len() as f64 / 50.0);

        if filter.include_names() {
            let must_have = match &filter {
                AssetFilter::Selection(assets) => assets.clone(),
                _ => Vec::new(),
            };
            let names = confirmed
                .keys()
                .chain(unconfirmed.keys())
                .cloned()
                .chain(must_have)
                .collect::<BTreeSet<_>>();

            let base = self.manager.application_config().ticker.clone();
            let balances = names
                .into_iter()
                .map(|name| {
                    let key = name.clone().unwrap_or_else(|| base.clone());
                    let value = json!({
                        "confirmed": confirmed.get(&name).copied().unwrap_or_default(),
                        "unconfirmed": unconfirmed.get(&name).copied().unwrap_or_default(),
                    });
                    (key, value)
                })
                .collect::<serde_json::Map<_, _>>();

            Ok(Value::Object(balances))
        } else {
            let confirmed = confirmed.values().next().copied().unwrap_or_default();
            let unconfirmed = unconfirmed.values().next().copied().unwrap_or_default();
            Ok(json!({ "confirmed": confirmed, "unconfirmed": unconfirmed }))
        }
    }

    pub(crate) async fn scripthash_listunspent(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let scripthash = reader.required("scripthash")?;
        let filter = parse_asset_filter(reader.optional("asset"))?;
        reader.finish()?;
        let hashx = assert_scripthash(&scripthash)?;

        let mut utxos = self.manager.db().all_utxos(hashx, &filter).await?;
        utxos.sort_by(|a, b| {
            (a.height, a.tx_pos, a.tx_hash).cmp(&(b.height, b.tx_pos, b.tx_hash))
        });
        utxos.extend(self.manager.mempool().unordered_utxos(hashx, &filter).await);
        self.bump_cost(1.0 + utxos.len() as f64 / 50.0);

        let spends = self.manager.mempool().potential_spends(hashx).await;

        let unspent = utxos
            .iter()
            .filter(|utxo| !spends.contains(&(utxo.tx_hash, utxo.tx_pos)))
            .map(|utxo| {
                json!({
                    "tx_hash": hash_to_hex(&utxo.tx_hash),
                    "tx_pos": utxo.tx_pos,
                    "height": utxo.height,
                    "asset": utxo.asset,
                    "value": utxo.value,
                })
            })
            .collect();

        Ok(Value::Array(unspent))
    }

    // --- Headers

    pub(crate) async fn headers_subscribe(&self) -> HandlerResult {
        self.state.lock().subscribe_headers = true;
        self.bump_cost(0.25);
        Ok(self.manager.hsub_results())
    }

    async fn merkle_proof(&self, cp_height: Height, height: Height) -> Result<Value, HandlerError> {
        let max_height = self.manager.db().height();
        if !(height <= cp_height && cp_height <= max_height) {
            return Err(RpcError::bad_request(format!(
                "require header height {height} <= cp_height {cp_height} <= chain height {max_height}"
            ))
            .into());
        }

        let (branch, root) = self
            .manager
            .db()
            .header_branch_and_root(cp_height as usize + 1, height)
            .await?;

        Ok(json!({
            "branch": branch.iter().map(|hash| hash_to_hex(hash)).collect::<Vec<_>>(),
            "root": hash_to_hex(&root),
        }))
    }

    pub(crate) async fn block_header(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let height = non_negative_integer(&reader.required("height")?)? as Height;
        let cp_height = reader
            .optional("cp_height")
            .map(|value| non_negative_integer(&value))
            .transpose()?
            .unwrap_or_default() as Height;
        reader.finish()?;

        let raw_header_hex = self.manager.raw_header(height).await?.to_string();
        self.bump_cost(if cp_height == 0 { 0.25 } else { 1.25 });

        if cp_height == 0 {
            return Ok(json!(raw_header_hex));
        }

        let mut result = json!({ "header": raw_header_hex });
        let proof = self.merkle_proof(cp_height, height).await?;
        result
            .as_object_mut()
            .expect("result is an object")
            .extend(proof.as_object().expect("proof is an object").clone());
        Ok(result)
    }

    pub(crate) async fn block_headers(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let start_height = non_negative_integer(&reader.required("start_height")?)? as Height;
        let count = non_negative_integer(&reader.required("count")?)? as usize;
        let cp_height = reader
            .optional("cp_height")
            .map(|value| non_negative_integer(&value))
            .transpose()?
            .unwrap_or_default() as Height;
        reader.finish()?;

        let mut cost = count as f64 / 50.0;

        let count = count.min(MAX_CHUNK_SIZE);
        let (headers, count) = self.manager.db().read_headers(start_height, count).await?;
        let mut result = json!({
            "hex": headers.to_string(),
            "count": count,
            "max": MAX_CHUNK_SIZE,
        });

        if count > 0 && cp_height > 0 {
            cost += 1.0;
            let last_height = start_height + count as Height - 1;
            let proof = self.merkle_proof(cp_height, last_height).await?;
            result
                .as_object_mut()
                .expect("result is an object")
                .extend(proof.as_object().expect("proof is an object").clone());
        }
        self.bump_cost(cost);

        Ok(result)
    }

    // --- Fees

    pub(crate) async fn estimatefee(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let number = non_negative_integer(&reader.required("number")?)? as u32;
        let mode = reader
            .optional("mode")
            .filter(|mode| !mode.is_null())
            .map(|mode| assert_string(&mode))
            .transpose()?;
        reader.finish()?;

        if !ESTIMATEFEE_MODES.contains(&mode.as_deref()) {
            return Err(RpcError::bad_request(format!(
                "unknown estimatefee mode: {}",
                mode.as_deref().unwrap_or("None")
            ))
            .into());
        }
        self.bump_cost(0.1);

        let (feerate, cost) = self.manager.estimate_fee(number, mode.as_deref()).await?;
        self.bump_cost(cost);

        Ok(json!(feerate))
    }

    pub(crate) async fn relayfee(&self) -> HandlerResult {
        self.bump_cost(2.0);
        let network_info = self.manager.daemon().get_network_info().await?;
        Ok(json!(network_info.relayfee))
    }

    pub(crate) async fn fee_histogram(&self) -> HandlerResult {
        self.bump_cost(1.0);
        let histogram = self.manager.mempool().compact_fee_histogram().await;
        Ok(json!(histogram))
    }

    // --- Transactions

    pub(crate) async fn transaction_get(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let tx_hash = reader.required("tx_hash")?;
        let verbose = reader
            .optional("verbose")
            .filter(|verbose| !verbose.is_null())
            .map(|verbose| assert_boolean(&verbose))
            .transpose()?
            .unwrap_or_default();
        reader.finish()?;

        assert_tx_hash(&tx_hash)?;
        let tx_hash = assert_string(&tx_hash)?;

        self.bump_cost(1.0);
        let raw_tx = self
            .manager
            .daemon()
            .get_raw_transaction(&tx_hash, verbose)
            .await?;
        Ok(raw_tx)
    }

    pub(crate) async fn transaction_broadcast(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let raw_tx_param = reader.required("raw_tx")?;
        reader.finish()?;

        let raw_tx = assert_raw_bytes(&raw_tx_param)?;
        let raw_tx_hex = assert_string(&raw_tx_param)?;
        self.bump_cost(0.25 + raw_tx_hex.len() as f64 / 5000.0);

        match self.manager.broadcast_transaction(&raw_tx).await {
            Ok(hex_hash) => {
                self.txs_sent.fetch_add(1, Ordering::Relaxed);
                info!(conn_id = self.id(); "sent tx: {hex_hash}");
                Ok(json!(hex_hash))
            }

            Err(error) => {
                info!(conn_id = self.id(); "error sending transaction: {error}");
                Err(RpcError::bad_request(format!(
                    "the transaction was rejected by network rules.\n\n{error}\n[{raw_tx_hex}]"
                ))
                .into())
            }
        }
    }

    pub(crate) async fn transaction_merkle(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let tx_hash = assert_tx_hash(&reader.required("tx_hash")?)?;
        let height = non_negative_integer(&reader.required("height")?)? as Height;
        reader.finish()?;

        let (branch, tx_pos, cost) = self
            .manager
            .merkle_branch_for_tx_hash(height, tx_hash)
            .await?;
        self.bump_cost(cost);

        Ok(json!({ "block_height": height, "merkle": branch, "pos": tx_pos }))
    }

    pub(crate) async fn transaction_tsc_merkle(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let tx_hash = assert_tx_hash(&reader.required("tx_hash")?)?;
        let height = non_negative_integer(&reader.required("height")?)? as Height;
        let txid_or_tx = reader
            .optional("txid_or_tx")
            .map(|value| assert_string(&value))
            .transpose()?
            .unwrap_or_else(|| "txid".to_string());
        let target_type = reader
            .optional("target_type")
            .map(|value| assert_string(&value))
            .transpose()?
            .unwrap_or_else(|| "block_hash".to_string());
        reader.finish()?;

        let (proof, cost) = self
            .manager
            .tsc_merkle_proof_for_tx_hash(height, tx_hash, &txid_or_tx, &target_type)
            .await?;
        self.bump_cost(cost);

        Ok(json!({
            "index": proof.index,
            "txOrId": proof.txid_or_tx,
            "target": proof.target,
            // "*" stands for a duplicated hash.
            "nodes": proof.nodes,
            "targetType": target_type,
            // The "tree" and composite proof options are not supported.
            "proofType": "branch",
            "composite": false,
        }))
    }

    pub(crate) async fn transaction_id_from_pos(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let height = non_negative_integer(&reader.required("height")?)? as Height;
        let tx_pos = non_negative_integer(&reader.required("tx_pos")?)? as usize;
        let merkle = reader
            .optional("merkle")
            .filter(|merkle| !merkle.is_null())
            .map(|merkle| assert_boolean(&merkle))
            .transpose()?
            .unwrap_or_default();
        reader.finish()?;

        if merkle {
            let (branch, tx_hash, cost) =
                self.manager.merkle_branch_for_tx_pos(height, tx_pos).await?;
            self.bump_cost(cost);
            Ok(json!({ "tx_hash": tx_hash, "merkle": branch }))
        } else {
            let (tx_hashes, cost) = self.manager.tx_hashes_at_blockheight(height).await?;
            let tx_hash = tx_hashes.get(tx_pos).ok_or_else(|| {
                RpcError::bad_request(format!(
                    "no tx at position {tx_pos} in block at height {height}"
                ))
            })?;
            self.bump_cost(cost);
            Ok(json!(hash_to_hex(tx_hash)))
        }
    }

    pub(crate) async fn list_addresses_by_asset(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        let only_total = reader
            .optional("onlytotal")
            .map(|value| assert_boolean(&value))
            .transpose()?
            .unwrap_or_default();
        let count = reader
            .optional("count")
            .map(|value| non_negative_integer(&value))
            .transpose()?
            .unwrap_or(1000);
        let start = reader
            .optional("start")
            .map(|value| non_negative_integer(&value))
            .transpose()?
            .unwrap_or_default();
        reader.finish()?;

        if count > 1000 || count < 1 {
            return Err(RpcError::bad_request(
                "\"count\" must be an integer with a maximum value of 1000 and a minimum value of 1",
            )
            .into());
        }

        let result = self
            .manager
            .daemon()
            .list_addresses_by_asset(&asset, only_total, count as u32, start as u32)
            .await?;

        let (result, result_count) = if only_total {
            (json!({ "unique_addresses": result }), 1)
        } else {
            let result_count = result.as_object().map(|o| o.len()).unwrap_or(1);
            (result, result_count)
        };
        self.bump_cost(result_count as f64 * 2.0);

        Ok(result)
    }
}
