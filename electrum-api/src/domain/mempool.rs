// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{
    AssetFilter, AssetMeta, BroadcastMessage, FrozenEntry, MempoolReissue, MempoolSummary,
    Qualification, QualifierAssociation, Utxo, VerifierString,
};
use indexer_common::domain::{H160, HashX, TxHash};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Read access to the mempool index.
#[trait_variant::make(Send)]
pub trait Mempool: Clone + Send + Sync + 'static {
    /// Summaries of mempool transactions touching a script. The order is the
    /// mempool's own iteration order; address status digests depend on it.
    async fn transaction_summaries(&self, hashx: HashX) -> Vec<MempoolSummary>;

    /// Unordered mempool UTXOs of a script, filtered by asset.
    async fn unordered_utxos(&self, hashx: HashX, filter: &AssetFilter) -> Vec<Utxo>;

    /// Outpoints a mempool transaction might spend from the script.
    async fn potential_spends(&self, hashx: HashX) -> HashSet<(TxHash, u32)>;

    /// Unconfirmed balance change per asset; `None` keys the base currency.
    async fn balance_delta(
        &self,
        hashx: HashX,
        filter: &AssetFilter,
    ) -> HashMap<Option<String>, i64>;

    /// Metadata of an asset created in the mempool, if any.
    async fn asset_creation_if_any(&self, asset: &str) -> Option<AssetMeta>;

    /// A pending reissue of an asset, if any.
    async fn asset_reissues_if_any(&self, asset: &str) -> Option<MempoolReissue>;

    /// Unconfirmed broadcast messages of an asset, newest first.
    async fn broadcasts(&self, asset: &str) -> Vec<BroadcastMessage>;

    /// Unconfirmed tag changes of an h160, keyed by asset name.
    async fn h160_tags(&self, h160: H160) -> BTreeMap<String, Qualification>;

    /// Unconfirmed tag changes granted by a qualifier, keyed by display-hex
    /// h160.
    async fn qualifier_tags(&self, qualifier: &str) -> BTreeMap<String, Qualification>;

    /// An unconfirmed freeze state change of a restricted asset, if any.
    async fn is_frozen(&self, asset: &str) -> Option<FrozenEntry>;

    /// An unconfirmed verifier string change of a restricted asset, if any.
    async fn restricted_verifier(&self, asset: &str) -> Option<VerifierString>;

    /// Restricted assets whose unconfirmed verifier string references the
    /// qualifier, keyed by restricted asset name.
    async fn restricted_assets_associated_with_qualifier(
        &self,
        qualifier: &str,
    ) -> BTreeMap<String, QualifierAssociation>;

    /// The compact fee histogram as `[fee_rate, virtual_size]` pairs.
    async fn compact_fee_histogram(&self) -> Vec<(f64, u64)>;
}
