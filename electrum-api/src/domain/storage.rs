// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use crate::domain::{
    AssetFilter, AssetMeta, AssetMetaEvent, AssociationEvent, BroadcastMessage, FrozenEntry,
    H160Qualification, Height, HistoryEntry, Qualification, QualifierAssociation,
    QualifierQualification, Utxo, VerifierString,
};
use indexer_common::domain::{ByteArray, ByteVec, H160, HashX, MerkleRoot, TxHash};
use std::collections::BTreeMap;
use thiserror::Error;

/// A node of a merkle branch. `Duplicate` marks the odd-level sentinel that
/// only appears in TSC-format proofs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerkleNode {
    Hash(ByteArray<32>),
    Duplicate,
}

#[derive(Debug, Clone, Error)]
#[error("database error: {0}")]
pub struct DbError(pub String);

/// Read access to the indexed database.
///
/// All hex string fields of returned records are in display order.
#[trait_variant::make(Send)]
pub trait Db: Clone + Send + Sync + 'static {
    /// The indexed chain height.
    fn height(&self) -> Height;

    /// The number of history flushes so far.
    fn flush_count(&self) -> u64;

    /// The raw header at the given height, `None` if out of range.
    async fn raw_header(&self, height: Height) -> Result<Option<ByteVec>, DbError>;

    /// Up to `count` concatenated raw headers starting at `start`, and how
    /// many were actually read.
    async fn read_headers(&self, start: Height, count: usize) -> Result<(ByteVec, usize), DbError>;

    /// The merkle branch and root proving the header at `height` within the
    /// chain of the given length.
    async fn header_branch_and_root(
        &self,
        length: usize,
        height: Height,
    ) -> Result<(Vec<ByteArray<32>>, MerkleRoot), DbError>;

    /// The ordered transaction hashes of the block at the given height.
    async fn tx_hashes_at_blockheight(&self, height: Height) -> Result<Vec<TxHash>, DbError>;

    /// The branch and root for the transaction at `tx_pos` of a block with
    /// the given transaction hashes. This is the merkle primitive; the
    /// session layer only adds caching on top.
    async fn merkle_branch_and_root(
        &self,
        tx_hashes: &[TxHash],
        tx_pos: usize,
        tsc_format: bool,
    ) -> Result<(Vec<MerkleNode>, MerkleRoot), DbError>;

    /// At most `limit` confirmed history entries of a script, in database
    /// order.
    async fn limited_history(
        &self,
        hashx: HashX,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, DbError>;

    /// All confirmed UTXOs of a script, filtered by asset.
    async fn all_utxos(&self, hashx: HashX, filter: &AssetFilter) -> Result<Vec<Utxo>, DbError>;

    async fn lookup_asset_meta(&self, asset: &str) -> Result<Option<AssetMeta>, DbError>;

    async fn lookup_asset_meta_history(&self, asset: &str)
    -> Result<Vec<AssetMetaEvent>, DbError>;

    /// Asset names starting with the given prefix.
    async fn assets_with_prefix(&self, prefix: &str) -> Result<Vec<String>, DbError>;

    /// Broadcast messages of an asset.
    async fn lookup_messages(&self, asset: &str) -> Result<Vec<BroadcastMessage>, DbError>;

    /// Current qualifications granted by a qualifier, keyed by display-hex
    /// h160.
    async fn qualifications_for_qualifier(
        &self,
        asset: &str,
    ) -> Result<BTreeMap<String, Qualification>, DbError>;

    async fn qualifications_for_qualifier_history(
        &self,
        asset: &str,
    ) -> Result<Vec<QualifierQualification>, DbError>;

    /// Current qualifications of an h160, keyed by asset name.
    async fn qualifications_for_h160(
        &self,
        h160: H160,
    ) -> Result<BTreeMap<String, Qualification>, DbError>;

    async fn qualifications_for_h160_history(
        &self,
        h160: H160,
    ) -> Result<Vec<H160Qualification>, DbError>;

    async fn is_h160_qualified(&self, h160: H160, asset: &str) -> Result<bool, DbError>;

    /// The current freeze state of a restricted asset, `None` if never
    /// frozen.
    async fn is_restricted_frozen(&self, asset: &str) -> Result<Option<FrozenEntry>, DbError>;

    async fn restricted_frozen_history(&self, asset: &str) -> Result<Vec<FrozenEntry>, DbError>;

    /// The current verifier string of a restricted asset.
    async fn restricted_string(&self, asset: &str) -> Result<Option<VerifierString>, DbError>;

    async fn restricted_string_history(&self, asset: &str)
    -> Result<Vec<VerifierString>, DbError>;

    /// Restricted assets associated with a qualifier, keyed by restricted
    /// asset name.
    async fn qualifier_associations(
        &self,
        qualifier: &str,
    ) -> Result<BTreeMap<String, QualifierAssociation>, DbError>;

    async fn qualifier_associations_history(
        &self,
        qualifier: &str,
    ) -> Result<Vec<AssociationEvent>, DbError>;
}
