// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

pub mod chain;
pub mod cost;
pub mod daemon;
pub mod mempool;
pub mod status;
pub mod storage;

use indexer_common::domain::{HASHX_LEN, HashX, HexDecodeError, TxHash};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type Height = u32;

/// A confirmed history entry in database order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub tx_hash: TxHash,
    pub height: Height,
}

/// A mempool transaction touching some script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MempoolSummary {
    pub hash: TxHash,
    pub fee: u64,
    pub has_unconfirmed_inputs: bool,
}

/// A spendable output; `height` is zero for mempool outputs and `asset` is
/// `None` for the base currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub tx_hash: TxHash,
    pub tx_pos: u32,
    pub height: Height,
    pub value: u64,
    pub asset: Option<String>,
}

/// Asset selection for balance and UTXO queries: the base currency only, every
/// asset, a single asset, or an explicit selection (where `None` selects the
/// base currency).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetFilter {
    BaseOnly,
    All,
    Single(String),
    Selection(Vec<Option<String>>),
}

impl AssetFilter {
    /// Whether results should be keyed by asset name. A single named asset
    /// keeps the flat result shape; any list form keys by name.
    pub fn include_names(&self) -> bool {
        matches!(self, AssetFilter::All | AssetFilter::Selection(_))
    }
}

/// The provenance of an asset metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSource {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
}

/// Current metadata of an asset. Hex strings are in display order as produced
/// by the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMeta {
    pub sats_in_circulation: u64,
    pub divisions: u8,
    pub reissuable: bool,
    pub has_ipfs: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipfs: Option<String>,
    pub source: AssetSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_divisions: Option<AssetSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ipfs: Option<AssetSource>,
}

/// A single metadata change of an asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssetMetaEvent {
    pub sats: u64,
    pub divisions: u8,
    pub has_ipfs: bool,
    pub ipfs: Option<String>,
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
}

/// A pending reissue in the mempool. `divisions == 0xff` means unchanged.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MempoolReissue {
    pub sats_in_circulation: u64,
    pub divisions: u8,
    pub reissuable: bool,
    pub has_ipfs: bool,
    pub ipfs: Option<String>,
    pub source: AssetSource,
}

/// A tag qualification; keyed externally by h160 or asset name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qualification {
    pub flag: bool,
    pub height: i64,
    pub tx_hash: String,
    pub tx_pos: u32,
}

/// A qualification event for a qualifier, with the tagged h160 inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualifierQualification {
    pub h160: String,
    pub flag: bool,
    pub height: i64,
    pub tx_hash: String,
    pub tx_pos: u32,
}

/// A qualification event for an h160, with the qualifying asset inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct H160Qualification {
    pub asset: String,
    pub flag: bool,
    pub height: i64,
    pub tx_hash: String,
    pub tx_pos: u32,
}

/// An asset broadcast message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastMessage {
    pub tx_hash: String,
    pub data: String,
    pub expiration: i64,
    pub height: i64,
    pub tx_pos: u32,
}

/// Freeze state of a restricted asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrozenEntry {
    pub frozen: bool,
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
}

/// Verifier string record of a restricted asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifierString {
    pub string: String,
    pub tx_hash: String,
    pub restricted_tx_pos: u32,
    pub qualifying_tx_pos: u32,
    pub height: i64,
}

/// Association of a restricted asset with a qualifier; keyed externally by the
/// restricted asset name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualifierAssociation {
    pub associated: bool,
    pub height: i64,
    pub tx_hash: String,
    pub restricted_tx_pos: u32,
    pub qualifying_tx_pos: u32,
}

/// An association event for a qualifier, with the restricted asset inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssociationEvent {
    pub asset: String,
    pub associated: bool,
    pub height: i64,
    pub tx_hash: String,
    pub restricted_tx_pos: u32,
    pub qualifying_tx_pos: u32,
}

/// Everything touched by a chain update, by subscription topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Touched {
    pub hashxs: HashSet<HashX>,
    pub assets: HashSet<String>,
    pub qualifier_tags: HashSet<String>,
    pub h160_tags: HashSet<indexer_common::domain::H160>,
    pub broadcasts: HashSet<String>,
    pub freezes: HashSet<String>,
    pub verifiers: HashSet<String>,
    pub qualifier_associations: HashSet<String>,
}

/// One notification from the block processor: the new daemon height and the
/// state touched since the last notification.
#[derive(Debug, Clone, Default)]
pub struct ChainNotification {
    pub height: Height,
    pub touched: Touched,
}

/// Convert an internal transaction hash to its display hex form (byte
/// reversed, as clients expect).
pub fn hash_to_hex(hash: &TxHash) -> String {
    let mut bytes = *hash.as_bytes();
    bytes.reverse();
    const_hex::encode(bytes)
}

/// Parse a display-hex transaction hash into its internal byte order.
pub fn hex_to_hash(s: &str) -> Result<TxHash, HexDecodeError> {
    let mut hash: TxHash = s.parse()?;
    hash.0.reverse();
    Ok(hash)
}

/// Derive the per-script key from a display-hex script hash: the internal
/// byte order truncated to eleven bytes.
pub fn scripthash_to_hashx(scripthash: &str) -> Option<HashX> {
    let hash = hex_to_hash(scripthash).ok()?;
    HashX::try_from(&hash.as_bytes()[..HASHX_LEN]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xab;
        let hash = TxHash::from(bytes);

        let hex = hash_to_hex(&hash);
        assert!(hex.ends_with("ab"));
        assert_eq!(hex_to_hash(&hex).unwrap(), hash);
    }

    #[test]
    fn test_scripthash_to_hashx() {
        let scripthash = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let hashx = scripthash_to_hashx(scripthash).unwrap();
        // Internal order is reversed, so the key starts with the last bytes.
        assert_eq!(hashx.as_bytes()[0], 0xff);
        assert_eq!(hashx.as_bytes().len(), 11);

        assert!(scripthash_to_hashx("not hex").is_none());
        assert!(scripthash_to_hashx("abcd").is_none());
    }

    #[test]
    fn test_asset_filter_include_names() {
        assert!(!AssetFilter::BaseOnly.include_names());
        assert!(AssetFilter::All.include_names());
        assert!(!AssetFilter::Single("A".to_string()).include_names());
        assert!(AssetFilter::Selection(vec![Some("A".to_string())]).include_names());
    }
}
