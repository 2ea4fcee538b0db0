// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! Subscription status digests. Every status is either `None` or the
//! lowercase hex SHA-256 of a deterministic ASCII encoding of the underlying
//! state; clients are notified exactly when the digest changes. The
//! `*_string` functions build the encoding (whose length also prices the
//! request); [`status_hash`] digests it.

use crate::domain::{
    AssetMeta, BroadcastMessage, HistoryEntry, MempoolSummary, Qualification,
    QualifierAssociation, hash_to_hex,
};
use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// The lowercase hex SHA-256 of an ASCII status string.
pub fn status_hash(status: &str) -> String {
    const_hex::encode(Sha256::digest(status.as_bytes()))
}

/// Booleans are encoded the way the wire protocol has always shown them.
fn fmt_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// The status string of a script: confirmed history in database order, then
/// mempool transactions in mempool iteration order with height -1 for
/// unconfirmed inputs and 0 otherwise. Empty means no history at all, which
/// digests to a `None` status.
pub fn address_status_string(history: &[HistoryEntry], mempool: &[MempoolSummary]) -> String {
    let mut status = String::new();

    for HistoryEntry { tx_hash, height } in history {
        status.push_str(&format!("{}:{height}:", hash_to_hex(tx_hash)));
    }
    for summary in mempool {
        let height = -i64::from(summary.has_unconfirmed_inputs);
        status.push_str(&format!("{}:{height}:", hash_to_hex(&summary.hash)));
    }

    status
}

/// The status string of an asset, `None` when the asset does not exist.
pub fn asset_status_string(meta: Option<&AssetMeta>) -> Option<String> {
    meta.map(|meta| {
        let mut status = format!(
            "{}{}{}{}",
            meta.sats_in_circulation,
            meta.divisions,
            fmt_bool(meta.reissuable),
            fmt_bool(meta.has_ipfs),
        );
        if meta.has_ipfs
            && let Some(ipfs) = &meta.ipfs
        {
            status.push_str(ipfs);
        }

        status
    })
}

/// The status string of the tags granted by a qualifier or of the tags of an
/// h160. Keys (h160s or asset names) are consumed in ascending order.
pub fn tag_status_string(tags: &BTreeMap<String, Qualification>) -> Option<String> {
    if tags.is_empty() {
        return None;
    }

    let status = tags
        .iter()
        .map(|(key, tag)| {
            format!(
                "{key}:{}{}{}{}",
                tag.height,
                tag.tx_hash,
                tag.tx_pos,
                fmt_bool(tag.flag)
            )
        })
        .join(";");

    Some(status)
}

/// The status string of an asset's broadcast messages, ordered by height,
/// hash and position.
pub fn broadcasts_status_string(messages: &[BroadcastMessage]) -> Option<String> {
    if messages.is_empty() {
        return None;
    }

    let status = messages
        .iter()
        .sorted_by(|a, b| (a.height, &a.tx_hash, a.tx_pos).cmp(&(b.height, &b.tx_hash, b.tx_pos)))
        .map(|message| {
            format!(
                "{}:{}{}{}{}",
                message.tx_hash, message.height, message.tx_pos, message.data, message.expiration
            )
        })
        .join(";");

    Some(status)
}

/// The status string of the restricted assets associated with a qualifier.
/// Keys (restricted asset names) are consumed in ascending order.
pub fn qualifier_associations_status_string(
    associations: &BTreeMap<String, QualifierAssociation>,
) -> Option<String> {
    if associations.is_empty() {
        return None;
    }

    let status = associations
        .iter()
        .map(|(asset, assoc)| {
            format!(
                "{asset}:{}{}{}{}{}",
                assoc.height,
                assoc.tx_hash,
                assoc.restricted_tx_pos,
                assoc.qualifying_tx_pos,
                fmt_bool(assoc.associated)
            )
        })
        .join(";");

    Some(status)
}
