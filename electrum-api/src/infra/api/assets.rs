// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! Handlers for the asset, tag, qualifier and restricted-asset method
//! families, including their subscription endpoints and status digests.

use crate::{
    domain::{
        AssetMeta, AssetMetaEvent, AssociationEvent, H160Qualification, Qualification,
        QualifierAssociation, QualifierQualification, status,
        chain::{BlockProcessor, PeerManager},
        daemon::Daemon,
        mempool::Mempool,
        storage::Db,
    },
    infra::api::{
        jsonrpc::{
            HandlerError, HandlerResult, Params, RpcError, assert_boolean, check_asset,
            check_asset_str, check_h160,
        },
        session::Session,
    },
};
use indexer_common::domain::H160;
use regex::Regex;
use serde_json::json;
use std::{collections::BTreeMap, sync::LazyLock};

/// Qualifier names as they appear inside verifier strings.
static VERIFIER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z0-9_.]+").expect("valid regex"));

fn require_restricted(asset: &str) -> Result<(), RpcError> {
    if !asset.starts_with('$') {
        return Err(RpcError::bad_request(format!(
            "{asset} is not a restricted asset"
        )));
    }
    Ok(())
}

fn require_qualifier(asset: &str) -> Result<(), RpcError> {
    if !asset.starts_with('#') {
        return Err(RpcError::bad_request(format!("{asset} is not a qualifier")));
    }
    Ok(())
}

/// Merge a pending mempool reissue into saved metadata.
fn merged_asset_meta(saved: AssetMeta, reissue: crate::domain::MempoolReissue) -> AssetMeta {
    let divisions_unchanged = reissue.divisions == 0xff;
    let has_ipfs = reissue.has_ipfs || saved.has_ipfs;

    let ipfs = has_ipfs
        .then(|| reissue.ipfs.clone().or_else(|| saved.ipfs.clone()))
        .flatten();

    let source_divisions = divisions_unchanged
        .then(|| saved.source_divisions.clone().or_else(|| Some(saved.source.clone())))
        .flatten();

    let source_ipfs = (!reissue.has_ipfs && saved.has_ipfs)
        .then(|| saved.source_ipfs.clone().or_else(|| Some(saved.source.clone())))
        .flatten();

    AssetMeta {
        sats_in_circulation: saved.sats_in_circulation + reissue.sats_in_circulation,
        divisions: if divisions_unchanged {
            saved.divisions
        } else {
            reissue.divisions
        },
        reissuable: reissue.reissuable,
        has_ipfs,
        ipfs,
        source: reissue.source,
        source_divisions,
        source_ipfs,
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
    fn read_asset_and_mempool_flag(params: Params) -> Result<(String, bool), RpcError> {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        let include_mempool = reader
            .optional("include_mempool")
            .filter(|value| !value.is_null())
            .map(|value| assert_boolean(&value))
            .transpose()?
            .unwrap_or(true);
        reader.finish()?;
        Ok((asset, include_mempool))
    }

    // --- Asset metadata

    pub(crate) async fn asset_get_meta_inner(
        &self,
        asset: &str,
        include_mempool: bool,
    ) -> Result<Option<AssetMeta>, HandlerError> {
        let mempool = self.manager.mempool();

        if include_mempool
            && let Some(created) = mempool.asset_creation_if_any(asset).await
        {
            return Ok(Some(created));
        }

        let saved = self.manager.db().lookup_asset_meta(asset).await?;
        if include_mempool
            && let Some(saved) = &saved
            && let Some(reissue) = mempool.asset_reissues_if_any(asset).await
        {
            return Ok(Some(merged_asset_meta(saved.clone(), reissue)));
        }

        Ok(saved)
    }

    pub(crate) async fn asset_get_meta(&self, params: Params) -> HandlerResult {
        self.bump_cost(1.0);
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        let meta = self.asset_get_meta_inner(&asset, include_mempool).await?;
        Ok(json!(meta))
    }

    pub(crate) async fn asset_get_meta_history(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;

        let mut events = self.manager.db().lookup_asset_meta_history(&asset).await?;
        self.bump_cost(1.0 + events.len() as f64 / 30.0);

        if include_mempool {
            let mempool = self.manager.mempool();
            let pending = match mempool.asset_reissues_if_any(&asset).await {
                Some(reissue) => Some(AssetMetaEvent {
                    sats: reissue.sats_in_circulation,
                    divisions: reissue.divisions,
                    has_ipfs: reissue.has_ipfs,
                    ipfs: reissue.ipfs,
                    tx_hash: reissue.source.tx_hash,
                    tx_pos: reissue.source.tx_pos,
                    height: reissue.source.height,
                }),
                None => mempool.asset_creation_if_any(&asset).await.map(|created| {
                    AssetMetaEvent {
                        sats: created.sats_in_circulation,
                        divisions: created.divisions,
                        has_ipfs: created.has_ipfs,
                        ipfs: created.ipfs,
                        tx_hash: created.source.tx_hash,
                        tx_pos: created.source.tx_pos,
                        height: created.source.height,
                    }
                }),
            };
            events.extend(pending);
        }

        Ok(json!(events))
    }

    pub(crate) async fn assets_with_prefix(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let prefix = check_asset(&reader.required("prefix")?)?;
        reader.finish()?;

        let assets = self.manager.db().assets_with_prefix(&prefix).await?;
        self.bump_cost(1.0 + assets.len() as f64 / 10.0);
        Ok(json!(assets))
    }

    // --- Broadcast messages

    pub(crate) async fn get_messages_inner(
        &self,
        asset: &str,
    ) -> Result<Vec<crate::domain::BroadcastMessage>, HandlerError> {
        check_asset_str(asset)?;
        let mut saved = self.manager.db().lookup_messages(asset).await?;
        self.bump_cost(1.0 + saved.len() as f64 / 10.0);

        let pending = self.manager.mempool().broadcasts(asset).await;
        saved.sort_by(|a, b| (b.height, &b.tx_hash).cmp(&(a.height, &a.tx_hash)));

        let mut messages = pending;
        messages.extend(saved);
        Ok(messages)
    }

    pub(crate) async fn get_messages(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        let messages = self.get_messages_inner(&asset).await?;
        Ok(json!(messages))
    }

    // --- Tags and qualifications

    pub(crate) async fn is_qualified(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let h160 = check_h160(&reader.required("h160")?)?;
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        self.bump_cost(1.0);
        let qualified = self.manager.db().is_h160_qualified(h160, &asset).await?;
        Ok(json!(qualified))
    }

    pub(crate) async fn qualifications_for_h160_inner(
        &self,
        h160: H160,
        include_mempool: bool,
    ) -> Result<BTreeMap<String, Qualification>, HandlerError> {
        let mut qualifications = self.manager.db().qualifications_for_h160(h160).await?;
        self.bump_cost(1.0 + qualifications.len() as f64 / 10.0);

        if include_mempool {
            for (asset, tag) in self.manager.mempool().h160_tags(h160).await {
                qualifications.insert(asset, tag);
            }
        }

        Ok(qualifications)
    }

    pub(crate) async fn qualifications_for_h160(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let h160 = check_h160(&reader.required("h160")?)?;
        let include_mempool = reader
            .optional("include_mempool")
            .filter(|value| !value.is_null())
            .map(|value| assert_boolean(&value))
            .transpose()?
            .unwrap_or(true);
        reader.finish()?;

        let qualifications = self.qualifications_for_h160_inner(h160, include_mempool).await?;
        Ok(json!(qualifications))
    }

    pub(crate) async fn qualifications_for_h160_history(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let h160 = check_h160(&reader.required("h160")?)?;
        let include_mempool = reader
            .optional("include_mempool")
            .filter(|value| !value.is_null())
            .map(|value| assert_boolean(&value))
            .transpose()?
            .unwrap_or(true);
        reader.finish()?;

        let mut events = self
            .manager
            .db()
            .qualifications_for_h160_history(h160)
            .await?;
        self.bump_cost(2.0 + events.len() as f64 / 30.0);

        if include_mempool {
            let pending = self.manager.mempool().h160_tags(h160).await;
            events.extend(pending.into_iter().map(|(asset, tag)| H160Qualification {
                asset,
                flag: tag.flag,
                height: tag.height,
                tx_hash: tag.tx_hash,
                tx_pos: tag.tx_pos,
            }));
        }

        Ok(json!(events))
    }

    pub(crate) async fn qualifications_for_qualifier_inner(
        &self,
        asset: &str,
        include_mempool: bool,
    ) -> Result<BTreeMap<String, Qualification>, HandlerError> {
        let mut qualifications = self.manager.db().qualifications_for_qualifier(asset).await?;
        // Two db lookups, and no longer contiguous.
        self.bump_cost(2.0 + qualifications.len() as f64);

        if include_mempool {
            for (h160, tag) in self.manager.mempool().qualifier_tags(asset).await {
                qualifications.insert(h160, tag);
            }
        }

        Ok(qualifications)
    }

    pub(crate) async fn qualifications_for_qualifier(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        let qualifications = self
            .qualifications_for_qualifier_inner(&asset, include_mempool)
            .await?;
        Ok(json!(qualifications))
    }

    pub(crate) async fn qualifications_for_qualifier_history(
        &self,
        params: Params,
    ) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;

        let mut events = self
            .manager
            .db()
            .qualifications_for_qualifier_history(&asset)
            .await?;
        self.bump_cost(2.0 + events.len() as f64 / 30.0);

        if include_mempool {
            let pending = self.manager.mempool().qualifier_tags(&asset).await;
            events.extend(pending.into_iter().map(|(h160, tag)| QualifierQualification {
                h160,
                flag: tag.flag,
                height: tag.height,
                tx_hash: tag.tx_hash,
                tx_pos: tag.tx_pos,
            }));
        }

        Ok(json!(events))
    }

    // --- Restricted assets

    pub(crate) async fn is_restricted_frozen_inner(
        &self,
        asset: &str,
        include_mempool: bool,
    ) -> Result<Option<crate::domain::FrozenEntry>, HandlerError> {
        check_asset_str(asset)?;
        require_restricted(asset)?;

        if include_mempool
            && let Some(pending) = self.manager.mempool().is_frozen(asset).await
        {
            return Ok(Some(pending));
        }

        self.bump_cost(1.0);
        Ok(self.manager.db().is_restricted_frozen(asset).await?)
    }

    pub(crate) async fn is_restricted_frozen(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        let frozen = self.is_restricted_frozen_inner(&asset, include_mempool).await?;
        Ok(json!(frozen))
    }

    pub(crate) async fn restricted_frozen_history(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        require_restricted(&asset)?;

        let mut events = self.manager.db().restricted_frozen_history(&asset).await?;
        self.bump_cost(2.0 + events.len() as f64 / 30.0);

        if include_mempool {
            events.extend(self.manager.mempool().is_frozen(&asset).await);
        }

        Ok(json!(events))
    }

    pub(crate) async fn get_restricted_string_inner(
        &self,
        asset: &str,
        include_mempool: bool,
    ) -> Result<Option<crate::domain::VerifierString>, HandlerError> {
        check_asset_str(asset)?;
        require_restricted(asset)?;

        if include_mempool
            && let Some(pending) = self.manager.mempool().restricted_verifier(asset).await
        {
            return Ok(Some(pending));
        }

        self.bump_cost(1.0);
        Ok(self.manager.db().restricted_string(asset).await?)
    }

    pub(crate) async fn get_restricted_string(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        let verifier = self.get_restricted_string_inner(&asset, include_mempool).await?;
        Ok(json!(verifier))
    }

    pub(crate) async fn get_restricted_string_history(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        require_restricted(&asset)?;

        let mut events = self.manager.db().restricted_string_history(&asset).await?;
        self.bump_cost(1.0 + events.len() as f64 / 30.0);

        if include_mempool {
            events.extend(self.manager.mempool().restricted_verifier(&asset).await);
        }

        Ok(json!(events))
    }

    pub(crate) async fn qualifier_associations_inner(
        &self,
        asset: &str,
        include_mempool: bool,
    ) -> Result<BTreeMap<String, QualifierAssociation>, HandlerError> {
        check_asset_str(asset)?;
        require_qualifier(asset)?;

        let first_chunk = asset.split('/').next().unwrap_or(asset);
        let mut associations = self
            .manager
            .db()
            .qualifier_associations(first_chunk)
            .await?;
        self.bump_cost(1.0 + associations.len() as f64 / 10.0);

        if include_mempool {
            let mempool = self.manager.mempool();

            for restricted in associations.keys().cloned().collect::<Vec<_>>() {
                let Some(verifier) = mempool.restricted_verifier(&restricted).await else {
                    continue;
                };
                let still_referenced = VERIFIER_TOKEN
                    .find_iter(&verifier.string)
                    .any(|token| token.as_str() == asset);
                if !still_referenced {
                    associations.insert(
                        restricted,
                        QualifierAssociation {
                            associated: false,
                            height: -1,
                            tx_hash: verifier.tx_hash,
                            restricted_tx_pos: verifier.restricted_tx_pos,
                            qualifying_tx_pos: verifier.qualifying_tx_pos,
                        },
                    );
                }
            }

            for (restricted, association) in mempool
                .restricted_assets_associated_with_qualifier(asset)
                .await
            {
                associations.insert(restricted, association);
            }
        }

        Ok(associations)
    }

    pub(crate) async fn qualifier_associations(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        let associations = self.qualifier_associations_inner(&asset, include_mempool).await?;
        Ok(json!(associations))
    }

    pub(crate) async fn qualifier_associations_history(&self, params: Params) -> HandlerResult {
        let (asset, include_mempool) = Self::read_asset_and_mempool_flag(params)?;
        require_qualifier(&asset)?;

        let first_chunk = asset.split('/').next().unwrap_or(&asset);
        let mut events = self
            .manager
            .db()
            .qualifier_associations_history(first_chunk)
            .await?;
        self.bump_cost(1.0 + events.len() as f64 / 30.0);

        if include_mempool {
            let pending = self.qualifier_associations_inner(&asset, true).await?;
            events.extend(
                pending
                    .into_iter()
                    .filter(|(_, association)| association.height < 0)
                    .map(|(restricted, association)| AssociationEvent {
                        asset: restricted,
                        associated: association.associated,
                        height: association.height,
                        tx_hash: association.tx_hash,
                        restricted_tx_pos: association.restricted_tx_pos,
                        qualifying_tx_pos: association.qualifying_tx_pos,
                    }),
            );
        }

        Ok(json!(events))
    }

    // --- Statuses

    pub(crate) async fn asset_status(&self, asset: &str) -> Result<Option<String>, HandlerError> {
        let meta = self.asset_get_meta_inner(asset, true).await?;

        match &meta {
            Some(meta) => {
                // Source changes always imply a metadata change, so the
                // digest only covers the metadata itself.
                let fields = serde_json::to_value(meta)
                    .ok()
                    .and_then(|value| value.as_object().map(|object| object.len()))
                    .unwrap_or_default();
                self.bump_cost(0.1 + fields as f64 * 0.000_2);
            }
            None => self.bump_cost(0.1),
        }

        Ok(status::asset_status_string(meta.as_ref())
            .map(|status| status::status_hash(&status)))
    }

    pub(crate) async fn tags_for_qualifier_status(
        &self,
        qualifier: &str,
    ) -> Result<Option<String>, HandlerError> {
        if !qualifier.starts_with('#') && !qualifier.starts_with('$') {
            return Err(RpcError::bad_request(format!(
                "{qualifier} is not a qualifier nor a restricted asset"
            ))
            .into());
        }

        let tags = self.qualifications_for_qualifier_inner(qualifier, true).await?;
        Ok(self.hash_status_string(status::tag_status_string(&tags)))
    }

    pub(crate) async fn tags_for_h160_status(
        &self,
        h160: H160,
    ) -> Result<Option<String>, HandlerError> {
        let tags = self.qualifications_for_h160_inner(h160, true).await?;
        Ok(self.hash_status_string(status::tag_status_string(&tags)))
    }

    pub(crate) async fn broadcasts_status(
        &self,
        asset: &str,
    ) -> Result<Option<String>, HandlerError> {
        let messages = self.get_messages_inner(asset).await?;
        Ok(self.hash_status_string(status::broadcasts_status_string(&messages)))
    }

    pub(crate) async fn qualifier_associations_status(
        &self,
        asset: &str,
    ) -> Result<Option<String>, HandlerError> {
        let associations = self.qualifier_associations_inner(asset, true).await?;
        Ok(self.hash_status_string(status::qualifier_associations_status_string(&associations)))
    }

    fn hash_status_string(&self, status: Option<String>) -> Option<String> {
        match status {
            Some(status) => {
                self.bump_cost(0.1 + status.len() as f64 * 0.000_02);
                Some(status::status_hash(&status))
            }
            None => {
                self.bump_cost(0.1);
                None
            }
        }
    }

    // --- Subscriptions

    pub(crate) async fn asset_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        let status = self.asset_status(&asset).await?;
        self.state.lock().asset_subs.insert(asset);
        Ok(json!(status))
    }

    pub(crate) async fn asset_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        Ok(json!(self.state.lock().asset_subs.remove(&asset)))
    }

    pub(crate) async fn qualifier_tag_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let qualifier = check_asset(&reader.required("qualifier")?)?;
        reader.finish()?;

        let status = self.tags_for_qualifier_status(&qualifier).await?;
        self.state.lock().qualifier_tag_subs.insert(qualifier);
        Ok(json!(status))
    }

    pub(crate) async fn qualifier_tag_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let qualifier = check_asset(&reader.required("qualifier")?)?;
        reader.finish()?;

        Ok(json!(self.state.lock().qualifier_tag_subs.remove(&qualifier)))
    }

    pub(crate) async fn h160_tag_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let h160 = check_h160(&reader.required("h160")?)?;
        reader.finish()?;

        let status = self.tags_for_h160_status(h160).await?;
        self.state.lock().h160_tag_subs.insert(h160);
        Ok(json!(status))
    }

    pub(crate) async fn h160_tag_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let h160 = check_h160(&reader.required("h160")?)?;
        reader.finish()?;

        Ok(json!(self.state.lock().h160_tag_subs.remove(&h160)))
    }

    pub(crate) async fn broadcasts_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        let status = self.broadcasts_status(&asset).await?;
        self.state.lock().broadcast_subs.insert(asset);
        Ok(json!(status))
    }

    pub(crate) async fn broadcasts_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        Ok(json!(self.state.lock().broadcast_subs.remove(&asset)))
    }

    pub(crate) async fn frozen_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        let result = self.is_restricted_frozen_inner(&asset, true).await?;
        self.state.lock().frozen_subs.insert(asset);
        Ok(json!(result))
    }

    pub(crate) async fn frozen_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        Ok(json!(self.state.lock().frozen_subs.remove(&asset)))
    }

    pub(crate) async fn verifier_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        let result = self.get_restricted_string_inner(&asset, true).await?;
        self.state.lock().validator_subs.insert(asset);
        Ok(json!(result))
    }

    pub(crate) async fn verifier_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;

        Ok(json!(self.state.lock().validator_subs.remove(&asset)))
    }

    pub(crate) async fn associations_subscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;
        require_qualifier(&asset)?;

        let status = self.qualifier_associations_status(&asset).await?;
        self.state.lock().qualifier_validator_subs.insert(asset);
        Ok(json!(status))
    }

    pub(crate) async fn associations_unsubscribe(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let asset = check_asset(&reader.required("asset")?)?;
        reader.finish()?;
        require_qualifier(&asset)?;

        Ok(json!(self.state.lock().qualifier_validator_subs.remove(&asset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssetSource, MempoolReissue};

    fn source(height: i64) -> AssetSource {
        AssetSource {
            tx_hash: "ab".repeat(32),
            tx_pos: 0,
            height,
        }
    }

    fn saved_meta() -> AssetMeta {
        AssetMeta {
            sats_in_circulation: 1000,
            divisions: 2,
            reissuable: true,
            has_ipfs: false,
            ipfs: None,
            source: source(10),
            source_divisions: None,
            source_ipfs: None,
        }
    }

    #[test]
    fn test_merged_asset_meta_adds_sats() {
        let reissue = MempoolReissue {
            sats_in_circulation: 500,
            divisions: 4,
            reissuable: true,
            has_ipfs: false,
            ipfs: None,
            source: source(-1),
        };

        let merged = merged_asset_meta(saved_meta(), reissue);
        assert_eq!(merged.sats_in_circulation, 1500);
        assert_eq!(merged.divisions, 4);
        assert_eq!(merged.source.height, -1);
        assert_eq!(merged.source_divisions, None);
    }

    #[test]
    fn test_merged_asset_meta_unchanged_divisions_keeps_source() {
        let reissue = MempoolReissue {
            sats_in_circulation: 0,
            divisions: 0xff,
            reissuable: false,
            has_ipfs: false,
            ipfs: None,
            source: source(-1),
        };

        let merged = merged_asset_meta(saved_meta(), reissue);
        assert_eq!(merged.divisions, 2);
        assert_eq!(merged.source_divisions, Some(source(10)));
        assert!(!merged.reissuable);
    }

    #[test]
    fn test_verifier_token_matching() {
        let tokens = VERIFIER_TOKEN
            .find_iter("KYC&!SANCTIONED")
            .map(|token| token.as_str())
            .collect::<Vec<_>>();
        assert_eq!(tokens, ["KYC", "SANCTIONED"]);
    }
}
