// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! The local operator command surface, served over `rpc` listeners by the
//! same session machinery with an unbounded response size.

use crate::{
    domain::{
        AssetFilter, hash_to_hex, scripthash_to_hashx,
        chain::{BlockProcessor, PeerManager},
        daemon::Daemon,
        mempool::Mempool,
        storage::Db,
    },
    infra::api::{
        jsonrpc::{HandlerResult, Params, RpcError, assert_string, non_negative_integer},
        manager::SessionManager,
        session::{Session, server_version, unix_time},
    },
};
use indexer_common::domain::{HASHX_LEN, HashX};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::{
    collections::HashSet,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

/// Resolution of operator-supplied tokens: decimal session ids, reserved
/// keywords, group names, and everything else.
pub struct SessionReferences<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    pub sessions: Vec<Arc<Session<D, M, R, P, B>>>,
    pub groups: Vec<String>,
    pub specials: HashSet<String>,
    pub unknown: Vec<String>,
}

fn items_param(params: Params, name: &str) -> Result<Vec<String>, RpcError> {
    let mut reader = params.reader();
    let items = reader.required(name)?;
    reader.finish()?;

    items
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(ToOwned::to_owned))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| RpcError::bad_request("expected a list of session IDs"))
}

/// Human-readable duration, used in session tables and `getinfo`.
pub fn formatted_time(secs: f64) -> String {
    let secs = secs.max(0.0) as u64;
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (mins, secs) = (rem / 60, rem % 60);

    let mut parts = Vec::new();
    for (value, unit) in [(days, "d"), (hours, "h"), (mins, "m"), (secs, "s")] {
        if value > 0 || !parts.is_empty() {
            parts.push(format!("{value}{unit}"));
        }
    }
    if parts.is_empty() {
        parts.push("0s".to_string());
    }

    parts.join(" ")
}

impl<D, M, R, P, B> SessionManager<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    fn session_references(
        &self,
        items: Vec<String>,
        special_strings: &[&str],
    ) -> SessionReferences<D, M, R, P, B> {
        let group_names = self.group_names();

        let mut sessions = Vec::new();
        let mut groups = Vec::new();
        let mut specials = HashSet::new();
        let mut unknown = Vec::new();

        for item in items {
            if item.chars().all(|c| c.is_ascii_digit()) {
                match item
                    .parse()
                    .ok()
                    .and_then(|id: u64| self.session_by_id(id))
                {
                    Some(session) => sessions.push(session),
                    None => unknown.push(item),
                }
            } else {
                let lowered = item.to_lowercase();
                if special_strings.contains(&lowered.as_str()) {
                    specials.insert(lowered);
                } else if group_names.contains(&lowered) {
                    groups.push(lowered);
                } else {
                    unknown.push(item);
                }
            }
        }

        SessionReferences {
            sessions,
            groups,
            specials,
            unknown,
        }
    }

    // --- Command handlers

    pub(crate) async fn rpc_add_peer(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let real_name = assert_string(&reader.required("real_name")?)?;
        reader.finish()?;

        self.peers()
            .add_local_rpc_peer(&real_name)
            .await
            .map_err(|error| RpcError::bad_request(format!("an error occured: {error}")))?;

        Ok(json!(format!("peer '{real_name}' added")))
    }

    pub(crate) async fn rpc_daemon_url(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let daemon_url = assert_string(&reader.required("daemon_url")?)?;
        reader.finish()?;

        self.daemon()
            .set_url(&daemon_url)
            .map_err(|error| RpcError::bad_request(format!("an error occured: {error}")))?;

        Ok(json!(format!(
            "now using daemon at {}",
            self.daemon().logged_url()
        )))
    }

    pub(crate) async fn rpc_stop(&self) -> HandlerResult {
        self.shutdown_event().set();
        Ok(json!("stopping"))
    }

    pub(crate) async fn rpc_getinfo(&self) -> HandlerResult {
        Ok(self.get_info())
    }

    pub(crate) async fn rpc_groups(&self) -> HandlerResult {
        Ok(self.group_data())
    }

    pub(crate) async fn rpc_peers(&self) -> HandlerResult {
        Ok(self.peers().rpc_data())
    }

    pub(crate) async fn rpc_sessions(&self) -> HandlerResult {
        Ok(Value::Array(self.session_data(false)))
    }

    pub(crate) async fn rpc_reorg(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let count = non_negative_integer(&reader.required("count")?)? as u32;
        reader.finish()?;

        if !self.bp().force_chain_reorg(count) {
            return Err(RpcError::bad_request("still catching up with daemon").into());
        }

        Ok(json!(format!("scheduled a reorg of {count} blocks")))
    }

    pub(crate) async fn rpc_disconnect(&self, params: Params) -> HandlerResult {
        let items = items_param(params, "session_ids")?;
        let refs = self.session_references(items, &["all"]);
        let mut result = Vec::new();

        let mut sessions = refs.sessions;
        if refs.specials.contains("all") {
            sessions = self.sessions();
            result.push("disconnecting all sessions".to_string());
        } else {
            result.extend(
                sessions
                    .iter()
                    .map(|session| format!("disconnecting session {}", session.id())),
            );
            for group in &refs.groups {
                result.push(format!("disconnecting group {group}"));
                for session in self.group_sessions(group) {
                    if !sessions.iter().any(|s| s.id() == session.id()) {
                        sessions.push(session);
                    }
                }
            }
        }
        result.extend(refs.unknown.iter().map(|item| format!("unknown: {item}")));

        self.disconnect_sessions(
            sessions,
            "local RPC request to disconnect",
            Duration::from_secs(1),
        )
        .await;

        Ok(json!(result))
    }

    pub(crate) async fn rpc_log(&self, params: Params) -> HandlerResult {
        let items = items_param(params, "session_ids")?;
        let refs = self.session_references(items, &["all", "none", "new"]);
        let mut result = Vec::new();

        if refs.specials.contains("all") {
            for session in self.sessions() {
                session.set_log_me(true);
            }
            self.set_log_new(true);
            result.push("logging all sessions".to_string());
        }
        if refs.specials.contains("none") {
            for session in self.sessions() {
                session.set_log_me(false);
            }
            self.set_log_new(false);
            result.push("logging no sessions".to_string());
        }
        if refs.specials.contains("new") {
            let log_new = !self.log_new();
            self.set_log_new(log_new);
            result.push(if log_new {
                "logging new sessions".to_string()
            } else {
                "not logging new sessions".to_string()
            });
        }

        let mut toggled = HashSet::new();
        let mut toggle = |session: &Arc<Session<D, M, R, P, B>>, result: &mut Vec<String>| {
            if !toggled.insert(session.id()) {
                return;
            }
            let log_me = !session.log_me();
            session.set_log_me(log_me);
            result.push(if log_me {
                format!("logging session {}", session.id())
            } else {
                format!("not logging session {}", session.id())
            });
        };

        for session in &refs.sessions {
            toggle(session, &mut result);
        }
        for group in &refs.groups {
            for session in self.group_sessions(group) {
                toggle(&session, &mut result);
            }
        }

        result.extend(refs.unknown.iter().map(|item| format!("unknown: {item}")));
        Ok(json!(result))
    }

    pub(crate) async fn rpc_query(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let items = reader.required("items")?;
        let limit = non_negative_integer(&reader.required("limit")?)? as usize;
        reader.finish()?;

        let items = items
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|item| item.as_str().map(ToOwned::to_owned))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| RpcError::bad_request("expected a list of scripts or script hashes"))?;

        let history_limit = if limit == 0 { usize::MAX } else { limit };
        let mut lines = Vec::<String>::new();

        for item in items {
            let hashx = self.arg_to_hashx(&item, &mut lines);
            let Some(hashx) = hashx else { continue };

            let history = self.db().limited_history(hashx, history_limit).await?;
            if history.is_empty() {
                lines.push("No history found".to_string());
            }
            for (n, entry) in history.iter().enumerate() {
                lines.push(format!(
                    "History #{n}: height {} tx_hash {}",
                    entry.height,
                    hash_to_hex(&entry.tx_hash)
                ));
            }

            let utxos = self.db().all_utxos(hashx, &AssetFilter::All).await?;
            if utxos.is_empty() {
                lines.push("No UTXOs found".to_string());
            }
            for (n, utxo) in utxos.iter().enumerate() {
                lines.push(format!(
                    "UTXO #{}: tx_hash {} tx_pos {} height {} value {}",
                    n + 1,
                    hash_to_hex(&utxo.tx_hash),
                    utxo.tx_pos,
                    utxo.height,
                    utxo.value
                ));
                if n + 1 == limit {
                    break;
                }
            }

            let balance = utxos.iter().map(|utxo| utxo.value).sum::<u64>();
            lines.push(format!(
                "Balance: {} {}",
                balance as f64 / 100_000_000.0,
                self.application_config().ticker.to_uppercase()
            ));
        }

        Ok(json!(lines))
    }

    /// Resolve a query argument: a 64-hex script hash, or raw script bytes
    /// hashed to the per-script key.
    fn arg_to_hashx(&self, arg: &str, lines: &mut Vec<String>) -> Option<HashX> {
        if arg.len() == 64
            && let Some(hashx) = scripthash_to_hashx(arg)
        {
            lines.push(format!("Script hash: {arg}"));
            return Some(hashx);
        }

        if let Ok(script) = const_hex::decode(arg) {
            let digest = Sha256::digest(&script);
            let hashx = HashX::try_from(&digest[..HASHX_LEN]).expect("digest is long enough");
            lines.push(format!("Script: {arg}"));
            return Some(hashx);
        }

        None
    }

    // --- Tables

    /// A summary of server state.
    pub(crate) fn get_info(&self) -> Value {
        let sessions = self.sessions();
        let method_counts = self.method_counts();
        let request_total = method_counts.values().sum::<u64>();

        let mut info = json!({
            "coin": self.application_config().coin,
            "daemon": self.daemon().logged_url(),
            "daemon height": self.daemon().cached_height(),
            "db height": self.db().height(),
            "db_flush_count": self.db().flush_count(),
            "groups": self.group_names().len(),
            "pid": std::process::id(),
            "peers": self.peers().info(),
            "request counts": method_counts,
            "request total": request_total,
            "sessions": {
                "count": sessions.len(),
                "count with subs": sessions.iter().filter(|s| s.sub_count() > 0).count(),
                "errors": sessions.iter().map(|s| s.errors.load(Ordering::Relaxed)).sum::<u64>(),
                "logged": sessions.iter().filter(|s| s.log_me()).count(),
                "pending requests": sessions.iter().map(|s| s.unanswered_request_count()).sum::<u32>(),
                "subs": sessions.iter().map(|s| s.sub_count()).sum::<usize>(),
            },
            "txs sent": self.txs_sent(),
            "uptime": formatted_time(unix_time() - self.start_time()),
            "version": server_version(),
        });

        let caches = self.cache_info();
        info.as_object_mut()
            .expect("info is an object")
            .extend(caches.as_object().expect("caches is an object").clone());

        info
    }

    /// Per-session rows, ordered by session start.
    pub(crate) fn session_data(&self, for_log: bool) -> Vec<Value> {
        let mut sessions = self.sessions();
        sessions.sort_by(|a, b| a.start_time().total_cmp(&b.start_time()));
        let now = unix_time();

        sessions
            .iter()
            .map(|session| {
                json!([
                    session.id(),
                    session.flags(),
                    session.remote_address_string(for_log),
                    session.client(),
                    session.protocol_version_string(),
                    session.cost(),
                    session.extra_cost(),
                    session.unanswered_request_count(),
                    session.txs_sent.load(Ordering::Relaxed),
                    session.sub_count(),
                    session.recv_count.load(Ordering::Relaxed),
                    session.recv_size.load(Ordering::Relaxed),
                    session.send_count.load(Ordering::Relaxed),
                    session.send_size.load(Ordering::Relaxed),
                    now - session.start_time(),
                ])
            })
            .collect()
    }

    /// Per-group rows for the operator `groups` command.
    pub(crate) fn group_data(&self) -> Value {
        let mut rows = Vec::new();

        for (name, session_cost, retained_cost, session_ids) in self.group_data_snapshot() {
            let sessions = session_ids
                .iter()
                .filter_map(|id| self.session_by_id(*id))
                .collect::<Vec<_>>();

            rows.push(json!([
                name,
                sessions.len(),
                session_cost,
                retained_cost,
                sessions.iter().map(|s| s.unanswered_request_count()).sum::<u32>(),
                sessions.iter().map(|s| s.txs_sent.load(Ordering::Relaxed)).sum::<u64>(),
                sessions.iter().map(|s| s.sub_count()).sum::<usize>(),
                sessions.iter().map(|s| s.recv_count.load(Ordering::Relaxed)).sum::<u64>(),
                sessions.iter().map(|s| s.recv_size.load(Ordering::Relaxed)).sum::<u64>(),
                sessions.iter().map(|s| s.send_count.load(Ordering::Relaxed)).sum::<u64>(),
                sessions.iter().map(|s| s.send_size.load(Ordering::Relaxed)).sum::<u64>(),
            ]));
        }

        Value::Array(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_time() {
        assert_eq!(formatted_time(0.0), "0s");
        assert_eq!(formatted_time(61.0), "1m 1s");
        assert_eq!(formatted_time(90_061.0), "1d 1h 1m 1s");
    }
}
