// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

//! Handlers for the `server.*` method family and the topic-update relay.

use crate::{
    domain::{
        chain::{BlockProcessor, PeerManager},
        daemon::Daemon,
        mempool::Mempool,
        storage::Db,
    },
    infra::api::{
        jsonrpc::{HandlerError, HandlerResult, Params, RpcError, assert_string, check_asset, negotiate_protocol},
        session::{PROTOCOL_BAD, PROTOCOL_MAX, PROTOCOL_MIN, Session, electrum_handlers, server_version, server_version_short},
    },
};
use log::{error, info};
use serde_json::{Value, json};

impl<D, M, R, P, B> Session<D, M, R, P, B>
where
    D: Db,
    M: Mempool,
    R: Daemon,
    P: PeerManager,
    B: BlockProcessor,
{
    pub(crate) async fn ping(&self) -> HandlerResult {
        self.bump_cost(0.1);
        Ok(Value::Null)
    }

    pub(crate) async fn donation_address(&self) -> HandlerResult {
        self.bump_cost(0.1);
        Ok(json!(self.manager.config().donation_address))
    }

    /// Negotiate the protocol version. May only be called once per session;
    /// no overlap or a bad version is refused with a final error.
    pub(crate) async fn server_version(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let client_name = reader.optional("client_name");
        let protocol_version = reader.optional("protocol_version");
        reader.finish()?;

        self.bump_cost(0.5);

        {
            let mut state = self.state.lock();
            if state.sv_seen {
                return Err(RpcError::bad_request("server.version already sent").into());
            }
            state.sv_seen = true;
        }

        if let Some(client_name) = client_name
            && !client_name.is_null()
        {
            let client_name = match client_name {
                Value::String(name) => name,
                other => other.to_string(),
            };
            if let Some(drop_client) = self.manager.drop_client()
                && drop_client.is_match(&client_name)
            {
                return Err(HandlerError::Disconnect(RpcError::bad_request(format!(
                    "unsupported client: {client_name}"
                ))));
            }
            self.state.lock().client = client_name.chars().take(17).collect();
        }

        let (negotiated, client_min) =
            negotiate_protocol(protocol_version.as_ref(), PROTOCOL_MIN, PROTOCOL_MAX);

        if let Some(version) = negotiated
            && PROTOCOL_BAD.contains(&version)
        {
            return Err(HandlerError::Disconnect(RpcError::bad_request(format!(
                "unsupported protocol version: {}",
                protocol_version.unwrap_or_default()
            ))));
        }

        let Some(version) = negotiated else {
            if client_min.is_some_and(|client_min| client_min > PROTOCOL_MIN) {
                info!(
                    conn_id = self.id();
                    "client requested future protocol version {} - is your software out of date?",
                    client_min.expect("client_min is some")
                );
            }
            return Err(HandlerError::Disconnect(RpcError::bad_request(format!(
                "unsupported protocol version: {}",
                protocol_version.unwrap_or_default()
            ))));
        };

        self.set_request_handlers(version);

        Ok(json!([server_version(), version.to_string()]))
    }

    fn set_request_handlers(&self, version: crate::infra::api::jsonrpc::ProtocolVersion) {
        let mut state = self.state.lock();
        state.protocol = version;
        state.handlers = electrum_handlers();
    }

    pub(crate) async fn server_features(&self) -> HandlerResult {
        self.bump_cost(0.2);

        let config = self.manager.config();
        let application_config = self.manager.application_config();

        let mut hosts = serde_json::Map::new();
        for service in &config.report_services {
            let host = service
                .host
                .map(|host| host.to_string())
                .unwrap_or_else(|| "all_interfaces".to_string());
            let ports = hosts
                .entry(host)
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .expect("ports is an object");
            let key = format!("{}_port", service.protocol);
            ports.entry(key).or_insert(json!(service.port));
        }

        Ok(json!({
            "hosts": hosts,
            "pruning": Value::Null,
            "server_version": server_version(),
            "protocol_min": PROTOCOL_MIN.to_string(),
            "protocol_max": PROTOCOL_MAX.to_string(),
            "protocol_bad": PROTOCOL_BAD.iter().map(|version| version.to_string()).collect::<Vec<_>>(),
            "genesis_hash": application_config.genesis_hash,
            "hash_function": "sha256",
            "services": config.report_services.iter().map(|service| service.to_string()).collect::<Vec<_>>(),
        }))
    }

    pub(crate) fn is_tor(&self) -> bool {
        self.manager
            .peers()
            .proxy_address()
            .is_some_and(|proxy| self.remote_address().ip() == proxy)
    }

    async fn replaced_banner(&self, banner: String) -> Result<String, HandlerError> {
        let network_info = self.manager.daemon().get_network_info().await?;

        let (major, minor) = (
            network_info.version / 1_000_000,
            network_info.version % 1_000_000,
        );
        let (minor, revision) = (minor / 10_000, (minor % 10_000) / 100);
        let daemon_version = format!("{major}.{minor}.{revision}");

        Ok(banner
            .replace("$SERVER_VERSION", server_version_short())
            .replace("$SERVER_SUBVERSION", &server_version())
            .replace("$DAEMON_VERSION", &daemon_version)
            .replace("$DAEMON_SUBVERSION", &network_info.subversion)
            .replace("$DONATION_ADDRESS", &self.manager.config().donation_address))
    }

    pub(crate) async fn banner(&self) -> HandlerResult {
        self.bump_cost(0.5);

        let config = self.manager.config();
        let banner_file = if self.is_tor() {
            config.tor_banner_file.as_ref()
        } else {
            config.banner_file.as_ref()
        };

        let mut banner = format!("You are connected to a {} server.", server_version());
        if let Some(banner_file) = banner_file {
            match tokio::fs::read_to_string(banner_file).await {
                Ok(content) => banner = self.replaced_banner(content).await?,
                Err(error) => {
                    error!(conn_id = self.id(), error:%; "reading banner file {}", banner_file.display());
                }
            }
        }

        Ok(json!(banner))
    }

    pub(crate) async fn add_peer(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let features = reader.required("features")?;
        reader.finish()?;

        self.state.lock().is_peer = true;
        self.bump_cost(100.0);

        let accepted = self
            .manager
            .peers()
            .on_add_peer(features, self.remote_address())
            .await;
        Ok(json!(accepted))
    }

    pub(crate) async fn peers_subscribe(&self) -> HandlerResult {
        self.bump_cost(1.0);
        Ok(json!(self.manager.peers().on_peers_subscribe(self.is_tor())))
    }

    /// Relay a topic update to subscribed peers. Topics share asset naming.
    pub(crate) async fn topic_update(&self, params: Params) -> HandlerResult {
        let mut reader = params.reader();
        let topic = check_asset(&reader.required("topic")?)?;
        let payload = assert_string(&reader.required("payload")?)?;
        reader.finish()?;

        self.manager.peers().send_topic_updates(&topic, &payload);
        Ok(json!({ "status": "ok" }))
    }
}
