// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

pub mod assets;
pub mod blockchain;
pub mod jsonrpc;
pub mod listener;
pub mod manager;
pub mod rpc;
pub mod server;
pub mod session;

use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::{
    fmt::{self, Display},
    net::IpAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// A listening endpoint: protocol, host and port. A missing host means all
/// interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    pub protocol: ServiceProtocol,
    pub host: Option<IpAddr>,
    pub port: u16,
}

impl Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = self
            .host
            .map(|host| host.to_string())
            .unwrap_or_else(|| "all_interfaces".to_string());
        write!(f, "{}://{host}:{}", self.protocol, self.port)
    }
}

impl FromStr for Service {
    type Err = InvalidService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = s.split_once("://").ok_or(InvalidService)?;
        let protocol = protocol.parse()?;
        let (host, port) = rest.rsplit_once(':').ok_or(InvalidService)?;
        let host = match host {
            "" | "all_interfaces" => None,
            host => Some(host.parse().map_err(|_| InvalidService)?),
        };
        let port = port.parse().map_err(|_| InvalidService)?;

        Ok(Self {
            protocol,
            host,
            port,
        })
    }
}

#[derive(Debug, Clone, Copy, Error)]
#[error("invalid service, expected <protocol>://<host>:<port>")]
pub struct InvalidService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ServiceProtocol {
    #[display("tcp")]
    Tcp,
    #[display("ssl")]
    Ssl,
    #[display("ws")]
    Ws,
    #[display("wss")]
    Wss,
    #[display("rpc")]
    Rpc,
}

impl ServiceProtocol {
    pub fn uses_tls(self) -> bool {
        matches!(self, ServiceProtocol::Ssl | ServiceProtocol::Wss)
    }

    pub fn uses_websocket(self) -> bool {
        matches!(self, ServiceProtocol::Ws | ServiceProtocol::Wss)
    }

    pub fn is_rpc(self) -> bool {
        matches!(self, ServiceProtocol::Rpc)
    }

    /// Upper-case name, as shown in logs and session tables.
    pub fn kind(self) -> &'static str {
        match self {
            ServiceProtocol::Tcp => "TCP",
            ServiceProtocol::Ssl => "SSL",
            ServiceProtocol::Ws => "WS",
            ServiceProtocol::Wss => "WSS",
            ServiceProtocol::Rpc => "RPC",
        }
    }
}

impl FromStr for ServiceProtocol {
    type Err = InvalidService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ServiceProtocol::Tcp),
            "ssl" => Ok(ServiceProtocol::Ssl),
            "ws" => Ok(ServiceProtocol::Ws),
            "wss" => Ok(ServiceProtocol::Wss),
            "rpc" => Ok(ServiceProtocol::Rpc),
            _ => Err(InvalidService),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Endpoints to listen on.
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub services: Vec<Service>,

    /// Endpoints advertised to peers and reported by `server.features`.
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    pub report_services: Vec<Service>,

    #[serde(default)]
    pub ssl_certfile: Option<PathBuf>,
    #[serde(default)]
    pub ssl_keyfile: Option<PathBuf>,

    pub max_sessions: usize,

    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Maximum size of an incoming request.
    pub max_recv: usize,

    /// Maximum size of a response; a floor of 350,000 bytes is applied.
    pub max_send: usize,

    pub cost_soft_limit: f64,
    pub cost_hard_limit: f64,

    /// Number of bytes of bandwidth that cost one cost unit.
    pub bw_unit_cost: u64,

    pub initial_concurrent: u32,

    /// Sleep imposed per request on sessions over the soft limit.
    #[serde(with = "humantime_serde")]
    pub request_sleep: Duration,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Interval for logging the session table; omit to disable.
    #[serde(with = "humantime_serde", default)]
    pub log_sessions: Option<Duration>,

    /// Clients whose `server.version` name matches are refused.
    #[serde(default)]
    pub drop_client: Option<String>,

    /// Mask remote addresses in logs.
    #[serde(default)]
    pub anon_logs: bool,

    #[serde(default)]
    pub donation_address: String,

    #[serde(default)]
    pub banner_file: Option<PathBuf>,
    #[serde(default)]
    pub tor_banner_file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_service_parse_display() {
        let service = "tcp://127.0.0.1:50001".parse::<Service>().unwrap();
        assert_eq!(service.protocol, ServiceProtocol::Tcp);
        assert_eq!(service.port, 50001);
        assert_eq!(service.to_string(), "tcp://127.0.0.1:50001");

        let service = "wss://:50004".parse::<Service>().unwrap();
        assert_eq!(service.host, None);
        assert_eq!(service.to_string(), "wss://all_interfaces:50004");

        assert_matches!("smtp://:25".parse::<Service>(), Err(InvalidService));
        assert_matches!("tcp://1.2.3.4".parse::<Service>(), Err(InvalidService));
    }
}
