// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use crate::{application, infra};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(rename = "application")]
    pub application_config: application::Config,

    #[serde(rename = "infra")]
    pub infra_config: infra::Config,

    #[serde(rename = "telemetry")]
    pub telemetry_config: indexer_common::telemetry::Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_deserialization() {
        let config = json!({
            "application": {
                "coin": "Evrmore",
                "ticker": "evr",
                "genesis_hash": "00".repeat(32),
            },
            "infra": {
                "api": {
                    "services": ["tcp://127.0.0.1:50001", "rpc://127.0.0.1:8000"],
                    "report_services": ["tcp://127.0.0.1:50001"],
                    "max_sessions": 1000,
                    "session_timeout": "10m",
                    "max_recv": 1000000,
                    "max_send": 1000000,
                    "cost_soft_limit": 1000.0,
                    "cost_hard_limit": 10000.0,
                    "bw_unit_cost": 5000,
                    "initial_concurrent": 10,
                    "request_sleep": "2500ms",
                    "request_timeout": "30s",
                    "log_sessions": "1h",
                    "donation_address": "",
                },
            },
            "telemetry": {},
        });

        let config = serde_json::from_value::<Config>(config).unwrap();
        assert_eq!(config.application_config.coin, "Evrmore");
        assert_eq!(config.infra_config.api_config.services.len(), 2);
        assert_eq!(
            config.infra_config.api_config.session_timeout,
            std::time::Duration::from_secs(600)
        );
        assert_eq!(config.infra_config.api_config.drop_client, None);
    }
}
