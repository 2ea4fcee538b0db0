// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use logforth::{append, filter::env_filter::EnvFilterBuilder};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::IpAddr;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "metrics", default)]
    pub metrics_config: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub address: IpAddr,
    pub port: u16,
}

/// Initialize logging with a stderr appender filtered by `RUST_LOG`.
pub fn init_logging() {
    logforth::core::builder()
        .dispatch(|dispatch| {
            dispatch
                .filter(EnvFilterBuilder::from_default_env().build())
                .append(append::Stderr::default())
        })
        .apply();
}

/// Install the Prometheus exporter if metrics are configured.
pub fn init_metrics(config: Option<MetricsConfig>) {
    let Some(MetricsConfig { address, port }) = config else {
        return;
    };

    if let Err(error) = PrometheusBuilder::new()
        .with_http_listener((address, port))
        .install()
    {
        log::error!(error:%; "cannot install Prometheus metrics exporter");
    }
}
