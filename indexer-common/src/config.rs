// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::de::DeserializeOwned;

const CONFIG_FILE_ENV: &str = "CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Extension trait to load a configuration from a TOML file overridden by
/// `CORVID__` prefixed and `__` separated environment variables, e.g.
/// `CORVID__INFRA__API__PORT=50001`.
pub trait ConfigExt
where
    Self: DeserializeOwned,
{
    fn load() -> Result<Self, figment::Error> {
        let config_file =
            std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        Figment::new()
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("CORVID__").split("__"))
            .extract()
    }
}

impl<T> ConfigExt for T where T: DeserializeOwned {}
