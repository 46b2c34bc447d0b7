/*
 * Copyright (c) 2026 The Contributors to Eclipse OpenSOVD (see CONTRIBUTORS)
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use figment::{
    providers::{Env, Format as _, Serialized, Toml},
    Figment,
};

pub mod configfile;

/// Loads the configuration from the file named by `ECUSIM_CONFIG_FILE`
/// (default `ecusim.toml`), merged over the defaults and under environment
/// variables prefixed with `ECUSIM`.
///
/// # Errors
/// Returns an error message when the configuration cannot be parsed.
pub fn load_config() -> Result<configfile::Configuration, String> {
    let config_file =
        std::env::var("ECUSIM_CONFIG_FILE").unwrap_or_else(|_| "ecusim.toml".to_owned());

    Figment::from(Serialized::defaults(default_config()))
        .merge(Toml::file(&config_file))
        .merge(Env::prefixed("ECUSIM").ignore(&["ECUSIM_CONFIG_FILE"]))
        .extract()
        .map_err(|e| format!("Failed to build configuration: {e}"))
}

#[must_use]
pub fn default_config() -> configfile::Configuration {
    configfile::Configuration::default()
}
