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

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct Configuration {
    /// Directory scanned for ECU description documents.
    pub configs_path: String,
    /// CAN device (e.g. `vcan0`); unset disables the CAN transports.
    pub can_device: Option<String>,
    /// File name of the gateway document inside `configs_path`.
    pub gateway_file: String,
    pub logging: LoggingConfig,
    pub compat: CompatConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` env-filter directive, e.g. `"info"` or `"ecusim=debug"`.
    pub filter: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct CompatConfig {
    /// Share one hash accumulator across all ECUs like the legacy
    /// simulator did. Leave off unless a description depends on it.
    pub shared_hash_buffer: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            configs_path: ".".to_owned(),
            can_device: None,
            gateway_file: "doipserver.toml".to_owned(),
            logging: LoggingConfig::default(),
            compat: CompatConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_owned(),
        }
    }
}

impl Default for CompatConfig {
    fn default() -> Self {
        CompatConfig {
            shared_hash_buffer: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use figment::{
        providers::{Format, Serialized, Toml},
        Figment,
    };

    use super::*;

    #[test]
    fn load_config_toml() -> Result<(), Box<dyn std::error::Error>> {
        let config_str = r#"
configs_path = "/etc/ecusim"
can_device = "vcan0"

[logging]
filter = "ecusim=debug"

[compat]
shared_hash_buffer = true
"#;

        let figment = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::string(config_str));
        let config: Configuration = figment.extract()?;
        assert_eq!(config.configs_path, "/etc/ecusim");
        assert_eq!(config.can_device.as_deref(), Some("vcan0"));
        assert_eq!(config.gateway_file, "doipserver.toml");
        assert_eq!(config.logging.filter, "ecusim=debug");
        assert!(config.compat.shared_hash_buffer);
        Ok(())
    }

    #[test]
    fn defaults_are_doip_only() -> Result<(), Box<dyn std::error::Error>> {
        let figment = Figment::from(Serialized::defaults(Configuration::default()));
        let config: Configuration = figment.extract()?;
        assert_eq!(config.configs_path, ".");
        assert!(config.can_device.is_none());
        assert!(!config.compat.shared_hash_buffer);
        Ok(())
    }
}
