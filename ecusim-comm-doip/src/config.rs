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

use std::path::Path;

use serde::Deserialize;

use ecusim_interfaces::SimulationError;

pub const DEFAULT_DOIP_PORT: u16 = 13400;

/// Gateway document, the `[Main]` section of `doipserver.toml`.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DoipServerConfig {
    /// 17 ASCII characters; shorter values are padded with `'0'`.
    #[serde(rename = "VIN")]
    pub vin: String,
    #[serde(rename = "LOGICAL_ADDRESS")]
    pub logical_address: u16,
    /// Entity id; omitted means the gateway default EID is announced.
    #[serde(rename = "EID")]
    pub eid: Option<u64>,
    #[serde(rename = "GID")]
    pub gid: u64,
    #[serde(rename = "FURTHER_ACTION")]
    pub further_action: u8,
    #[serde(rename = "ANNOUNCE_NUM")]
    pub announce_num: u32,
    #[serde(rename = "ANNOUNCE_INTERVAL")]
    pub announce_interval_ms: u64,
    #[serde(rename = "T_TCP_General_Inactivity")]
    pub tcp_inactivity_secs: u64,
    pub bind_address: String,
    pub port: u16,
}

impl Default for DoipServerConfig {
    fn default() -> Self {
        DoipServerConfig {
            vin: "0".repeat(17),
            logical_address: 0x0000,
            eid: None,
            gid: 0,
            further_action: 0,
            announce_num: 3,
            announce_interval_ms: 500,
            tcp_inactivity_secs: 300,
            bind_address: "0.0.0.0".to_owned(),
            port: DEFAULT_DOIP_PORT,
        }
    }
}

#[derive(Deserialize)]
struct GatewayDocument {
    #[serde(rename = "Main")]
    main: Option<DoipServerConfig>,
}

impl DoipServerConfig {
    /// Parse the gateway document from TOML text.
    ///
    /// # Errors
    /// `SimulationError::Configuration` on parse failure or a missing
    /// `Main` section; the gateway cannot start without its document.
    pub fn from_toml_str(text: &str) -> Result<Self, SimulationError> {
        let document: GatewayDocument =
            toml::from_str(text).map_err(|e| SimulationError::Configuration(e.to_string()))?;
        document.main.ok_or_else(|| {
            SimulationError::Configuration("gateway document has no Main section".to_owned())
        })
    }

    /// Read and parse the gateway document.
    ///
    /// # Errors
    /// `SimulationError::Configuration` on IO or parse failure.
    pub fn load(path: &Path) -> Result<Self, SimulationError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SimulationError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// VIN as the fixed 17 byte announcement field.
    #[must_use]
    pub fn vin_bytes(&self) -> [u8; 17] {
        let mut vin = [b'0'; 17];
        for (slot, byte) in vin.iter_mut().zip(self.vin.bytes()) {
            *slot = byte;
        }
        vin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_gateway_document() {
        let config = DoipServerConfig::from_toml_str(
            r#"
[Main]
VIN = "A0000000000000000"
LOGICAL_ADDRESS = 0x201
EID = 0x112233445566
ANNOUNCE_NUM = 5
ANNOUNCE_INTERVAL = 250
T_TCP_General_Inactivity = 60
"#,
        )
        .unwrap();
        assert_eq!(config.vin, "A0000000000000000");
        assert_eq!(config.logical_address, 0x201);
        assert_eq!(config.eid, Some(0x1122_3344_5566));
        assert_eq!(config.gid, 0);
        assert_eq!(config.further_action, 0);
        assert_eq!(config.announce_num, 5);
        assert_eq!(config.announce_interval_ms, 250);
        assert_eq!(config.tcp_inactivity_secs, 60);
        assert_eq!(config.port, DEFAULT_DOIP_PORT);
    }

    #[test]
    fn default_values() {
        let config = DoipServerConfig::from_toml_str("[Main]\n").unwrap();
        assert_eq!(config.vin, "00000000000000000");
        assert_eq!(config.logical_address, 0);
        assert_eq!(config.eid, None);
        assert_eq!(config.announce_num, 3);
        assert_eq!(config.announce_interval_ms, 500);
        assert_eq!(config.tcp_inactivity_secs, 300);
    }

    #[test]
    fn missing_main_section_is_fatal() {
        assert!(DoipServerConfig::from_toml_str("[Other]\n").is_err());
        assert!(DoipServerConfig::from_toml_str("").is_err());
    }

    #[test]
    fn vin_bytes_pads_and_truncates() {
        let mut config = DoipServerConfig::default();
        config.vin = "ABC".to_owned();
        assert_eq!(&config.vin_bytes()[..4], b"ABC0");
        config.vin = "X".repeat(20);
        assert_eq!(config.vin_bytes(), [b'X'; 17]);
    }
}
