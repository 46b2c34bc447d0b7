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

//! Serde model of a scripted ECU description document.
//!
//! One TOML file describes one ECU; the single top level table carries the
//! ECU identifier:
//!
//! ```toml
//! [PCM]
//! RequestId = 0x7E0
//! ResponseId = 0x7E8
//!
//! [PCM.Raw]
//! "22 F1 90" = "62 F1 90 41 42 43"
//! "36 XX *" = { call = "transfer_block" }
//!
//! [PCM.PGNs]
//! "FE F5" = { payload = "11 22", cycleTime = 100 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use ecusim_interfaces::SimulationError;

/// Reference to a registered callable.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallRef {
    pub call: String,
}

/// A scripted table value: a literal hex string or a callable reference.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ScriptValue {
    Text(String),
    Call(CallRef),
}

/// PGN table entry: plain payload, callable, or payload plus cycle time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PgnValue {
    Text(String),
    Call(CallRef),
    Entry(PgnEntryDef),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PgnEntryDef {
    #[serde(default)]
    pub payload: Option<ScriptValue>,
    #[serde(rename = "cycleTime", default)]
    pub cycle_time: u32,
}

/// Session specific sub tables (`[Ecu.Programming]`, `[Ecu.Extended]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionTables {
    #[serde(rename = "ReadDataByIdentifier")]
    pub read_data_by_identifier: BTreeMap<String, ScriptValue>,
}

/// Body of an ECU section; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EcuBody {
    #[serde(rename = "RequestId")]
    pub request_id: Option<u32>,
    #[serde(rename = "ResponseId")]
    pub response_id: Option<u32>,
    #[serde(rename = "BroadcastId")]
    pub broadcast_id: Option<u32>,
    #[serde(rename = "J1939SourceAddress")]
    pub j1939_source_address: Option<u8>,
    #[serde(rename = "DoIPLogicalEcuAddress")]
    pub doip_logical_ecu_address: Option<u16>,
    #[serde(rename = "ReadDataByIdentifier")]
    pub read_data_by_identifier: BTreeMap<String, ScriptValue>,
    #[serde(rename = "Seed")]
    pub seed: BTreeMap<String, String>,
    #[serde(rename = "Raw")]
    pub raw: BTreeMap<String, ScriptValue>,
    #[serde(rename = "PGNs")]
    pub pgns: BTreeMap<String, PgnValue>,
    #[serde(rename = "Programming")]
    pub programming: Option<SessionTables>,
    #[serde(rename = "Extended")]
    pub extended: Option<SessionTables>,
}

/// A parsed description document: the ECU identifier plus its body.
#[derive(Debug, Clone)]
pub struct EcuDescription {
    pub name: String,
    pub body: EcuBody,
}

impl EcuDescription {
    /// Parse a description from TOML text.
    ///
    /// # Errors
    /// `SimulationError::Configuration` when the document is not valid TOML
    /// or does not consist of exactly one ECU section.
    pub fn from_toml_str(text: &str) -> Result<Self, SimulationError> {
        let sections: BTreeMap<String, EcuBody> =
            toml::from_str(text).map_err(|e| SimulationError::Configuration(e.to_string()))?;

        let mut sections = sections.into_iter();
        let (name, body) = sections
            .next()
            .ok_or_else(|| SimulationError::Configuration("missing ECU section".to_owned()))?;
        if let Some((extra, _)) = sections.next() {
            return Err(SimulationError::Configuration(format!(
                "more than one ECU section in one file ('{name}', '{extra}', ...)"
            )));
        }
        Ok(EcuDescription { name, body })
    }

    /// Read and parse a description file.
    ///
    /// # Errors
    /// `SimulationError::Configuration` on IO or parse failure; fatal for
    /// this ECU only.
    pub fn load(path: &Path) -> Result<Self, SimulationError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SimulationError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }
}
