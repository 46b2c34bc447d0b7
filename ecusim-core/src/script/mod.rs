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

//! The scripted ECU: one parsed description document with its request
//! indices and the bridge state shared by all responders of that ECU.

use std::sync::Arc;

use hashbrown::HashMap;

use ecusim_interfaces::util::{encode_hex_spaced, strip_separators};
use ecusim_interfaces::{DoipEcuResponder, GatewayHandle, UdsSender};

mod bridge;
pub mod description;

pub use bridge::{CallableRegistry, HashAccumulator, ScriptApi, ScriptCallable, ScriptContext};

use crate::pattern::PatternTrie;
use crate::session::SessionController;
use description::{EcuDescription, PgnValue, ScriptValue};

/// UDS functional broadcast id used when the description does not set one.
pub const DEFAULT_BROADCAST_ID: u32 = 0x7DF;

/// A scripted response: either a literal hex template or a callable that
/// produces one from the hex encoded request.
#[derive(Clone)]
pub enum ResponseRef {
    Literal(String),
    Callable(Arc<dyn ScriptCallable>),
}

impl std::fmt::Debug for ResponseRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseRef::Literal(s) => f.debug_tuple("Literal").field(s).finish(),
            ResponseRef::Callable(_) => f.write_str("Callable"),
        }
    }
}

/// Resolved cyclic/request PGN entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct J1939PgnData {
    pub payload: String,
    pub cycle_ms: u32,
}

#[derive(Debug)]
struct PgnEntry {
    payload: Option<ResponseRef>,
    cycle_ms: u32,
}

/// One simulated ECU as described by its configuration document.
///
/// The tries and tables are built during load and immutable afterwards, so
/// lookups run without locking; only callable invocation serializes on the
/// per ECU script lock.
pub struct ScriptedEcu {
    name: String,
    request_id: Option<u32>,
    response_id: Option<u32>,
    broadcast_id: u32,
    j1939_source_address: Option<u8>,
    doip_logical_address: Option<u16>,
    raw_trie: PatternTrie<ResponseRef>,
    pgn_trie: PatternTrie<ResponseRef>,
    pgn_map: HashMap<String, PgnEntry>,
    dids: HashMap<String, ResponseRef>,
    dids_programming: HashMap<String, ResponseRef>,
    dids_extended: HashMap<String, ResponseRef>,
    seeds: HashMap<u8, String>,
    ctx: Arc<ScriptContext>,
}

impl ScriptedEcu {
    /// Build the runtime representation of one parsed description.
    ///
    /// Invalid entries (bad patterns, unresolvable callables, bad seed
    /// levels) are logged and skipped; they never fail the whole ECU.
    #[must_use]
    pub fn from_description(
        description: EcuDescription,
        registry: &CallableRegistry,
        shared_hash_buffer: bool,
    ) -> Self {
        let EcuDescription { name, body } = description;

        let mut raw_trie = PatternTrie::new();
        for (pattern, value) in &body.raw {
            let Some(response) = resolve_value(&name, value, registry) else {
                continue;
            };
            if let Err(e) = raw_trie.insert(pattern, response) {
                tracing::warn!(ecu = %name, pattern = %pattern, error = %e, "ignoring invalid request");
            }
        }

        let mut pgn_trie = PatternTrie::new();
        let mut pgn_map = HashMap::new();
        for (key, value) in &body.pgns {
            if key.contains('#') {
                let Some(response) = resolve_pgn_response(&name, value, registry) else {
                    continue;
                };
                if let Err(e) = pgn_trie.insert(key, response) {
                    tracing::warn!(ecu = %name, pattern = %key, error = %e, "ignoring invalid PGN request");
                }
            } else {
                let entry = resolve_pgn_entry(&name, value, registry);
                pgn_map.insert(normalize_key(key), entry);
            }
        }

        let mut seeds = HashMap::new();
        for (level, seed) in &body.seed {
            let cleaned = level.trim_start_matches("0x");
            match u8::from_str_radix(cleaned, 16) {
                Ok(level) => {
                    seeds.insert(level, seed.clone());
                }
                Err(_) => {
                    tracing::warn!(ecu = %name, level = %level, "ignoring invalid seed level");
                }
            }
        }

        let dids = resolve_did_table(&name, &body.read_data_by_identifier, registry);
        let dids_programming = body.programming.as_ref().map_or_else(HashMap::new, |t| {
            resolve_did_table(&name, &t.read_data_by_identifier, registry)
        });
        let dids_extended = body.extended.as_ref().map_or_else(HashMap::new, |t| {
            resolve_did_table(&name, &t.read_data_by_identifier, registry)
        });

        ScriptedEcu {
            ctx: Arc::new(ScriptContext::new(
                body.doip_logical_ecu_address,
                shared_hash_buffer,
            )),
            name,
            request_id: body.request_id,
            response_id: body.response_id,
            broadcast_id: body.broadcast_id.unwrap_or(DEFAULT_BROADCAST_ID),
            j1939_source_address: body.j1939_source_address,
            doip_logical_address: body.doip_logical_ecu_address,
            raw_trie,
            pgn_trie,
            pgn_map,
            dids,
            dids_programming,
            dids_extended,
            seeds,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn request_id(&self) -> Option<u32> {
        self.request_id
    }

    #[must_use]
    pub fn response_id(&self) -> Option<u32> {
        self.response_id
    }

    /// UDS broadcast address, `0x7DF` unless overridden.
    #[must_use]
    pub fn broadcast_id(&self) -> u32 {
        self.broadcast_id
    }

    #[must_use]
    pub fn j1939_source_address(&self) -> Option<u8> {
        self.j1939_source_address
    }

    #[must_use]
    pub fn doip_logical_address(&self) -> Option<u16> {
        self.doip_logical_address
    }

    /// Whether the description configures a UDS request/response pair.
    #[must_use]
    pub fn has_uds(&self) -> bool {
        self.request_id.is_some() && self.response_id.is_some()
    }

    pub fn register_session_controller(&self, session: Arc<SessionController>) {
        self.ctx.register_session_controller(session);
    }

    pub fn register_uds_sender(&self, sender: Arc<dyn UdsSender>) {
        self.ctx.register_uds_sender(sender);
    }

    pub fn register_gateway(&self, gateway: GatewayHandle) {
        self.ctx.register_gateway(gateway);
    }

    /// Response fragment for a data identifier, optionally from a session
    /// specific sub table (`"Programming"` / `"Extended"`).
    #[must_use]
    pub fn data_by_identifier(&self, did_hex: &str, session: Option<&str>) -> Option<String> {
        let table = match session {
            Some("Programming") => &self.dids_programming,
            Some("Extended") => &self.dids_extended,
            _ => &self.dids,
        };
        table
            .get(&normalize_key(did_hex))
            .map(|response| self.resolve(response, Some(did_hex)))
    }

    /// Scripted seed for a security access level.
    #[must_use]
    pub fn seed(&self, level: u8) -> Option<String> {
        self.seeds.get(&level).cloned()
    }

    /// Best scripted match for a raw request payload. `Some("")` means a
    /// matched entry explicitly asks for no reply.
    #[must_use]
    pub fn raw_response(&self, payload: &[u8]) -> Option<String> {
        self.raw_trie
            .lookup(payload)
            .map(|response| self.resolve(response, Some(&encode_hex_spaced(payload))))
    }

    /// Scripted match for a J1939 request: the lookup key is the three
    /// little endian PGN bytes followed by the payload.
    #[must_use]
    pub fn j1939_pgn_response(&self, pgn: u32, payload: &[u8]) -> Option<String> {
        let mut key = Vec::with_capacity(3 + payload.len());
        key.extend_from_slice(&[pgn as u8, (pgn >> 8) as u8, (pgn >> 16) as u8]);
        key.extend_from_slice(payload);
        self.pgn_trie
            .lookup(&key)
            .map(|response| self.resolve(response, Some(&encode_hex_spaced(payload))))
    }

    /// Cyclic/request PGN entry for a key without `#`. Returns an empty
    /// payload with cycle 0 when the key is not scripted.
    #[must_use]
    pub fn j1939_pgn_data(&self, pgn_key: &str) -> J1939PgnData {
        let Some(entry) = self.pgn_map.get(&normalize_key(pgn_key)) else {
            return J1939PgnData::default();
        };
        J1939PgnData {
            payload: entry
                .payload
                .as_ref()
                .map(|response| self.resolve(response, None))
                .unwrap_or_default(),
            cycle_ms: entry.cycle_ms,
        }
    }

    /// All scripted PGN keys without `#`, i.e. the cyclic/request PGNs.
    #[must_use]
    pub fn j1939_pgn_keys(&self) -> Vec<String> {
        self.pgn_map.keys().cloned().collect()
    }

    fn resolve(&self, response: &ResponseRef, request: Option<&str>) -> String {
        match response {
            ResponseRef::Literal(text) => text.clone(),
            ResponseRef::Callable(callable) => {
                let _guard = self.ctx.script_lock.lock();
                let api = ScriptApi::new(&self.ctx);
                callable.invoke(&api, request)
            }
        }
    }
}

impl std::fmt::Debug for ScriptedEcu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedEcu")
            .field("name", &self.name)
            .field("request_id", &self.request_id)
            .field("response_id", &self.response_id)
            .field("j1939_source_address", &self.j1939_source_address)
            .field("doip_logical_address", &self.doip_logical_address)
            .finish_non_exhaustive()
    }
}

impl DoipEcuResponder for ScriptedEcu {
    fn doip_response(&self, payload: &[u8]) -> Option<Vec<u8>> {
        self.raw_response(payload).map(|response| {
            ecusim_interfaces::util::decode_hex(&response).unwrap_or_else(|e| {
                tracing::warn!(ecu = %self.name, error = %e, "malformed scripted response");
                Vec::new()
            })
        })
    }
}

fn normalize_key(key: &str) -> String {
    strip_separators(key).to_ascii_uppercase()
}

fn resolve_value(
    ecu: &str,
    value: &ScriptValue,
    registry: &CallableRegistry,
) -> Option<ResponseRef> {
    match value {
        ScriptValue::Text(text) => Some(ResponseRef::Literal(text.clone())),
        ScriptValue::Call(reference) => match registry.resolve(&reference.call) {
            Some(callable) => Some(ResponseRef::Callable(callable)),
            None => {
                tracing::warn!(ecu = %ecu, callable = %reference.call, "unknown callable, skipping entry");
                None
            }
        },
    }
}

fn resolve_pgn_response(
    ecu: &str,
    value: &PgnValue,
    registry: &CallableRegistry,
) -> Option<ResponseRef> {
    match value {
        PgnValue::Text(text) => Some(ResponseRef::Literal(text.clone())),
        PgnValue::Call(reference) => {
            resolve_value(ecu, &ScriptValue::Call(reference.clone()), registry)
        }
        PgnValue::Entry(entry) => entry
            .payload
            .as_ref()
            .and_then(|payload| resolve_value(ecu, payload, registry)),
    }
}

fn resolve_pgn_entry(ecu: &str, value: &PgnValue, registry: &CallableRegistry) -> PgnEntry {
    match value {
        PgnValue::Text(text) => PgnEntry {
            payload: Some(ResponseRef::Literal(text.clone())),
            cycle_ms: 0,
        },
        PgnValue::Call(reference) => PgnEntry {
            payload: resolve_value(ecu, &ScriptValue::Call(reference.clone()), registry),
            cycle_ms: 0,
        },
        PgnValue::Entry(entry) => PgnEntry {
            payload: entry
                .payload
                .as_ref()
                .and_then(|payload| resolve_value(ecu, payload, registry)),
            cycle_ms: entry.cycle_time,
        },
    }
}

fn resolve_did_table(
    ecu: &str,
    table: &std::collections::BTreeMap<String, ScriptValue>,
    registry: &CallableRegistry,
) -> HashMap<String, ResponseRef> {
    table
        .iter()
        .filter_map(|(key, value)| {
            resolve_value(ecu, value, registry).map(|response| (normalize_key(key), response))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(toml: &str, registry: &CallableRegistry) -> ScriptedEcu {
        let description = EcuDescription::from_toml_str(toml).unwrap();
        ScriptedEcu::from_description(description, registry, false)
    }

    fn plain(toml: &str) -> ScriptedEcu {
        build(toml, &CallableRegistry::new())
    }

    #[test]
    fn ids_and_defaults() {
        let ecu = plain("[PCM]\nRequestId = 0x100\nResponseId = 0x200\n");
        assert_eq!(ecu.name(), "PCM");
        assert!(ecu.has_uds());
        assert_eq!(ecu.broadcast_id(), DEFAULT_BROADCAST_ID);
        assert_eq!(ecu.j1939_source_address(), None);
        assert_eq!(ecu.doip_logical_address(), None);

        let ecu = plain("[PCM]\nBroadcastId = 0x600\n");
        assert!(!ecu.has_uds());
        assert_eq!(ecu.broadcast_id(), 0x600);
    }

    #[test]
    fn raw_response_literal_and_miss() {
        let ecu = plain("[PCM]\n[PCM.Raw]\n\"22 F1 90\" = \"62 F1 90 41 42 43\"\n");
        assert_eq!(
            ecu.raw_response(&[0x22, 0xF1, 0x90]).as_deref(),
            Some("62 F1 90 41 42 43")
        );
        assert_eq!(ecu.raw_response(&[0x22, 0xF1, 0x91]), None);
    }

    #[test]
    fn raw_response_invokes_callable_with_request_hex() {
        let mut registry = CallableRegistry::new();
        registry.register_fn("echo", |_api, request| {
            format!("7E {}", request.unwrap_or_default())
        });
        let ecu = build(
            "[PCM]\n[PCM.Raw]\n\"3E XX\" = { call = \"echo\" }\n",
            &registry,
        );
        assert_eq!(ecu.raw_response(&[0x3E, 0x05]).as_deref(), Some("7E 3E 05"));
    }

    #[test]
    fn unknown_callable_entries_are_skipped() {
        let ecu = plain("[PCM]\n[PCM.Raw]\n\"3E 00\" = { call = \"nope\" }\n");
        assert_eq!(ecu.raw_response(&[0x3E, 0x00]), None);
    }

    #[test]
    fn invalid_patterns_are_skipped_but_others_survive() {
        let ecu = plain(
            "[PCM]\n[PCM.Raw]\n\"22 F1 9\" = \"61\"\n\"10 03\" = \"50 03\"\n",
        );
        assert_eq!(ecu.raw_response(&[0x10, 0x03]).as_deref(), Some("50 03"));
    }

    #[test]
    fn data_by_identifier_with_session_tables() {
        let ecu = plain(
            r#"
[PCM]
[PCM.ReadDataByIdentifier]
"F1 90" = "44 45 46"
[PCM.Programming.ReadDataByIdentifier]
"F1 90" = "50 52"
"#,
        );
        assert_eq!(
            ecu.data_by_identifier("F1 90", None).as_deref(),
            Some("44 45 46")
        );
        assert_eq!(
            ecu.data_by_identifier("F1 90", Some("Programming")).as_deref(),
            Some("50 52")
        );
        // session table misses do not fall back
        assert_eq!(ecu.data_by_identifier("F1 90", Some("Extended")), None);
        assert_eq!(ecu.data_by_identifier("F1 91", None), None);
    }

    #[test]
    fn data_by_identifier_callable_receives_the_did() {
        let mut registry = CallableRegistry::new();
        registry.register_fn("did_echo", |api, request| {
            api.ascii(request.unwrap_or_default())
        });
        let ecu = build(
            "[PCM]\n[PCM.ReadDataByIdentifier]\n\"F1 91\" = { call = \"did_echo\" }\n",
            &registry,
        );
        let response = ecu.data_by_identifier("F1 91", None).unwrap();
        assert_eq!(response, " 46 31 20 39 31 ");
    }

    #[test]
    fn seeds_are_keyed_by_level() {
        let ecu = plain("[PCM]\n[PCM.Seed]\n\"01\" = \"01 02 03 04\"\n\"05\" = \"\"\n");
        assert_eq!(ecu.seed(0x01).as_deref(), Some("01 02 03 04"));
        assert_eq!(ecu.seed(0x05).as_deref(), Some(""));
        assert_eq!(ecu.seed(0x03), None);
    }

    #[test]
    fn pgn_tables_split_by_hash_marker() {
        let ecu = plain(
            r#"
[PCM]
[PCM.PGNs]
"FE F5" = { payload = "11 22", cycleTime = 100 }
"FE E5 00 #01 *" = "AA BB"
"EB FE" = "33 44"
"#,
        );
        let data = ecu.j1939_pgn_data("FE F5");
        assert_eq!(data.payload, "11 22");
        assert_eq!(data.cycle_ms, 100);

        let data = ecu.j1939_pgn_data("EB FE");
        assert_eq!(data.payload, "33 44");
        assert_eq!(data.cycle_ms, 0);

        assert_eq!(ecu.j1939_pgn_data("00 00"), J1939PgnData::default());

        let mut keys = ecu.j1939_pgn_keys();
        keys.sort();
        assert_eq!(keys, vec!["EBFE".to_owned(), "FEF5".to_owned()]);

        // lookup key: PGN 0x00E5FE little endian (FE E5 00) + payload
        assert_eq!(
            ecu.j1939_pgn_response(0x00E5FE, &[0x01, 0x42]).as_deref(),
            Some("AA BB")
        );
        assert_eq!(ecu.j1939_pgn_response(0x00E5FE, &[0x02]), None);
    }

    #[test]
    fn doip_response_decodes_the_template() {
        let ecu = plain("[PCM]\n[PCM.Raw]\n\"22 F1 90\" = \"62 F1 90\"\n\"11 01\" = \"\"\n");
        assert_eq!(
            ecu.doip_response(&[0x22, 0xF1, 0x90]),
            Some(vec![0x62, 0xF1, 0x90])
        );
        // matched but intentionally silent
        assert_eq!(ecu.doip_response(&[0x11, 0x01]), Some(Vec::new()));
        assert_eq!(ecu.doip_response(&[0x27, 0x01]), None);
    }
}
