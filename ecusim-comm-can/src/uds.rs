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

//! UDS server: receives requests over ISO-TP and answers them from the
//! scripted description.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use ecusim_core::{ScriptedEcu, SessionController};
use ecusim_interfaces::util::{decode_hex, to_byte_response};
use ecusim_interfaces::{negative_response, nrc, service_ids, SimulationError, UdsSender};

use crate::isotp::IsoTpChannel;

/// The UDS service state machine of one receiver.
///
/// The scripted Raw table outranks the built-in service handling: a trie hit
/// answers the request completely, everything else branches on the service
/// identifier. The security access expectation is connection state, so each
/// receiver owns its own responder instance.
pub struct UdsResponder {
    ecu: Arc<ScriptedEcu>,
    session: Arc<SessionController>,
    sender: Arc<dyn UdsSender>,
    expected_key_request: Option<u8>,
}

impl UdsResponder {
    #[must_use]
    pub fn new(
        ecu: Arc<ScriptedEcu>,
        session: Arc<SessionController>,
        sender: Arc<dyn UdsSender>,
    ) -> Self {
        UdsResponder {
            ecu,
            session,
            sender,
            expected_key_request: None,
        }
    }

    /// Handle one complete ISO-TP payload.
    pub fn handle_request(&mut self, payload: &[u8]) {
        let Some(&sid) = payload.first() else {
            return;
        };

        if let Some(template) = self.ecu.raw_response(payload) {
            match decode_hex(&template) {
                Ok(data) if data.is_empty() => {
                    tracing::debug!(ecu = %self.ecu.name(), "scripted entry suppresses the response");
                }
                Ok(data) => {
                    tracing::info!(ecu = %self.ecu.name(), bytes = data.len(), "UDS sending");
                    self.send(&data);
                    self.session.reset();
                }
                Err(e) => {
                    tracing::warn!(ecu = %self.ecu.name(), error = %e, "malformed scripted response");
                }
            }
            return;
        }

        match sid {
            service_ids::READ_DATA_BY_IDENTIFIER => {
                self.read_data_by_identifier(payload);
                self.session.reset();
            }
            service_ids::SESSION_CONTROL => self.diagnostic_session_control(payload),
            service_ids::SECURITY_ACCESS => self.security_access(payload),
            _ => self.send(&negative_response(sid, nrc::SERVICE_NOT_SUPPORTED)),
        }
    }

    fn read_data_by_identifier(&self, payload: &[u8]) {
        if payload.len() < 3 {
            self.send(&negative_response(
                service_ids::READ_DATA_BY_IDENTIFIER,
                nrc::SERVICE_NOT_SUPPORTED,
            ));
            return;
        }

        let did = u32::from(payload[1]) << 8 | u32::from(payload[2]);
        let did_hex = to_byte_response(did, 2);
        let session_table = self.session.current().table_name();
        let data = self
            .ecu
            .data_by_identifier(&did_hex, session_table)
            .unwrap_or_default();
        let data = decode_hex(&data).unwrap_or_else(|e| {
            tracing::warn!(ecu = %self.ecu.name(), did = %did_hex, error = %e, "malformed identifier data");
            Vec::new()
        });

        if data.is_empty() {
            self.send(&negative_response(
                service_ids::READ_DATA_BY_IDENTIFIER,
                nrc::SERVICE_NOT_SUPPORTED,
            ));
        } else {
            let mut response = vec![
                service_ids::READ_DATA_BY_IDENTIFIER_RESPONSE,
                payload[1],
                payload[2],
            ];
            response.extend_from_slice(&data);
            self.send(&response);
        }
    }

    fn diagnostic_session_control(&self, payload: &[u8]) {
        let sub = payload.get(1).copied().unwrap_or_default();
        match ecusim_core::UdsSession::from_id(sub) {
            Some(session) => self.session.set_current(session),
            None => tracing::warn!(ecu = %self.ecu.name(), sub, "invalid session id"),
        }
        // the session timer governs the lifetime, no reset here
        self.send(&[service_ids::SESSION_CONTROL_RESPONSE, sub]);
    }

    fn security_access(&mut self, payload: &[u8]) {
        let sub = payload.get(1).copied().unwrap_or_default();
        match self.ecu.seed(sub) {
            Some(seed) => {
                let seed = if seed.trim().is_empty() {
                    // the description leaves seed generation to the simulator
                    to_byte_response(u32::from(rand::thread_rng().gen::<u16>()), 2)
                } else {
                    seed
                };
                let seed = decode_hex(&seed).unwrap_or_else(|e| {
                    tracing::warn!(ecu = %self.ecu.name(), error = %e, "malformed seed");
                    Vec::new()
                });
                let mut response = vec![service_ids::SECURITY_ACCESS, sub];
                response.extend_from_slice(&seed);
                self.send(&response);
                self.expected_key_request = Some(sub.wrapping_add(1));
            }
            None if self.expected_key_request == Some(sub) => {
                self.send(&[service_ids::SECURITY_ACCESS_RESPONSE]);
                self.expected_key_request = None;
            }
            None => self.send(&negative_response(
                service_ids::SECURITY_ACCESS,
                nrc::SERVICE_NOT_SUPPORTED,
            )),
        }
    }

    fn send(&self, data: &[u8]) {
        if let Err(e) = self.sender.send(data) {
            tracing::warn!(ecu = %self.ecu.name(), error = %e, "failed to send UDS response");
        }
    }
}

/// Receiver tasks of one UDS simulated ECU: the physical request id plus the
/// functional broadcast id, both feeding the same kind of responder.
pub struct UdsSimulation {
    handles: Vec<JoinHandle<()>>,
}

impl UdsSimulation {
    /// Open the ISO-TP channels and spawn the receiver tasks.
    ///
    /// # Errors
    /// `SimulationError::Configuration` when the description lacks UDS ids,
    /// `SimulationError::Fatal` when a socket cannot be opened.
    pub fn start(
        device: &str,
        ecu: Arc<ScriptedEcu>,
        active: Arc<AtomicBool>,
    ) -> Result<Self, SimulationError> {
        let (Some(request_id), Some(response_id)) = (ecu.request_id(), ecu.response_id()) else {
            return Err(SimulationError::Configuration(format!(
                "ECU {} has no UDS request/response ids",
                ecu.name()
            )));
        };

        let session = Arc::new(SessionController::new());
        let channel = IsoTpChannel::open(device, request_id, response_id)?;
        ecu.register_session_controller(Arc::clone(&session));
        ecu.register_uds_sender(Arc::clone(&channel) as Arc<dyn UdsSender>);

        let mut handles = vec![spawn_receiver(
            Arc::clone(&channel),
            UdsResponder::new(
                Arc::clone(&ecu),
                Arc::clone(&session),
                Arc::clone(&channel) as Arc<dyn UdsSender>,
            ),
            Arc::clone(&active),
        )];

        if ecu.broadcast_id() != request_id {
            let broadcast = IsoTpChannel::open(device, ecu.broadcast_id(), response_id)?;
            handles.push(spawn_receiver(
                broadcast,
                UdsResponder::new(
                    Arc::clone(&ecu),
                    session,
                    channel as Arc<dyn UdsSender>,
                ),
                active,
            ));
        }

        tracing::info!(ecu = %ecu.name(), device, "UDS simulation started");
        Ok(UdsSimulation { handles })
    }

    /// Wait for the receiver tasks after the active flag was cleared.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "UDS receiver task failed");
            }
        }
    }
}

fn spawn_receiver(
    channel: Arc<IsoTpChannel>,
    mut responder: UdsResponder,
    active: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while active.load(Ordering::SeqCst) {
            match channel.try_read() {
                Ok(Some(payload)) => responder.handle_request(&payload),
                Ok(None) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => {
                    tracing::warn!(error = %e, "ISO-TP receive failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ecusim_core::script::description::EcuDescription;
    use ecusim_core::CallableRegistry;

    use super::*;

    struct CapturingSender(Mutex<Vec<Vec<u8>>>);

    impl CapturingSender {
        fn new() -> Arc<Self> {
            Arc::new(CapturingSender(Mutex::new(Vec::new())))
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().clone()
        }

        fn last(&self) -> Vec<u8> {
            self.0.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    impl UdsSender for CapturingSender {
        fn send(&self, payload: &[u8]) -> Result<(), SimulationError> {
            self.0.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn ecu(toml: &str) -> Arc<ScriptedEcu> {
        let description = EcuDescription::from_toml_str(toml).unwrap();
        Arc::new(ScriptedEcu::from_description(
            description,
            &CallableRegistry::new(),
            false,
        ))
    }

    fn responder(
        ecu: Arc<ScriptedEcu>,
        session: Arc<SessionController>,
        sender: Arc<CapturingSender>,
    ) -> UdsResponder {
        UdsResponder::new(ecu, session, sender)
    }

    #[test]
    fn raw_literal_match() {
        let ecu = ecu("[PCM]\n[PCM.Raw]\n\"22 F1 90\" = \"62 F1 90 41 42 43\"\n");
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x22, 0xF1, 0x90]);
        assert_eq!(sender.last(), vec![0x62, 0xF1, 0x90, 0x41, 0x42, 0x43]);
    }

    #[test]
    fn raw_placeholder_and_negative() {
        let ecu = ecu("[PCM]\n[PCM.Raw]\n\"31 XX 12\" = \"71 00 12\"\n");
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x31, 0x01, 0x12]);
        assert_eq!(sender.last(), vec![0x71, 0x00, 0x12]);
        r.handle_request(&[0x31, 0xAA, 0x12]);
        assert_eq!(sender.last(), vec![0x71, 0x00, 0x12]);
        r.handle_request(&[0x31, 0xAA, 0x13]);
        assert_eq!(sender.last(), vec![0x7F, 0x31, 0x11]);
    }

    #[test]
    fn wildcard_vs_specific() {
        let ecu = ecu(
            "[PCM]\n[PCM.Raw]\n\"36 XX *\" = \"76 00\"\n\"36 01 02\" = \"76 01 02\"\n",
        );
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x36, 0x01, 0x02]);
        assert_eq!(sender.last(), vec![0x76, 0x01, 0x02]);
        r.handle_request(&[0x36, 0x05, 0xDE, 0xAD]);
        assert_eq!(sender.last(), vec![0x76, 0x00]);
    }

    #[test]
    fn scripted_silence_sends_nothing() {
        let ecu = ecu("[PCM]\n[PCM.Raw]\n\"11 01\" = \"\"\n");
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x11, 0x01]);
        assert!(sender.sent().is_empty());
    }

    #[test]
    fn read_data_by_identifier_positive_and_negative() {
        let ecu = ecu(
            "[PCM]\n[PCM.ReadDataByIdentifier]\n\"F1 90\" = \"41 42 43\"\n",
        );
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x22, 0xF1, 0x90]);
        assert_eq!(sender.last(), vec![0x62, 0xF1, 0x90, 0x41, 0x42, 0x43]);
        r.handle_request(&[0x22, 0xF1, 0x91]);
        assert_eq!(sender.last(), vec![0x7F, 0x22, 0x11]);
        // too short for a data identifier
        r.handle_request(&[0x22, 0xF1]);
        assert_eq!(sender.last(), vec![0x7F, 0x22, 0x11]);
    }

    #[test]
    fn session_control_switches_tables() {
        let ecu = ecu(
            r#"
[PCM]
[PCM.ReadDataByIdentifier]
"F1 90" = "44"
[PCM.Extended.ReadDataByIdentifier]
"F1 90" = "45"
"#,
        );
        let session = Arc::new(SessionController::with_timeout(Duration::from_millis(40)));
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::clone(&session), Arc::clone(&sender));

        r.handle_request(&[0x10, 0x03]);
        assert_eq!(sender.last(), vec![0x50, 0x03]);

        r.handle_request(&[0x22, 0xF1, 0x90]);
        assert_eq!(sender.last(), vec![0x62, 0xF1, 0x90, 0x45]);

        // after the session expires the default table answers again
        std::thread::sleep(Duration::from_millis(80));
        r.handle_request(&[0x22, 0xF1, 0x90]);
        assert_eq!(sender.last(), vec![0x62, 0xF1, 0x90, 0x44]);
    }

    #[test]
    fn rdbi_resets_the_session_timer() {
        let ecu = ecu(
            "[PCM]\n[PCM.Extended.ReadDataByIdentifier]\n\"F1 90\" = \"45\"\n",
        );
        let session = Arc::new(SessionController::with_timeout(Duration::from_millis(60)));
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::clone(&session), Arc::clone(&sender));

        r.handle_request(&[0x10, 0x03]);
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(30));
            r.handle_request(&[0x22, 0xF1, 0x90]);
            assert_eq!(sender.last(), vec![0x62, 0xF1, 0x90, 0x45]);
        }
    }

    #[test]
    fn unknown_service_yields_negative_response() {
        let ecu = ecu("[PCM]\n");
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x2E, 0xF1, 0x90, 0x00]);
        assert_eq!(sender.last(), vec![0x7F, 0x2E, 0x11]);
    }

    #[test]
    fn security_access_seed_then_key() {
        let ecu = ecu("[PCM]\n[PCM.Seed]\n\"01\" = \"0A 0B\"\n");
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x27, 0x01]);
        assert_eq!(sender.last(), vec![0x27, 0x01, 0x0A, 0x0B]);

        r.handle_request(&[0x27, 0x02]);
        assert_eq!(sender.last(), vec![0x67]);

        // the expectation is consumed
        r.handle_request(&[0x27, 0x02]);
        assert_eq!(sender.last(), vec![0x7F, 0x27, 0x11]);
    }

    #[test]
    fn security_access_without_pending_seed_is_rejected() {
        let ecu = ecu("[PCM]\n");
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x27, 0x04]);
        assert_eq!(sender.last(), vec![0x7F, 0x27, 0x11]);
    }

    #[test]
    fn empty_seed_entry_generates_a_random_seed() {
        let ecu = ecu("[PCM]\n[PCM.Seed]\n\"03\" = \"\"\n");
        let sender = CapturingSender::new();
        let mut r = responder(ecu, Arc::new(SessionController::new()), Arc::clone(&sender));

        r.handle_request(&[0x27, 0x03]);
        let response = sender.last();
        assert_eq!(response.len(), 4);
        assert_eq!(&response[..2], &[0x27, 0x03]);

        r.handle_request(&[0x27, 0x04]);
        assert_eq!(sender.last(), vec![0x67]);
    }
}
