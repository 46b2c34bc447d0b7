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

//! SAE J1939 responder: request handling, acknowledgements and the cyclic
//! broadcast senders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socketcan::nl::CanInterface;
use tokio::task::JoinHandle;

use ecusim_core::ScriptedEcu;
use ecusim_interfaces::util::{decode_hex, encode_hex_spaced};
use ecusim_interfaces::SimulationError;

mod socket;

pub use socket::J1939Socket;

/// 255 transport frames of 7 bytes plus the 3 PGN bytes.
pub const MAX_DATAGRAM: usize = 1788;

/// Request for a parameter group, J1939-21 PGN 59904.
const REQUEST_PGN: u32 = 0xEA00;
/// Acknowledgement, J1939-21 PGN 59392.
const ACK_PGN: u32 = 0xE800;
const BROADCAST_ADDR: u8 = 0xFF;

const SEND_RETRIES: u32 = 5;
const SEND_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Convert a scripted PGN notation to its number.
///
/// Valid forms are decimal (`"65226"`) and little endian hex bytes
/// (`"CA FE 00"` or `"CAFE00"`). Strings of up to five digits are read as
/// decimal first; anything longer, or not decimal, is read as hex bytes.
#[must_use]
pub fn parse_pgn(input: &str) -> u32 {
    let cleaned = ecusim_interfaces::util::strip_separators(input);
    if cleaned.len() <= 5 {
        if let Ok(value) = cleaned.parse::<u32>() {
            if value != 0 {
                return value;
            }
        }
    }

    let bytes = decode_hex(&cleaned).unwrap_or_default();
    if bytes.len() > 3 {
        return 0;
    }
    bytes
        .iter()
        .rev()
        .fold(0u32, |pgn, &byte| (pgn << 8) | u32::from(byte))
}

/// Acknowledgement body per J1939-21, 5.4.4: control byte, group function
/// value, two reserved bytes, the acknowledged address and the PGN.
#[must_use]
fn assemble_ack(ack_info: &[u8], target_address: u8, pgn: u32) -> Vec<u8> {
    vec![
        ack_info.first().copied().unwrap_or(0x00),
        ack_info.get(1).copied().unwrap_or(0x00),
        0xFF,
        0xFF,
        target_address,
        pgn as u8,
        (pgn >> 8) as u8,
        (pgn >> 16) as u8,
    ]
}

/// A datagram to put on the bus in reaction to a received one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub pgn: u32,
    pub destination: u8,
    pub payload: Vec<u8>,
}

/// Decide the response for a received frame.
///
/// Scripted `#` entries win; their response string selects the responding
/// PGN (`"<pgn>#<payload>"`), synthesizes an acknowledgement (`"ACK…"`), or
/// reuses the incoming PGN (plain payload). Without a scripted match, a
/// request for PGN is served from the cyclic/request table.
pub fn response_for(
    ecu: &ScriptedEcu,
    source: u8,
    pgn: u32,
    payload: &[u8],
) -> Option<OutboundFrame> {
    if let Some(response) = ecu.j1939_pgn_response(pgn, payload) {
        if response.is_empty() {
            return None;
        }
        if let Some(separator) = response.find('#') {
            return Some(OutboundFrame {
                pgn: parse_pgn(&response[..separator]),
                destination: source,
                payload: decode_or_empty(&response[separator + 1..]),
            });
        }
        if let Some(ack_info) = response.strip_prefix("ACK") {
            return Some(OutboundFrame {
                pgn: ACK_PGN,
                destination: BROADCAST_ADDR,
                payload: assemble_ack(&decode_or_empty(ack_info), source, pgn),
            });
        }
        return Some(OutboundFrame {
            pgn,
            destination: source,
            payload: decode_or_empty(&response),
        });
    }

    if pgn == REQUEST_PGN {
        let requested = parse_pgn(&encode_hex_spaced(payload));
        tracing::debug!(requested, "request for PGN");
        let key = ecu
            .j1939_pgn_keys()
            .into_iter()
            .find(|key| parse_pgn(key) == requested)?;
        let data = ecu.j1939_pgn_data(&key);
        if data.payload.is_empty() {
            return None;
        }
        return Some(OutboundFrame {
            pgn: requested,
            destination: source,
            payload: decode_or_empty(&data.payload),
        });
    }

    None
}

fn decode_or_empty(hex: &str) -> Vec<u8> {
    decode_hex(hex).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "malformed scripted payload");
        Vec::new()
    })
}

/// Bus is usable for sending when the controller reports ERROR_ACTIVE or
/// ERROR_WARNING. A failing state query counts as bus off.
fn bus_is_active(device: &str) -> bool {
    let iface = match CanInterface::open(device) {
        Ok(iface) => iface,
        Err(e) => {
            tracing::warn!(device, error = ?e, "cannot query CAN interface, assuming bus off");
            return false;
        }
    };
    match iface.state() {
        Ok(Some(state)) => matches!(
            state,
            socketcan::nl::CanState::ErrorActive | socketcan::nl::CanState::ErrorWarning
        ),
        Ok(None) => {
            tracing::warn!(device, "CAN interface reports no state, assuming bus off");
            false
        }
        Err(e) => {
            tracing::warn!(device, error = ?e, "cannot read CAN state, assuming bus off");
            false
        }
    }
}

fn sleep_while_active(active: &AtomicBool, duration: Duration) {
    let step = Duration::from_millis(50);
    let mut remaining = duration;
    while active.load(Ordering::SeqCst) && !remaining.is_zero() {
        let nap = remaining.min(step);
        std::thread::sleep(nap);
        remaining = remaining.saturating_sub(nap);
    }
}

/// Receiver task plus one cyclic sender task per scripted broadcast PGN.
pub struct J1939Simulation {
    handles: Vec<JoinHandle<()>>,
}

impl J1939Simulation {
    /// Bind the receive socket and spawn the tasks.
    ///
    /// # Errors
    /// `SimulationError::Configuration` without a J1939 source address,
    /// `SimulationError::Fatal` when the receive socket cannot be opened.
    pub fn start(
        device: &str,
        ecu: Arc<ScriptedEcu>,
        active: Arc<AtomicBool>,
    ) -> Result<Self, SimulationError> {
        let source_address = ecu.j1939_source_address().ok_or_else(|| {
            SimulationError::Configuration(format!(
                "ECU {} has no J1939 source address",
                ecu.name()
            ))
        })?;

        let socket = Arc::new(J1939Socket::open(device, source_address)?);
        let mut handles = vec![spawn_receiver(
            Arc::clone(&socket),
            Arc::clone(&ecu),
            Arc::clone(&active),
        )];

        let pgn_keys = ecu.j1939_pgn_keys();
        tracing::info!(
            ecu = %ecu.name(),
            device,
            pgn_count = pgn_keys.len(),
            "J1939 simulation started"
        );
        for key in pgn_keys {
            handles.push(spawn_cyclic_sender(
                device.to_owned(),
                key,
                source_address,
                Arc::clone(&ecu),
                Arc::clone(&active),
            ));
        }

        Ok(J1939Simulation { handles })
    }

    /// Wait for all tasks after the active flag was cleared.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "J1939 task failed");
            }
        }
    }
}

fn spawn_receiver(
    socket: Arc<J1939Socket>,
    ecu: Arc<ScriptedEcu>,
    active: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; MAX_DATAGRAM];
        while active.load(Ordering::SeqCst) {
            match socket.try_recv_from(&mut buf) {
                Ok(Some((len, source, pgn))) => {
                    tracing::debug!(
                        source = format_args!("{source:#04x}"),
                        pgn = format_args!("{pgn:#07x}"),
                        len,
                        "J1939 frame received"
                    );
                    let Some(frame) = response_for(&ecu, source, pgn, &buf[..len]) else {
                        continue;
                    };
                    match socket.send_to(&frame.payload, frame.destination, frame.pgn) {
                        Ok(sent) => tracing::debug!(pgn = frame.pgn, sent, "J1939 response sent"),
                        Err(e) => {
                            tracing::warn!(pgn = frame.pgn, error = %e, "cannot send J1939 response");
                        }
                    }
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => {
                    tracing::warn!(error = %e, "J1939 receive failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    })
}

/// Broadcast one scripted PGN on its cycle time.
///
/// The payload and cycle are re-read every round so callables can vary the
/// data. A cycle of zero means the entry is request-only and the task exits.
/// Every round opens a fresh send socket; sends are retried a bounded number
/// of times while the bus signals backpressure.
fn spawn_cyclic_sender(
    device: String,
    pgn_key: String,
    source_address: u8,
    ecu: Arc<ScriptedEcu>,
    active: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let pgn = parse_pgn(&pgn_key);
        while active.load(Ordering::SeqCst) {
            let data = ecu.j1939_pgn_data(&pgn_key);
            if data.cycle_ms == 0 {
                tracing::debug!(pgn, "PGN is not cyclic");
                return;
            }
            let payload = decode_or_empty(&data.payload);

            if bus_is_active(&device) {
                match J1939Socket::open(&device, source_address) {
                    Ok(socket) => send_with_retries(&socket, &payload, pgn),
                    Err(e) => tracing::warn!(pgn, error = %e, "cannot open cyclic send socket"),
                }
            }

            sleep_while_active(&active, Duration::from_millis(u64::from(data.cycle_ms)));
        }
    })
}

fn send_with_retries(socket: &J1939Socket, payload: &[u8], pgn: u32) {
    let mut retries = SEND_RETRIES;
    while retries > 0 {
        match socket.send_to(payload, BROADCAST_ADDR, pgn) {
            Ok(_) => return,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                retries -= 1;
                tracing::debug!(pgn, retries, "sending PGN blocked");
                std::thread::sleep(SEND_RETRY_PAUSE);
            }
            Err(e) => {
                tracing::warn!(pgn, error = %e, "error sending PGN");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ecusim_core::script::description::EcuDescription;
    use ecusim_core::CallableRegistry;

    use super::*;

    fn ecu(toml: &str) -> ScriptedEcu {
        let description = EcuDescription::from_toml_str(toml).unwrap();
        ScriptedEcu::from_description(description, &CallableRegistry::new(), false)
    }

    #[test]
    fn parse_pgn_decimal() {
        assert_eq!(parse_pgn("65226"), 65226);
        assert_eq!(parse_pgn("100"), 100);
    }

    #[test]
    fn parse_pgn_little_endian_hex() {
        assert_eq!(parse_pgn("CA FE 00"), 0x00FECA);
        assert_eq!(parse_pgn("CAFE00"), 0x00FECA);
        assert_eq!(parse_pgn("FE F5"), 0x00F5FE);
        assert_eq!(parse_pgn("FE F5 00"), 0x00F5FE);
    }

    #[test]
    fn parse_pgn_rejects_garbage() {
        assert_eq!(parse_pgn(""), 0);
        assert_eq!(parse_pgn("not a pgn"), 0);
        // more than three bytes cannot form a PGN
        assert_eq!(parse_pgn("01 02 03 04"), 0);
    }

    #[test]
    fn ack_assembly_defaults_and_explicit_bytes() {
        assert_eq!(
            assemble_ack(&[], 0x4A, 0x00FECA),
            vec![0x00, 0x00, 0xFF, 0xFF, 0x4A, 0xCA, 0xFE, 0x00]
        );
        assert_eq!(
            assemble_ack(&[0x01, 0x02], 0x4A, 0x00FECA),
            vec![0x01, 0x02, 0xFF, 0xFF, 0x4A, 0xCA, 0xFE, 0x00]
        );
    }

    #[test]
    fn scripted_response_with_explicit_pgn() {
        let ecu = ecu(
            "[ECM]\nJ1939SourceAddress = 0x10\n[ECM.PGNs]\n\"EB FE 00 #01 *\" = \"CA FE 00 #AA BB\"\n",
        );
        let frame = response_for(&ecu, 0x21, 0x00FEEB, &[0x01, 0x02]).unwrap();
        assert_eq!(frame.pgn, 0x00FECA);
        assert_eq!(frame.destination, 0x21);
        assert_eq!(frame.payload, vec![0xAA, 0xBB]);
    }

    #[test]
    fn scripted_response_reuses_incoming_pgn() {
        let ecu = ecu(
            "[ECM]\nJ1939SourceAddress = 0x10\n[ECM.PGNs]\n\"EB FE 00 #*\" = \"11 22 33\"\n",
        );
        let frame = response_for(&ecu, 0x33, 0x00FEEB, &[0x00]).unwrap();
        assert_eq!(frame.pgn, 0x00FEEB);
        assert_eq!(frame.destination, 0x33);
        assert_eq!(frame.payload, vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn scripted_ack_goes_to_broadcast() {
        let ecu = ecu(
            "[ECM]\nJ1939SourceAddress = 0x10\n[ECM.PGNs]\n\"00 EE 00 #*\" = \"ACK 01\"\n",
        );
        let frame = response_for(&ecu, 0x42, 0x00EE00, &[]).unwrap();
        assert_eq!(frame.pgn, ACK_PGN);
        assert_eq!(frame.destination, BROADCAST_ADDR);
        assert_eq!(
            frame.payload,
            vec![0x01, 0x00, 0xFF, 0xFF, 0x42, 0x00, 0xEE, 0x00]
        );
    }

    #[test]
    fn request_pgn_serves_the_cyclic_table() {
        let ecu = ecu(
            "[ECM]\nJ1939SourceAddress = 0x10\n[ECM.PGNs]\n\"FE F5\" = { payload = \"11 22\", cycleTime = 100 }\n",
        );
        // EA00 request for PGN 0x00F5FE (little endian payload FE F5 00)
        let frame = response_for(&ecu, 0x21, REQUEST_PGN, &[0xFE, 0xF5, 0x00]).unwrap();
        assert_eq!(frame.pgn, 0x00F5FE);
        assert_eq!(frame.destination, 0x21);
        assert_eq!(frame.payload, vec![0x11, 0x22]);
    }

    #[test]
    fn request_for_unknown_pgn_is_silent() {
        let ecu = ecu("[ECM]\nJ1939SourceAddress = 0x10\n");
        assert_eq!(response_for(&ecu, 0x21, REQUEST_PGN, &[0xCA, 0xFE, 0x00]), None);
        assert_eq!(response_for(&ecu, 0x21, 0x00FEEB, &[0x00]), None);
    }

    #[test]
    fn empty_scripted_response_is_silent() {
        let ecu = ecu(
            "[ECM]\nJ1939SourceAddress = 0x10\n[ECM.PGNs]\n\"EB FE 00 #*\" = \"\"\n",
        );
        assert_eq!(response_for(&ecu, 0x33, 0x00FEEB, &[0x00]), None);
    }
}
