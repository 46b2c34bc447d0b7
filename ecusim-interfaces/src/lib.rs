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

use thiserror::Error;
use tokio::sync::mpsc;

pub mod util;

/// Errors shared across the simulator crates.
///
/// Per-message failures never abort the process; they surface as in-band
/// negative responses or log entries. Only `Fatal` propagates out of a
/// responder's startup path.
#[derive(Error, Debug, Clone)]
pub enum SimulationError {
    #[error("invalid request pattern: {0}")]
    InvalidPattern(String),
    #[error("malformed hex payload: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no ECU registered for logical address {0:#06x}")]
    UnknownTarget(u16),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

pub mod service_ids {
    pub const SESSION_CONTROL: u8 = 0x10;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    pub const SESSION_CONTROL_RESPONSE: u8 = 0x50;
    pub const READ_DATA_BY_IDENTIFIER_RESPONSE: u8 = 0x62;
    pub const SECURITY_ACCESS_RESPONSE: u8 = 0x67;
}

pub mod nrc {
    pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
}

/// Assemble the three byte negative response `{0x7F, sid, nrc}`.
#[must_use]
pub fn negative_response(sid: u8, nrc: u8) -> Vec<u8> {
    vec![service_ids::NEGATIVE_RESPONSE, sid, nrc]
}

/// Sender half of an ISO-TP channel.
///
/// Implemented by the socket wrapper in `ecusim-comm-can`; test code installs
/// capturing doubles.
pub trait UdsSender: Send + Sync {
    /// Send one complete ISO-TP payload.
    /// # Errors
    /// `SimulationError::Transport` when the underlying socket write fails.
    fn send(&self, payload: &[u8]) -> Result<(), SimulationError>;
}

/// Diagnostic dispatch seam between the DoIP gateway and a simulated ECU.
///
/// `None` means no scripted entry matched; `Some` with an empty vector means a
/// scripted entry matched but asks for no reply to be sent.
pub trait DoipEcuResponder: Send + Sync {
    fn doip_response(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Control messages accepted by the running DoIP gateway.
#[derive(Debug, Clone)]
pub enum GatewayCommand {
    /// Emit the configured number of vehicle announcements.
    SendAnnouncements,
    /// Close the currently active TCP connection; later clients are accepted.
    Disconnect,
    /// Transmit a diagnostic payload with the given source logical address.
    SendDiagnostic { source_address: u16, data: Vec<u8> },
}

/// Cloneable, cross-task safe handle to the DoIP gateway.
///
/// Scripted callables hold one of these; sends never block, commands are
/// dropped (with a log entry) once the gateway has shut down.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<GatewayCommand>,
}

impl GatewayHandle {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<GatewayCommand>) -> Self {
        Self { tx }
    }

    pub fn trigger_disconnection(&self) {
        self.command(GatewayCommand::Disconnect);
    }

    pub fn send_announcements(&self) {
        self.command(GatewayCommand::SendAnnouncements);
    }

    pub fn send_diagnostic(&self, source_address: u16, data: Vec<u8>) {
        self.command(GatewayCommand::SendDiagnostic {
            source_address,
            data,
        });
    }

    fn command(&self, command: GatewayCommand) {
        if self.tx.send(command).is_err() {
            tracing::warn!("DoIP gateway is gone, dropping command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_response_shape() {
        assert_eq!(
            negative_response(0x22, nrc::SERVICE_NOT_SUPPORTED),
            vec![0x7F, 0x22, 0x11]
        );
    }

    #[tokio::test]
    async fn gateway_handle_forwards_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = GatewayHandle::new(tx);
        handle.send_diagnostic(0x1001, vec![0x62, 0x01]);
        handle.trigger_disconnection();

        match rx.recv().await {
            Some(GatewayCommand::SendDiagnostic {
                source_address,
                data,
            }) => {
                assert_eq!(source_address, 0x1001);
                assert_eq!(data, vec![0x62, 0x01]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(GatewayCommand::Disconnect)));
    }
}
