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

//! Thin wrapper around the kernel ISO-TP socket.
//!
//! The socket is non-blocking; the receiver task polls it under the shared
//! active flag so shutdown never hangs on a blocked read.

use std::sync::Arc;

use parking_lot::Mutex;
use socketcan_isotp::{ExtendedId, Id, IsoTpSocket, StandardId};

use ecusim_interfaces::{SimulationError, UdsSender};

fn can_id(raw: u32) -> Result<Id, SimulationError> {
    let id = if raw <= 0x7FF {
        StandardId::new(raw as u16).map(Id::Standard)
    } else {
        ExtendedId::new(raw).map(Id::Extended)
    };
    id.ok_or_else(|| SimulationError::Configuration(format!("invalid CAN id {raw:#x}")))
}

/// One ISO-TP channel of an ECU: reads requests addressed to `rx_id`,
/// answers from `tx_id`.
pub struct IsoTpChannel {
    socket: Mutex<IsoTpSocket>,
}

impl IsoTpChannel {
    /// Open the channel on `device`.
    ///
    /// # Errors
    /// `SimulationError::Fatal` when the socket cannot be opened or
    /// configured; this aborts the owning responder (startup failure).
    pub fn open(device: &str, rx_id: u32, tx_id: u32) -> Result<Arc<Self>, SimulationError> {
        let socket = IsoTpSocket::open(device, can_id(rx_id)?, can_id(tx_id)?).map_err(|e| {
            SimulationError::Fatal(format!(
                "cannot open ISO-TP channel {rx_id:#x} -> {tx_id:#x} on {device}: {e}"
            ))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| SimulationError::Fatal(format!("cannot configure ISO-TP socket: {e}")))?;
        Ok(Arc::new(IsoTpChannel {
            socket: Mutex::new(socket),
        }))
    }

    /// Poll for one complete ISO-TP payload. `Ok(None)` when nothing is
    /// pending.
    ///
    /// # Errors
    /// `SimulationError::Transport` on socket errors other than "would
    /// block"; the receiver logs these and keeps polling.
    pub fn try_read(&self) -> Result<Option<Vec<u8>>, SimulationError> {
        let mut socket = self.socket.lock();
        match socket.read() {
            Ok(data) if !data.is_empty() => Ok(Some(data.to_vec())),
            Ok(_) => Ok(None),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SimulationError::Transport(format!("ISO-TP read: {e}"))),
        }
    }
}

impl UdsSender for IsoTpChannel {
    fn send(&self, payload: &[u8]) -> Result<(), SimulationError> {
        self.socket
            .lock()
            .write(payload)
            .map_err(|e| SimulationError::Transport(format!("ISO-TP write: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_id_selects_standard_or_extended() {
        assert!(matches!(can_id(0x7DF), Ok(Id::Standard(_))));
        assert!(matches!(can_id(0x7FF), Ok(Id::Standard(_))));
        assert!(matches!(can_id(0x18DA00F1), Ok(Id::Extended(_))));
        assert!(can_id(0xFFFF_FFFF).is_err());
    }
}
