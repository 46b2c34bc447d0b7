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

//! Function bridge available to scripted callables.
//!
//! A scripted response may be a callable instead of a literal string. The
//! callable receives the hex encoded request and a [`ScriptApi`] handle
//! carrying the helper functions a description may rely on: byte/string
//! conversion, the checksum accumulator, the session hooks and the DoIP
//! gateway hooks.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crc::Crc;
use hashbrown::HashMap;
use parking_lot::Mutex;

use ecusim_interfaces::util::{ascii, decode_hex, strip_separators, to_byte_response};
use ecusim_interfaces::{GatewayHandle, UdsSender};

use crate::session::{SessionController, UdsSession};

const CRC_CCITT_FFFF: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_IBM_3740);

/// Process wide accumulator used in shared compatibility mode.
static SHARED_DATA_BYTES: Mutex<String> = Mutex::new(String::new());

/// Collects hex data for `create_hash`.
///
/// Each ECU gets its own buffer. The original simulator kept one process
/// wide buffer, which lets concurrent ECUs contaminate each other's
/// checksums; that behavior is only available through the explicit
/// `shared_hash_buffer` compatibility switch.
#[derive(Debug)]
pub enum HashAccumulator {
    PerEcu(Mutex<String>),
    SharedProcessWide,
}

impl HashAccumulator {
    #[must_use]
    pub fn new(shared_compat: bool) -> Self {
        if shared_compat {
            HashAccumulator::SharedProcessWide
        } else {
            HashAccumulator::PerEcu(Mutex::new(String::new()))
        }
    }

    fn append(&self, chunk: &str) {
        match self {
            HashAccumulator::PerEcu(buffer) => buffer.lock().push_str(chunk),
            HashAccumulator::SharedProcessWide => SHARED_DATA_BYTES.lock().push_str(chunk),
        }
    }

    fn take(&self) -> String {
        match self {
            HashAccumulator::PerEcu(buffer) => std::mem::take(&mut *buffer.lock()),
            HashAccumulator::SharedProcessWide => std::mem::take(&mut *SHARED_DATA_BYTES.lock()),
        }
    }
}

/// Per ECU state behind the script bridge: the script lock plus the handles
/// registered once the transports come up.
pub struct ScriptContext {
    pub(crate) script_lock: Mutex<()>,
    session: OnceLock<Arc<SessionController>>,
    uds_sender: OnceLock<Arc<dyn UdsSender>>,
    gateway: OnceLock<GatewayHandle>,
    doip_logical_address: Option<u16>,
    data_bytes: HashAccumulator,
}

impl ScriptContext {
    #[must_use]
    pub fn new(doip_logical_address: Option<u16>, shared_hash_buffer: bool) -> Self {
        ScriptContext {
            script_lock: Mutex::new(()),
            session: OnceLock::new(),
            uds_sender: OnceLock::new(),
            gateway: OnceLock::new(),
            doip_logical_address,
            data_bytes: HashAccumulator::new(shared_hash_buffer),
        }
    }

    pub fn register_session_controller(&self, session: Arc<SessionController>) {
        let _ = self.session.set(session);
    }

    pub fn register_uds_sender(&self, sender: Arc<dyn UdsSender>) {
        let _ = self.uds_sender.set(sender);
    }

    pub fn register_gateway(&self, gateway: GatewayHandle) {
        let _ = self.gateway.set(gateway);
    }
}

/// Handle passed into every callable invocation.
pub struct ScriptApi<'a> {
    ctx: &'a ScriptContext,
}

impl<'a> ScriptApi<'a> {
    #[must_use]
    pub fn new(ctx: &'a ScriptContext) -> Self {
        ScriptApi { ctx }
    }

    /// `ascii("Hello")` -> `" 48 65 6C 6C 6F "`.
    #[must_use]
    pub fn ascii(&self, text: &str) -> String {
        ascii(text)
    }

    /// Second byte of a hex message, e.g. the block counter of a
    /// TransferData request.
    #[must_use]
    pub fn counter_byte(&self, msg: &str) -> String {
        let cleaned = strip_separators(msg);
        cleaned.get(2..4).unwrap_or_default().to_owned()
    }

    /// Append everything after the first two bytes of `msg` to the hash
    /// accumulator.
    pub fn collect_data_bytes(&self, msg: &str) {
        let cleaned = strip_separators(msg);
        self.ctx
            .data_bytes
            .append(cleaned.get(4..).unwrap_or_default());
    }

    /// CRC-CCITT-FFFF over the accumulated data bytes, hex encoded without
    /// leading zero bytes but padded to full digit pairs. Clears the
    /// accumulator.
    #[must_use]
    pub fn create_hash(&self) -> String {
        let buffered = self.ctx.data_bytes.take();
        let data = decode_hex(&buffered).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "discarding malformed hash buffer");
            Vec::new()
        });
        let mut hash = format!("{:X}", CRC_CCITT_FFFF.checksum(&data));
        if hash.len() % 2 != 0 {
            hash.insert(0, '0');
        }
        hash
    }

    /// Big endian byte string of `value`, truncated or zero padded to `len`.
    #[must_use]
    pub fn to_byte_response(&self, value: u32, len: usize) -> String {
        to_byte_response(value, len)
    }

    /// Suspend the calling script. Callables run on blocking threads, so a
    /// plain thread sleep is appropriate here.
    pub fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    /// Numeric id of the active diagnostic session, `0x01` when no session
    /// controller is attached.
    #[must_use]
    pub fn current_session(&self) -> u8 {
        self.ctx
            .session
            .get()
            .map_or(UdsSession::Default.id(), |s| s.current().id())
    }

    pub fn switch_to_session(&self, id: u8) {
        match (self.ctx.session.get(), UdsSession::from_id(id)) {
            (Some(controller), Some(session)) => controller.set_current(session),
            (None, _) => tracing::warn!("no session controller attached"),
            (_, None) => tracing::warn!(id, "invalid session id"),
        }
    }

    /// Close the active DoIP TCP connection.
    pub fn disconnect_doip(&self) {
        match self.ctx.gateway.get() {
            Some(gateway) => gateway.trigger_disconnection(),
            None => tracing::warn!("no DoIP gateway attached"),
        }
    }

    pub fn send_doip_vehicle_announcements(&self) {
        match self.ctx.gateway.get() {
            Some(gateway) => gateway.send_announcements(),
            None => tracing::warn!("no DoIP gateway attached"),
        }
    }

    /// Send the given hex byte string immediately through every transport
    /// registered for this ECU.
    pub fn send_raw(&self, response: &str) {
        let data = match decode_hex(response) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "sendRaw with malformed payload");
                return;
            }
        };
        if let Some(sender) = self.ctx.uds_sender.get() {
            if let Err(e) = sender.send(&data) {
                tracing::warn!(error = %e, "sendRaw via ISO-TP failed");
            }
        }
        if let (Some(gateway), Some(address)) =
            (self.ctx.gateway.get(), self.ctx.doip_logical_address)
        {
            gateway.send_diagnostic(address, data);
        }
    }
}

/// A scripted callable: invoked with the hex encoded request, returns a hex
/// encoded response. An empty return means no response is sent.
pub trait ScriptCallable: Send + Sync {
    fn invoke(&self, api: &ScriptApi<'_>, request: Option<&str>) -> String;
}

impl<F> ScriptCallable for F
where
    F: Fn(&ScriptApi<'_>, Option<&str>) -> String + Send + Sync,
{
    fn invoke(&self, api: &ScriptApi<'_>, request: Option<&str>) -> String {
        self(api, request)
    }
}

/// Named callables a description may reference with `{ call = "<name>" }`.
///
/// The registry replaces the embedded scripting engine of the original
/// simulator: host code registers callables at startup, tests register
/// doubles.
#[derive(Default, Clone)]
pub struct CallableRegistry {
    entries: HashMap<String, Arc<dyn ScriptCallable>>,
}

impl CallableRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callable: Arc<dyn ScriptCallable>) {
        self.entries.insert(name.into(), callable);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&ScriptApi<'_>, Option<&str>) -> String + Send + Sync + 'static,
    {
        self.register(name, Arc::new(f));
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ScriptCallable>> {
        self.entries.get(name).cloned()
    }
}

impl std::fmt::Debug for CallableRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallableRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use ecusim_interfaces::SimulationError;

    use super::*;

    struct CapturingSender(StdMutex<Vec<Vec<u8>>>);

    impl UdsSender for CapturingSender {
        fn send(&self, payload: &[u8]) -> Result<(), SimulationError> {
            self.0.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    fn ctx() -> ScriptContext {
        ScriptContext::new(None, false)
    }

    #[test]
    fn counter_byte_is_the_second_byte() {
        let ctx = ctx();
        let api = ScriptApi::new(&ctx);
        assert_eq!(api.counter_byte("36 01 AA BB"), "01");
        assert_eq!(api.counter_byte("3602"), "02");
        assert_eq!(api.counter_byte("36"), "");
    }

    #[test]
    fn hash_covers_collected_data_bytes() {
        let ctx = ctx();
        let api = ScriptApi::new(&ctx);
        // data bytes of both messages: "123456789" as bytes 31..39
        api.collect_data_bytes("36 01 31 32 33 34");
        api.collect_data_bytes("36 02 35 36 37 38 39");
        // CRC-CCITT-FFFF("123456789") = 0x29B1
        assert_eq!(api.create_hash(), "29B1");
        // buffer is cleared afterwards
        assert_eq!(api.create_hash(), "FFFF");
    }

    #[test]
    fn hash_is_padded_to_full_bytes() {
        let ctx = ctx();
        let api = ScriptApi::new(&ctx);
        api.collect_data_bytes("36 01 35 34 37 34 32 36 35 36");
        let hash = api.create_hash();
        assert_eq!(hash.len() % 2, 0);
    }

    #[test]
    fn shared_accumulator_crosses_contexts() {
        let first = ScriptContext::new(None, true);
        let second = ScriptContext::new(None, true);
        ScriptApi::new(&first).collect_data_bytes("36 01 31 32 33 34 35");
        ScriptApi::new(&second).collect_data_bytes("36 02 36 37 38 39");
        assert_eq!(ScriptApi::new(&first).create_hash(), "29B1");
    }

    #[test]
    fn session_hooks_reach_the_controller() {
        let ctx = ctx();
        let controller = Arc::new(SessionController::new());
        ctx.register_session_controller(Arc::clone(&controller));
        let api = ScriptApi::new(&ctx);
        assert_eq!(api.current_session(), 0x01);
        api.switch_to_session(0x03);
        assert_eq!(api.current_session(), 0x03);
        assert_eq!(controller.current(), UdsSession::Extended);
        // invalid ids leave the session alone
        api.switch_to_session(0x99);
        assert_eq!(api.current_session(), 0x03);
    }

    #[test]
    fn send_raw_reaches_the_registered_sender() {
        let ctx = ctx();
        let sender = Arc::new(CapturingSender(StdMutex::new(Vec::new())));
        ctx.register_uds_sender(Arc::clone(&sender) as Arc<dyn UdsSender>);
        ScriptApi::new(&ctx).send_raw("DE AD C0 DE");
        assert_eq!(sender.0.lock().unwrap().as_slice(), &[vec![0xDE, 0xAD, 0xC0, 0xDE]]);
        // malformed payloads are dropped
        ScriptApi::new(&ctx).send_raw("ZZ");
        assert_eq!(sender.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn registry_resolves_closures() {
        let mut registry = CallableRegistry::new();
        registry.register_fn("echo", |_api, request| {
            request.unwrap_or_default().to_owned()
        });
        let ctx = ctx();
        let api = ScriptApi::new(&ctx);
        let callable = registry.resolve("echo").unwrap();
        assert_eq!(callable.invoke(&api, Some("22 F1 90")), "22 F1 90");
        assert!(registry.resolve("missing").is_none());
    }
}
