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

//! DoIP gateway of the simulator.
//!
//! One UDP endpoint answers vehicle identification requests and emits
//! announcements; one TCP listener serves diagnostic connections, a single
//! active connection at a time. Received diagnostic messages are multiplexed
//! onto the simulated ECUs by logical address.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use doip_definitions::payload::{
    ActionCode, ActivationCode, AliveCheckResponse, DiagnosticAckCode, DiagnosticMessage,
    DiagnosticMessageAck, DiagnosticMessageNack, DiagnosticNackCode, DoipPayload,
    RoutingActivationResponse, VehicleAnnouncementMessage,
};
use hashbrown::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use ecusim_interfaces::{
    negative_response, nrc, spawn_named, DoipEcuResponder, GatewayCommand, GatewayHandle,
    SimulationError,
};

pub mod config;
mod socket;

pub use config::DoipServerConfig;
use socket::{DoipTcpConnection, DoipUdpSink, DoipUdpSocket, DoipUdpStream};

/// EID announced when the gateway document does not set one.
const DEFAULT_EID: [u8; 6] = [0u8; 6];
/// Tester logical address assumed until a routing activation names one.
const FALLBACK_TESTER_ADDRESS: u16 = 0x0E00;

#[derive(Error, Debug, Clone)]
pub(crate) enum ConnectionError {
    #[error("Decoding error: `{0}`")]
    Decoding(String),
    #[error("Send failed: `{0}`")]
    SendFailed(String),
}

/// Post-handshake callbacks of the DoIP session layer.
///
/// `on_diagnostic_notification` decides between the positive and the
/// negative diagnostic acknowledgement; `on_diagnostic_data` produces the
/// diagnostic payload to send back, if any.
pub trait DiagnosticHandler: Send + Sync + 'static {
    fn on_diagnostic_notification(&self, target_address: u16) -> bool;
    fn on_diagnostic_data(&self, target_address: u16, data: &[u8]) -> Option<DiagnosticReply>;
    fn on_close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticReply {
    pub source_address: u16,
    pub data: Vec<u8>,
}

/// Maps logical addresses onto simulated ECUs.
pub struct EcuMultiplexer<E: DoipEcuResponder> {
    ecus: HashMap<u16, Arc<E>>,
}

impl<E: DoipEcuResponder + 'static> DiagnosticHandler for EcuMultiplexer<E> {
    fn on_diagnostic_notification(&self, target_address: u16) -> bool {
        if self.ecus.contains_key(&target_address) {
            true
        } else {
            tracing::info!(
                target = format_args!("{target_address:#06x}"),
                "no ECU for target address, sending negative diagnostic ack"
            );
            false
        }
    }

    fn on_diagnostic_data(&self, target_address: u16, data: &[u8]) -> Option<DiagnosticReply> {
        let ecu = self.ecus.get(&target_address)?;
        match ecu.doip_response(data) {
            Some(response) if response.is_empty() => None,
            Some(response) => Some(DiagnosticReply {
                source_address: target_address,
                data: response,
            }),
            None => Some(DiagnosticReply {
                source_address: target_address,
                data: negative_response(
                    data.first().copied().unwrap_or(0x00),
                    nrc::SERVICE_NOT_SUPPORTED,
                ),
            }),
        }
    }

    fn on_close(&self) {
        tracing::debug!("DoIP connection closed");
    }
}

struct ConnectionControl {
    disconnect: Notify,
    outbound: RwLock<Option<mpsc::UnboundedSender<(u16, Vec<u8>)>>>,
}

/// The gateway before start: collects ECU registrations.
pub struct DoipGateway<E: DoipEcuResponder + 'static> {
    config: DoipServerConfig,
    ecus: HashMap<u16, Arc<E>>,
    command_tx: mpsc::UnboundedSender<GatewayCommand>,
    command_rx: mpsc::UnboundedReceiver<GatewayCommand>,
}

/// Handles of the running gateway tasks.
pub struct RunningGateway {
    handle: GatewayHandle,
    handles: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    #[must_use]
    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Wait for the listener tasks after shutdown was signalled.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "DoIP task failed");
            }
        }
    }
}

impl<E: DoipEcuResponder + 'static> DoipGateway<E> {
    #[must_use]
    pub fn new(config: DoipServerConfig) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        DoipGateway {
            config,
            ecus: HashMap::new(),
            command_tx,
            command_rx,
        }
    }

    /// Cross-task control handle; valid before and after start.
    #[must_use]
    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle::new(self.command_tx.clone())
    }

    /// Attach a simulated ECU under its logical address. Must happen before
    /// `start`; the table is read-only afterwards.
    pub fn register_ecu(&mut self, logical_address: u16, ecu: Arc<E>) {
        if self
            .ecus
            .insert(logical_address, ecu)
            .is_some()
        {
            tracing::warn!(
                logical_address = format_args!("{logical_address:#06x}"),
                "replacing previously registered ECU"
            );
        }
    }

    /// Bind the sockets, emit the startup announcements and spawn the
    /// listener tasks.
    ///
    /// # Errors
    /// `SimulationError::Fatal` when a socket cannot be bound.
    pub async fn start<F>(self, shutdown: F) -> Result<RunningGateway, SimulationError>
    where
        F: Future<Output = ()> + Clone + Send + 'static,
    {
        let DoipGateway {
            config,
            ecus,
            command_tx,
            command_rx,
        } = self;

        tracing::info!(
            logical_address = format_args!("{:#06x}", config.logical_address),
            port = config.port,
            ecu_count = ecus.len(),
            "starting DoIP gateway"
        );

        let udp = DoipUdpSocket::new(create_udp_socket(&config)?)
            .map_err(|e| SimulationError::Fatal(format!("DoIP UDP socket: {e}")))?;
        let (udp_sink, udp_stream) = udp.split();
        let udp_sink = Arc::new(Mutex::new(udp_sink));

        let listener = tokio::net::TcpListener::bind((config.bind_address.as_str(), config.port))
            .await
            .map_err(|e| SimulationError::Fatal(format!("DoIP TCP listener: {e}")))?;

        let config = Arc::new(config);
        let handler = Arc::new(EcuMultiplexer { ecus });
        let control = Arc::new(ConnectionControl {
            disconnect: Notify::new(),
            outbound: RwLock::new(None),
        });

        // announcement on start, before the listeners take over the sockets
        announce(&udp_sink, &config).await;

        let handles = vec![
            spawn_named!(
                "doip-udp-listen",
                udp_listen_task(
                    udp_stream,
                    Arc::clone(&udp_sink),
                    Arc::clone(&config),
                    shutdown.clone()
                )
            ),
            spawn_named!(
                "doip-commands",
                command_task(
                    command_rx,
                    udp_sink,
                    Arc::clone(&config),
                    Arc::clone(&control),
                    shutdown.clone()
                )
            ),
            spawn_named!(
                "doip-tcp-listen",
                tcp_listen_task(listener, handler, control, config, shutdown)
            ),
        ];

        Ok(RunningGateway {
            handle: GatewayHandle::new(command_tx),
            handles,
        })
    }
}

async fn udp_listen_task<F>(
    mut stream: DoipUdpStream,
    sink: Arc<Mutex<DoipUdpSink>>,
    config: Arc<DoipServerConfig>,
    shutdown: F,
) where
    F: Future<Output = ()> + Clone + Send + 'static,
{
    loop {
        tokio::select! {
            () = shutdown.clone() => break,
            received = stream.recv() => match received {
                Some(Ok((msg, source))) => {
                    let identification = matches!(
                        msg.payload,
                        DoipPayload::VehicleIdentificationRequest(_)
                            | DoipPayload::VehicleIdentificationRequestEid(_)
                            | DoipPayload::VehicleIdentificationRequestVin(_)
                    );
                    if !identification {
                        continue;
                    }
                    tracing::debug!(%source, "vehicle identification request");
                    let vam = build_vam(&config);
                    if let Err(e) = sink
                        .lock()
                        .await
                        .send(DoipPayload::VehicleAnnouncementMessage(vam), source)
                        .await
                    {
                        tracing::warn!(error = %e, "failed to answer identification request");
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "UDP receive failed"),
                None => break,
            }
        }
    }
    tracing::debug!("UDP listener stopped");
}

async fn command_task<F>(
    mut command_rx: mpsc::UnboundedReceiver<GatewayCommand>,
    udp_sink: Arc<Mutex<DoipUdpSink>>,
    config: Arc<DoipServerConfig>,
    control: Arc<ConnectionControl>,
    shutdown: F,
) where
    F: Future<Output = ()> + Clone + Send + 'static,
{
    loop {
        tokio::select! {
            () = shutdown.clone() => break,
            command = command_rx.recv() => match command {
                Some(GatewayCommand::Disconnect) => control.disconnect.notify_waiters(),
                Some(GatewayCommand::SendAnnouncements) => announce(&udp_sink, &config).await,
                Some(GatewayCommand::SendDiagnostic { source_address, data }) => {
                    let sender = control.outbound.read().await.clone();
                    match sender {
                        Some(tx) => {
                            let _ = tx.send((source_address, data));
                        }
                        None => tracing::warn!("no active DoIP connection, dropping payload"),
                    }
                }
                None => break,
            }
        }
    }
    tracing::debug!("command task stopped");
}

async fn tcp_listen_task<H, F>(
    listener: tokio::net::TcpListener,
    handler: Arc<H>,
    control: Arc<ConnectionControl>,
    config: Arc<DoipServerConfig>,
    shutdown: F,
) where
    H: DiagnosticHandler,
    F: Future<Output = ()> + Clone + Send + 'static,
{
    loop {
        tokio::select! {
            () = shutdown.clone() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!(%peer, "DoIP connection accepted");
                    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                    *control.outbound.write().await = Some(outbound_tx);
                    connection_loop(
                        DoipTcpConnection::new(stream),
                        outbound_rx,
                        &control,
                        &handler,
                        &config,
                        shutdown.clone(),
                    )
                    .await;
                    *control.outbound.write().await = None;
                    handler.on_close();
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    tracing::debug!("TCP listener stopped");
}

async fn connection_loop<H, F>(
    mut conn: DoipTcpConnection,
    mut outbound: mpsc::UnboundedReceiver<(u16, Vec<u8>)>,
    control: &ConnectionControl,
    handler: &Arc<H>,
    config: &DoipServerConfig,
    shutdown: F,
) where
    H: DiagnosticHandler,
    F: Future<Output = ()> + Clone + Send + 'static,
{
    let inactivity = Duration::from_secs(config.tcp_inactivity_secs.max(1));
    let mut tester_address = FALLBACK_TESTER_ADDRESS;

    loop {
        tokio::select! {
            () = shutdown.clone() => break,
            () = control.disconnect.notified() => {
                tracing::info!("disconnection triggered");
                break;
            }
            outgoing = outbound.recv() => {
                let Some((source_address, data)) = outgoing else { break };
                let msg = DoipPayload::DiagnosticMessage(DiagnosticMessage {
                    source_address: source_address.to_be_bytes(),
                    target_address: tester_address.to_be_bytes(),
                    message: data,
                });
                if let Err(e) = conn.send(msg).await {
                    tracing::warn!(error = %e, "failed to send diagnostic payload");
                    break;
                }
            }
            read = tokio::time::timeout(inactivity, conn.read()) => match read {
                Err(_) => {
                    tracing::info!("general inactivity timer expired, closing connection");
                    break;
                }
                Ok(None) => {
                    tracing::debug!("connection closed by peer");
                    break;
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(error = %e, "connection read failed");
                    break;
                }
                Ok(Some(Ok(msg))) => {
                    if !handle_payload(&mut conn, msg.payload, &mut tester_address, handler, config)
                        .await
                    {
                        break;
                    }
                }
            }
        }
    }
}

/// Handle one message of the active connection; `false` ends the connection.
async fn handle_payload<H: DiagnosticHandler>(
    conn: &mut DoipTcpConnection,
    payload: DoipPayload,
    tester_address: &mut u16,
    handler: &Arc<H>,
    config: &DoipServerConfig,
) -> bool {
    match payload {
        DoipPayload::RoutingActivationRequest(request) => {
            *tester_address = u16::from_be_bytes(request.source_address);
            tracing::info!(
                tester = format_args!("{:#06x}", *tester_address),
                "routing activation"
            );
            let response = DoipPayload::RoutingActivationResponse(RoutingActivationResponse {
                logical_address: request.source_address,
                source_address: config.logical_address.to_be_bytes(),
                activation_code: ActivationCode::SuccessfullyActivated,
                buffer: [0; 4],
            });
            if let Err(e) = conn.send(response).await {
                tracing::warn!(error = %e, "failed to send routing activation response");
                return false;
            }
        }
        DoipPayload::AliveCheckRequest(_) => {
            let response = DoipPayload::AliveCheckResponse(AliveCheckResponse {
                source_address: config.logical_address.to_be_bytes(),
            });
            if let Err(e) = conn.send(response).await {
                tracing::warn!(error = %e, "failed to send alive check response");
                return false;
            }
        }
        DoipPayload::DiagnosticMessage(diag) => {
            let target = u16::from_be_bytes(diag.target_address);
            *tester_address = u16::from_be_bytes(diag.source_address);

            if !handler.on_diagnostic_notification(target) {
                let nack = DoipPayload::DiagnosticMessageNack(DiagnosticMessageNack {
                    source_address: diag.target_address,
                    target_address: diag.source_address,
                    nack_code: DiagnosticNackCode::UnknownTargetAddress,
                });
                if let Err(e) = conn.send(nack).await {
                    tracing::warn!(error = %e, "failed to send diagnostic nack");
                    return false;
                }
                return true;
            }

            let ack = DoipPayload::DiagnosticMessageAck(DiagnosticMessageAck {
                source_address: diag.target_address,
                target_address: diag.source_address,
                ack_code: DiagnosticAckCode::Acknowledged,
            });
            if let Err(e) = conn.send(ack).await {
                tracing::warn!(error = %e, "failed to send diagnostic ack");
                return false;
            }

            // scripted callables may sleep, keep them off the reactor
            let dispatch = Arc::clone(handler);
            let message = diag.message;
            let reply = tokio::task::spawn_blocking(move || {
                dispatch.on_diagnostic_data(target, &message)
            })
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "diagnostic dispatch task failed");
                None
            });

            if let Some(reply) = reply {
                tracing::debug!(bytes = reply.data.len(), "DoIP UDS sending");
                let msg = DoipPayload::DiagnosticMessage(DiagnosticMessage {
                    source_address: reply.source_address.to_be_bytes(),
                    target_address: diag.source_address,
                    message: reply.data,
                });
                if let Err(e) = conn.send(msg).await {
                    tracing::warn!(error = %e, "failed to send diagnostic response");
                    return false;
                }
            }
        }
        other => tracing::debug!(payload = ?other, "ignoring DoIP message"),
    }
    true
}

async fn announce(sink: &Mutex<DoipUdpSink>, config: &DoipServerConfig) {
    let target: SocketAddr = match format!("255.255.255.255:{}", config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::warn!(error = %e, "invalid announcement address");
            return;
        }
    };
    tracing::info!(count = config.announce_num, "sending vehicle announcements");
    for _ in 0..config.announce_num {
        let vam = DoipPayload::VehicleAnnouncementMessage(build_vam(config));
        if let Err(e) = sink.lock().await.send(vam, target).await {
            tracing::warn!(error = %e, "failed to send vehicle announcement");
        }
        tokio::time::sleep(Duration::from_millis(config.announce_interval_ms)).await;
    }
}

fn build_vam(config: &DoipServerConfig) -> VehicleAnnouncementMessage {
    VehicleAnnouncementMessage {
        vin: config.vin_bytes(),
        logical_address: config.logical_address.to_be_bytes(),
        eid: config.eid.map_or(DEFAULT_EID, low_six_bytes),
        gid: low_six_bytes(config.gid),
        further_action: further_action_code(config.further_action),
        vin_gid_sync: None,
    }
}

fn low_six_bytes(value: u64) -> [u8; 6] {
    let bytes = value.to_be_bytes();
    [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
}

fn further_action_code(value: u8) -> ActionCode {
    match value {
        0x00 => ActionCode::NoFurtherActionRequired,
        0x10 => ActionCode::RoutingActivationRequired,
        other => {
            tracing::warn!(value = other, "unknown further action byte, announcing none");
            ActionCode::NoFurtherActionRequired
        }
    }
}

fn create_udp_socket(config: &DoipServerConfig) -> Result<std::net::UdpSocket, SimulationError> {
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .map_err(|e| {
            SimulationError::Configuration(format!("invalid DoIP bind address: {e}"))
        })?;

    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .map_err(|e| SimulationError::Fatal(format!("Failed to create socket: {e:?}")))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| SimulationError::Fatal(format!("Failed to set reuse address: {e:?}")))?;
    #[cfg(target_family = "unix")]
    socket
        .set_reuse_port(true)
        .map_err(|e| SimulationError::Fatal(format!("Failed to set reuse port: {e:?}")))?;
    socket
        .set_broadcast(true)
        .map_err(|e| SimulationError::Fatal(format!("Failed to set broadcast flag: {e:?}")))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| SimulationError::Fatal(format!("Failed to set non-blocking mode: {e:?}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| SimulationError::Fatal(format!("Failed to bind socket, {addr}: {e:?}")))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use ecusim_core::script::description::EcuDescription;
    use ecusim_core::{CallableRegistry, ScriptedEcu};

    use super::*;

    fn multiplexer(toml: &str, logical_address: u16) -> EcuMultiplexer<ScriptedEcu> {
        let description = EcuDescription::from_toml_str(toml).unwrap();
        let ecu = Arc::new(ScriptedEcu::from_description(
            description,
            &CallableRegistry::new(),
            false,
        ));
        let mut ecus = HashMap::new();
        ecus.insert(logical_address, ecu);
        EcuMultiplexer { ecus }
    }

    #[test]
    fn unknown_target_is_nacked_without_dispatch() {
        let mux = multiplexer("[PCM]\n[PCM.Raw]\n\"22 F1 90\" = \"62\"\n", 0x1001);
        assert!(!mux.on_diagnostic_notification(0x1234));
        assert!(mux.on_diagnostic_notification(0x1001));
        // no scripted invocation happens for unknown targets
        assert_eq!(mux.on_diagnostic_data(0x1234, &[0x22, 0xF1, 0x90]), None);
    }

    #[test]
    fn scripted_response_is_sent_with_the_ecu_address() {
        let mux = multiplexer(
            "[PCM]\n[PCM.Raw]\n\"22 F1 90\" = \"62 F1 90 41\"\n",
            0x1001,
        );
        assert_eq!(
            mux.on_diagnostic_data(0x1001, &[0x22, 0xF1, 0x90]),
            Some(DiagnosticReply {
                source_address: 0x1001,
                data: vec![0x62, 0xF1, 0x90, 0x41],
            })
        );
    }

    #[test]
    fn unscripted_request_yields_a_negative_response() {
        let mux = multiplexer("[PCM]\n", 0x1001);
        assert_eq!(
            mux.on_diagnostic_data(0x1001, &[0x10, 0x02]),
            Some(DiagnosticReply {
                source_address: 0x1001,
                data: vec![0x7F, 0x10, 0x11],
            })
        );
        // an empty payload still gets the negative shape with SID 0
        assert_eq!(
            mux.on_diagnostic_data(0x1001, &[]),
            Some(DiagnosticReply {
                source_address: 0x1001,
                data: vec![0x7F, 0x00, 0x11],
            })
        );
    }

    #[test]
    fn scripted_silence_suppresses_the_reply() {
        let mux = multiplexer("[PCM]\n[PCM.Raw]\n\"11 01\" = \"\"\n", 0x1001);
        assert_eq!(mux.on_diagnostic_data(0x1001, &[0x11, 0x01]), None);
    }

    #[test]
    fn vam_carries_the_configured_identity() {
        let config = DoipServerConfig {
            vin: "WVWZZZ3CZWE123456".to_owned(),
            logical_address: 0x0201,
            eid: Some(0x0011_2233_4455),
            gid: 0x0A0B_0C0D_0E0F,
            further_action: 0x10,
            ..DoipServerConfig::default()
        };
        let vam = build_vam(&config);
        assert_eq!(&vam.vin, b"WVWZZZ3CZWE123456");
        assert_eq!(vam.logical_address, [0x02, 0x01]);
        assert_eq!(vam.eid, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(vam.gid, [0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]);
        assert!(matches!(
            vam.further_action,
            ActionCode::RoutingActivationRequired
        ));
    }

    #[test]
    fn vam_defaults_without_eid() {
        let vam = build_vam(&DoipServerConfig::default());
        assert_eq!(vam.vin, [b'0'; 17]);
        assert_eq!(vam.eid, DEFAULT_EID);
        assert!(matches!(
            vam.further_action,
            ActionCode::NoFurtherActionRequired
        ));
    }
}
