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

use std::net::SocketAddr;

use doip_codec::DoipCodec;
use doip_definitions::{
    builder::DoipMessageBuilder, header::ProtocolVersion, message::DoipMessage,
    payload::DoipPayload,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio_util::{codec::Framed, udp::UdpFramed};

use crate::ConnectionError;

/// One framed DoIP TCP connection on the server side.
pub(crate) struct DoipTcpConnection {
    io: Framed<tokio::net::TcpStream, DoipCodec>,
    protocol: ProtocolVersion,
}

impl DoipTcpConnection {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        Self {
            io: Framed::new(stream, DoipCodec {}),
            protocol: ProtocolVersion::Iso13400_2012,
        }
    }

    pub async fn send(&mut self, msg: DoipPayload) -> Result<(), ConnectionError> {
        let msg = DoipMessageBuilder::new()
            .protocol_version(self.protocol)
            .payload(msg)
            .build();
        self.io
            .send(msg)
            .await
            .map_err(|e| ConnectionError::SendFailed(format!("Failed to send message: {e:?}")))
    }

    pub async fn read(&mut self) -> Option<Result<DoipMessage, ConnectionError>> {
        self.io.next().await.map(|opt| {
            opt.map_err(|e| ConnectionError::Decoding(format!("Failed to read message: {e:?}")))
        })
    }
}

/// The gateway's UDP endpoint for vehicle identification and announcements.
pub(crate) struct DoipUdpSocket {
    io: UdpFramed<DoipCodec, tokio::net::UdpSocket>,
    protocol: ProtocolVersion,
}

impl DoipUdpSocket {
    pub fn new(socket: std::net::UdpSocket) -> Result<Self, std::io::Error> {
        let tokio_socket = tokio::net::UdpSocket::from_std(socket)?;
        Ok(Self {
            io: UdpFramed::new(tokio_socket, DoipCodec {}),
            protocol: ProtocolVersion::Iso13400_2012,
        })
    }

    /// Separate the send and receive halves so announcements never contend
    /// with the identification listener.
    pub fn split(self) -> (DoipUdpSink, DoipUdpStream) {
        let (sink, stream) = self.io.split();
        (
            DoipUdpSink {
                io: sink,
                protocol: self.protocol,
            },
            DoipUdpStream { io: stream },
        )
    }
}

pub(crate) struct DoipUdpSink {
    io: SplitSink<UdpFramed<DoipCodec, tokio::net::UdpSocket>, (DoipMessage, SocketAddr)>,
    protocol: ProtocolVersion,
}

impl DoipUdpSink {
    pub async fn send(
        &mut self,
        payload: DoipPayload,
        addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let msg = DoipMessageBuilder::new()
            .protocol_version(self.protocol)
            .payload(payload)
            .build();
        self.io
            .send((msg, addr))
            .await
            .map_err(|e| ConnectionError::SendFailed(format!("Failed to send message: {e:?}")))
    }
}

pub(crate) struct DoipUdpStream {
    io: SplitStream<UdpFramed<DoipCodec, tokio::net::UdpSocket>>,
}

impl DoipUdpStream {
    pub async fn recv(&mut self) -> Option<Result<(DoipMessage, SocketAddr), ConnectionError>> {
        self.io.next().await.map(|opt| {
            opt.map_err(|e| ConnectionError::Decoding(format!("Failed to read message: {e:?}")))
        })
    }
}
