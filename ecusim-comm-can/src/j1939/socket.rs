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

//! SOCK_DGRAM/CAN_J1939 socket, see
//! <https://www.kernel.org/doc/html/latest/networking/j1939.html>.
//!
//! The kernel handles addressing and transport sessions; one datagram is one
//! complete parameter group. Sockets are opened non-blocking so the receive
//! loop stays cancellable through the shared active flag.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use ecusim_interfaces::SimulationError;

#[derive(Debug)]
pub struct J1939Socket {
    fd: RawFd,
}

fn j1939_sockaddr(ifindex: i32, address: u8, pgn: u32) -> libc::sockaddr_can {
    // SAFETY: sockaddr_can is a plain C struct, the all-zero pattern is valid
    let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
    addr.can_family = libc::AF_CAN as libc::sa_family_t;
    addr.can_ifindex = ifindex;
    addr.can_addr.j1939.name = libc::J1939_NO_NAME;
    addr.can_addr.j1939.pgn = pgn;
    addr.can_addr.j1939.addr = address;
    addr
}

fn interface_index(device: &str) -> io::Result<i32> {
    let name = std::ffi::CString::new(device)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "device name with NUL"))?;
    // SAFETY: name is a valid NUL terminated string
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index as i32)
}

impl J1939Socket {
    /// Open and bind a J1939 socket at `source_address`, receiving all PGNs.
    ///
    /// # Errors
    /// `SimulationError::Fatal` on any socket/bind failure; J1939 support
    /// requires a CAN interface with J1939 enabled.
    pub fn open(device: &str, source_address: u8) -> Result<Self, SimulationError> {
        Self::open_impl(device, source_address)
            .map_err(|e| SimulationError::Fatal(format!("J1939 socket on {device}: {e}")))
    }

    fn open_impl(device: &str, source_address: u8) -> io::Result<Self> {
        // SAFETY: plain socket syscall
        let fd = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_DGRAM, libc::CAN_J1939) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = J1939Socket { fd };

        let broadcast: libc::c_int = 1;
        // SAFETY: fd is a valid socket, broadcast outlives the call
        let rc = unsafe {
            libc::setsockopt(
                socket.fd,
                libc::SOL_SOCKET,
                libc::SO_BROADCAST,
                std::ptr::addr_of!(broadcast).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let addr = j1939_sockaddr(interface_index(device)?, source_address, libc::J1939_NO_PGN);
        // SAFETY: addr is a valid sockaddr_can for the duration of the call
        let rc = unsafe {
            libc::bind(
                socket.fd,
                std::ptr::addr_of!(addr).cast(),
                mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: plain fcntl on an owned fd
        let rc = unsafe {
            let flags = libc::fcntl(socket.fd, libc::F_GETFL);
            libc::fcntl(socket.fd, libc::F_SETFL, flags | libc::O_NONBLOCK)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(socket)
    }

    /// Poll for one datagram. Returns the length, the sender's source
    /// address and the PGN it was sent with; `Ok(None)` when nothing is
    /// pending.
    ///
    /// # Errors
    /// The raw IO error for anything but "would block".
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, u8, u32)>> {
        // SAFETY: zeroed sockaddr_can is valid, buf bounds are passed along
        let mut addr: libc::sockaddr_can = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_can>() as libc::socklen_t;
        let received = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                std::ptr::addr_of_mut!(addr).cast(),
                &mut addr_len,
            )
        };
        if received < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(e),
            };
        }
        // SAFETY: the kernel filled the j1939 member for CAN_J1939 sockets
        let (source, pgn) = unsafe { (addr.can_addr.j1939.addr, addr.can_addr.j1939.pgn) };
        Ok(Some((received as usize, source, pgn)))
    }

    /// Send a datagram to `destination` with the given PGN.
    ///
    /// # Errors
    /// The raw IO error; `WouldBlock` surfaces to the caller so cyclic
    /// senders can pace their retries.
    pub fn send_to(&self, payload: &[u8], destination: u8, pgn: u32) -> io::Result<usize> {
        let addr = j1939_sockaddr(0, destination, pgn);
        // SAFETY: addr and payload are valid for the duration of the call
        let sent = unsafe {
            libc::sendto(
                self.fd,
                payload.as_ptr().cast(),
                payload.len(),
                libc::MSG_DONTWAIT,
                std::ptr::addr_of!(addr).cast(),
                mem::size_of::<libc::sockaddr_can>() as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(sent as usize)
    }
}

impl Drop for J1939Socket {
    fn drop(&mut self) {
        // SAFETY: fd was obtained from socket() and is closed exactly once
        unsafe {
            libc::close(self.fd);
        }
    }
}
