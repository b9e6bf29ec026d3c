// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream sockets the relay can serve on

use std::io::{Read as _, Write as _};
use std::os::fd::{AsRawFd as _, FromRawFd as _};

/// CID addressing the host from a guest
pub const VMADDR_CID_HOST: u32 = 2;

pub trait Listener {
    type Stream: std::io::Read + std::io::Write + Send + 'static;

    fn accept(&self) -> std::io::Result<Self::Stream>;
}

impl Listener for std::net::TcpListener {
    type Stream = std::net::TcpStream;

    fn accept(&self) -> std::io::Result<Self::Stream> {
        std::net::TcpListener::accept(self).map(|(stream, _)| stream)
    }
}

impl Listener for std::os::unix::net::UnixListener {
    type Stream = std::os::unix::net::UnixStream;

    fn accept(&self) -> std::io::Result<Self::Stream> {
        std::os::unix::net::UnixListener::accept(self).map(|(stream, _)| stream)
    }
}

/// Listening `AF_VSOCK` stream socket
#[derive(Debug)]
pub struct VsockListener {
    socket: std::os::fd::OwnedFd,
}

impl VsockListener {
    pub fn bind(cid: u32, port: u32) -> std::io::Result<Self> {
        let socket = vsock_socket()?;

        nix::sys::socket::bind(
            socket.as_raw_fd(),
            &nix::sys::socket::VsockAddr::new(cid, port),
        )?;
        nix::sys::socket::listen(&socket, nix::sys::socket::Backlog::MAXCONN)?;

        log::info!("Listening on vsock CID {cid}, port {port}");

        Ok(Self { socket })
    }
}

impl Listener for VsockListener {
    type Stream = VsockStream;

    fn accept(&self) -> std::io::Result<Self::Stream> {
        let socket = nix::sys::socket::accept(self.socket.as_raw_fd())?;

        // SAFETY: accept returned a new descriptor nothing else owns
        let socket = unsafe { std::os::fd::OwnedFd::from_raw_fd(socket) };

        Ok(VsockStream(socket.into()))
    }
}

/// Connected `AF_VSOCK` stream socket
#[derive(Debug)]
pub struct VsockStream(std::fs::File);

impl VsockStream {
    pub fn connect(cid: u32, port: u32) -> std::io::Result<Self> {
        let socket = vsock_socket()?;

        nix::sys::socket::connect(
            socket.as_raw_fd(),
            &nix::sys::socket::VsockAddr::new(cid, port),
        )?;

        Ok(Self(socket.into()))
    }
}

impl std::io::Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.0.read(buf)
    }
}

impl std::io::Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

fn vsock_socket() -> std::io::Result<std::os::fd::OwnedFd> {
    Ok(nix::sys::socket::socket(
        nix::sys::socket::AddressFamily::Vsock,
        nix::sys::socket::SockType::Stream,
        nix::sys::socket::SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}
