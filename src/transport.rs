// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The datagram transport façade.
//!
//! [`ConnectionTransport`] is the seam between the connection state
//! machine and an actual unreliable datagram socket. Two
//! implementations are provided: [`EndpointTransport`], over a
//! [`tokio::net::UdpSocket`] already `connect()`-ed to exactly one
//! remote, and [`SharedTransport`], over a socket shared by several
//! logical connections, each addressed by its own [`SocketAddr`].

use std::{net::SocketAddr, pin::Pin, sync::Arc};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionError, Result};

fn concat(buffers: &[&[u8]]) -> Vec<u8> {
    let total: usize = buffers.iter().map(|b| b.len()).sum();
    let mut out = Vec::with_capacity(total);
    for b in buffers {
        out.extend_from_slice(b);
    }
    out
}

/// A handler invoked when the transport observes a fault it cannot
/// recover from (socket error, peer unreachable).
pub trait TransportExceptionHandler: Send + Sync {
    fn on_exception(&self, error: &ConnectionError);
}

/// The datagram transport seam.
///
/// `queue_packet` is the non-blocking fast path: it attempts an
/// immediate, non-fragmenting send and returns `false` rather than
/// block when the socket's send buffer is full. `queue_and_send` is the
/// fallback used when the caller is willing to wait.
pub trait ConnectionTransport: Send + Sync {
    /// Attempt to send `buffers` concatenated as a single datagram
    /// without waiting. Returns `false` on backpressure or fault (the
    /// latter also invokes the exception handler).
    fn queue_packet(&self, buffers: &[&[u8]]) -> bool;

    /// Send `buffers` concatenated as a single datagram, waiting for
    /// socket readiness if necessary.
    fn queue_and_send<'a>(
        &'a self,
        buffers: &'a [&'a [u8]],
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Receive the next inbound datagram into `buf`, returning the
    /// number of bytes written.
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;

    /// Release any transport-owned resources. A no-op for sockets that
    /// close on drop; present so an owning [`Connection`](crate::connection::Connection)
    /// has a single place to call regardless of transport kind.
    fn dispose(&self) {}

    /// Install the handler invoked on unrecoverable transport faults.
    fn set_exception_handler(&self, handler: Arc<dyn TransportExceptionHandler>);

    /// The peer this transport carries datagrams to and from.
    fn remote_endpoint(&self) -> SocketAddr;
}

/// A [`ConnectionTransport`] over a [`tokio::net::UdpSocket`] that is
/// already connected to a single remote peer.
pub struct EndpointTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    exception_handler: std::sync::Mutex<Option<Arc<dyn TransportExceptionHandler>>>,
}

impl EndpointTransport {
    /// `socket` must already be `connect()`-ed; its peer address becomes
    /// [`ConnectionTransport::remote_endpoint`].
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        let remote = socket
            .peer_addr()
            .expect("EndpointTransport requires an already-connected socket");
        Self { socket, remote, exception_handler: std::sync::Mutex::new(None) }
    }

    /// Block until the socket's writable-readiness has been polled at
    /// least once. `try_send`/`try_recv` report `WouldBlock` until the
    /// reactor has registered interest in the underlying fd; callers
    /// that construct a transport and immediately use [`queue_packet`](ConnectionTransport::queue_packet)
    /// should await this once first.
    pub async fn wait_writable(&self) -> std::io::Result<()> {
        self.socket.writable().await
    }

    fn report(&self, error: &ConnectionError) {
        if let Some(handler) =
            self.exception_handler.lock().expect("exception handler lock poisoned").as_ref()
        {
            handler.on_exception(error);
        }
    }
}

impl ConnectionTransport for EndpointTransport {
    fn set_exception_handler(&self, handler: Arc<dyn TransportExceptionHandler>) {
        *self.exception_handler.lock().expect("exception handler lock poisoned") =
            Some(handler);
    }

    fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    fn queue_packet(&self, buffers: &[&[u8]]) -> bool {
        let datagram = concat(buffers);
        match self.socket.try_send(&datagram) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                self.report(&ConnectionError::TransportError(e.to_string()));
                false
            },
        }
    }

    fn queue_and_send<'a>(
        &'a self,
        buffers: &'a [&'a [u8]],
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let datagram = concat(buffers);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
                result = self.socket.send(&datagram) => {
                    result.map(|_| ()).map_err(|e| {
                        let err = ConnectionError::TransportError(e.to_string());
                        self.report(&err);
                        err
                    })
                }
            }
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            self.socket.recv(buf).await.map_err(|e| {
                let err = ConnectionError::TransportError(e.to_string());
                self.report(&err);
                err
            })
        })
    }
}

/// A [`ConnectionTransport`] over a socket shared by several logical
/// connections, each pinned to its own `remote` address. Outbound
/// datagrams go via `send_to`/`try_send_to`; inbound ones are accepted
/// only from `remote`, with datagrams from any other peer dropped.
///
/// `recv` assumes it is the only reader draining `remote`'s datagrams
/// off the shared socket. A deployment routing many connections over
/// one socket demultiplexes inbound reads externally (by source
/// address) and feeds each connection's `input_packet` directly,
/// bypassing `recv` on this transport entirely.
pub struct SharedTransport {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    exception_handler: std::sync::Mutex<Option<Arc<dyn TransportExceptionHandler>>>,
}

impl SharedTransport {
    pub fn new(socket: Arc<UdpSocket>, remote: SocketAddr) -> Self {
        Self { socket, remote, exception_handler: std::sync::Mutex::new(None) }
    }

    fn report(&self, error: &ConnectionError) {
        if let Some(handler) =
            self.exception_handler.lock().expect("exception handler lock poisoned").as_ref()
        {
            handler.on_exception(error);
        }
    }
}

impl ConnectionTransport for SharedTransport {
    fn set_exception_handler(&self, handler: Arc<dyn TransportExceptionHandler>) {
        *self.exception_handler.lock().expect("exception handler lock poisoned") =
            Some(handler);
    }

    fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    fn queue_packet(&self, buffers: &[&[u8]]) -> bool {
        let datagram = concat(buffers);
        match self.socket.try_send_to(&datagram, self.remote) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) => {
                self.report(&ConnectionError::TransportError(e.to_string()));
                false
            },
        }
    }

    fn queue_and_send<'a>(
        &'a self,
        buffers: &'a [&'a [u8]],
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let datagram = concat(buffers);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
                result = self.socket.send_to(&datagram, self.remote) => {
                    result.map(|_| ()).map_err(|e| {
                        let err = ConnectionError::TransportError(e.to_string());
                        self.report(&err);
                        err
                    })
                }
            }
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                match self.socket.recv_from(buf).await {
                    Ok((n, addr)) if addr == self.remote => return Ok(n),
                    Ok(_) => continue,
                    Err(e) => {
                        let err = ConnectionError::TransportError(e.to_string());
                        self.report(&err);
                        return Err(err);
                    },
                }
            }
        })
    }
}
