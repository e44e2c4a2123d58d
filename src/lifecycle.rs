// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Connection construction and the dead-detection sweep.
//!
//! `connect` is the owning-transport convenience path: bind a UDP socket,
//! connect it to a single remote, and wrap it in a [`Connection`] that
//! disposes the socket on teardown. The dead-detection sweep is the
//! free-standing half of liveness tracking: something external must call
//! it periodically against every live connection.

use std::sync::Arc;

use tokio::net::{ToSocketAddrs, UdpSocket};

use crate::{
    buffer::BufferPool,
    cfg::config::Config,
    connection::{ConnState, Connection},
    error::Result,
    transport::{ConnectionTransport, EndpointTransport},
};

/// Bind a UDP socket, connect it to `remote`, and wrap it in a
/// transport-owning [`Connection`]. Spawns a background task that drives
/// [`Connection::input_packet`] from the socket until the connection
/// reaches a terminal state.
pub async fn connect<A: ToSocketAddrs>(
    remote: A,
    pool: Arc<dyn BufferPool>,
    config: &Config,
) -> Result<Arc<Connection>> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| crate::error::ConnectionError::TransportError(e.to_string()))?;
    socket
        .connect(remote)
        .await
        .map_err(|e| crate::error::ConnectionError::TransportError(e.to_string()))?;

    let transport = Arc::new(EndpointTransport::new(Arc::new(socket)));
    transport
        .wait_writable()
        .await
        .map_err(|e| crate::error::ConnectionError::TransportError(e.to_string()))?;
    let conn = Connection::new(transport.clone(), pool, config, true);

    let reader = conn.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            match transport.recv(&mut buf).await {
                Ok(n) => reader.input_packet(&buf[..n]).await,
                Err(_) => {
                    reader.set_transport_closed().await;
                    break;
                },
            }
            if matches!(reader.state(), ConnState::Dead) {
                break;
            }
        }
    });

    Ok(conn)
}

/// Call [`Connection::check_dead_detection`] with `now` against every
/// connection in `connections`, in order, applying each connection's
/// own configured `dead_detection_threshold_ms`. Returns the number
/// that transitioned (or already were) dead. `now` should come from
/// [`crate::connection::now_ms`] so it shares the clock liveness
/// tracking itself advances against.
pub async fn run_dead_detection_sweep(connections: &[Arc<Connection>], now: i64) -> usize {
    let mut dead = 0;
    for conn in connections {
        if conn.check_dead_detection(now).await {
            dead += 1;
        }
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HeapBufferPool;

    #[tokio::test]
    async fn connect_wraps_a_connected_udp_socket() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("local addr");

        let conn = connect(addr, HeapBufferPool::shared(), &Config::default())
            .await
            .expect("connect");
        conn.skip_negotiation().await.expect("skip negotiation");
        assert!(conn.send(&[1, 2, 3]).expect("send"));

        let mut buf = [0u8; 64];
        let (n, _) = listener.recv_from(&mut buf).await.expect("recv");
        assert_eq!(buf[0], 0x03);
        assert!(n > 0);
    }

    #[tokio::test]
    async fn sweep_counts_transitions_and_is_idempotent_on_terminal_states() {
        let listener = UdpSocket::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        let config = Config { dead_detection_threshold_ms: -1, ..Config::default() };
        let conn = connect(addr, HeapBufferPool::shared(), &config).await.expect("connect");
        conn.skip_negotiation().await.expect("skip negotiation");

        let dead =
            run_dead_detection_sweep(std::slice::from_ref(&conn), crate::connection::now_ms())
                .await;
        assert_eq!(dead, 1);

        let dead_again = run_dead_detection_sweep(&[conn], crate::connection::now_ms()).await;
        assert_eq!(dead_again, 1);
    }
}
