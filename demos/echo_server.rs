// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A minimal echo server built on [`netconn`]: accepts one connection,
//! skips negotiation, and echoes every delivered payload back.

use std::sync::Arc;

use netconn::{
    buffer::HeapBufferPool,
    cfg::{config::Config, logger::init_logger_stdout},
    connection::{ConnState, Connection},
    registry::ConnectionObserver,
    transport::{ConnectionTransport, EndpointTransport},
};
use tokio::net::UdpSocket;

struct Echo(Arc<Connection>);

impl ConnectionObserver for Echo {
    fn packet_received<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.0.send(payload)?;
            Ok(())
        })
    }

    fn state_changed(
        &self,
        new_state: ConnState,
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        tracing::info!(?new_state, "echo server connection state changed");
        Box::pin(async { Ok(()) })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logger_stdout("info")?;

    let socket = UdpSocket::bind("127.0.0.1:9001").await?;
    tracing::info!(addr = %socket.local_addr()?, "echo server listening");

    let mut buf = vec![0u8; 2048];
    let (n, peer) = socket.peek_from(&mut buf).await?;
    let _ = n;
    socket.connect(peer).await?;

    let transport = Arc::new(EndpointTransport::new(Arc::new(socket)));
    transport.wait_writable().await?;
    let conn = Connection::new(transport.clone(), HeapBufferPool::shared(), &Config::default(), false);
    conn.skip_negotiation().await?;

    let _handle = conn.register(Arc::new(Echo(conn.clone())));

    loop {
        let n = transport.recv(&mut buf).await?;
        if n == 0 {
            continue;
        }
        conn.input_packet(&buf[..n]).await;
        if conn.state() == ConnState::Dead {
            break;
        }
    }

    conn.dispose_async().await;
    Ok(())
}
