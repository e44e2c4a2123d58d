// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A minimal client for the echo server demo: connects, skips
//! negotiation, sends one line of stdin at a time, and prints every echo.

use std::sync::Arc;

use netconn::{
    buffer::HeapBufferPool,
    cfg::{config::Config, logger::init_logger_stdout},
    connection::ConnState,
    lifecycle::connect,
    registry::ConnectionObserver,
};

struct PrintOnReceive;

impl ConnectionObserver for PrintOnReceive {
    fn packet_received<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        let text = String::from_utf8_lossy(payload).into_owned();
        Box::pin(async move {
            println!("echo: {text}");
            Ok(())
        })
    }

    fn state_changed(
        &self,
        new_state: ConnState,
    ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        tracing::info!(?new_state, "echo client connection state changed");
        Box::pin(async { Ok(()) })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logger_stdout("info")?;

    let conn = connect("127.0.0.1:9001", HeapBufferPool::shared(), &Config::default()).await?;
    conn.skip_negotiation().await?;
    let _handle = conn.register(Arc::new(PrintOnReceive));

    let stdin = std::io::stdin();
    let mut line = String::new();
    while stdin.read_line(&mut line)? > 0 {
        if conn.state() == ConnState::Dead {
            break;
        }
        conn.send(line.trim_end().as_bytes())?;
        line.clear();
    }

    conn.dispose_async().await;
    Ok(())
}
