// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The keep-alive collaborator contract.
//!
//! Scheduling a keep-alive send and deciding its cadence is external
//! policy, exercised through the connection's own `send`/`try_set_to_dead`
//! methods; this module only pins down how an inbound 0x02 datagram is
//! handed to that policy once the connection is established.

use std::pin::Pin;

/// The keep-alive policy collaborator.
pub trait KeepAliveHandler: Send + Sync {
    /// Feed an inbound 0x02 datagram to the handler. Returns whether the
    /// datagram was recognised as a valid keep-alive beat.
    fn process_keep_alive_packet<'a>(
        &'a self,
        span: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingHandler(AtomicUsize);

    impl KeepAliveHandler for CountingHandler {
        fn process_keep_alive_packet<'a>(
            &'a self,
            _span: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { true })
        }
    }

    #[tokio::test]
    async fn forwards_datagram_to_handler() {
        let handler = CountingHandler(AtomicUsize::new(0));
        assert!(handler.process_keep_alive_packet(&[0x02]).await);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }
}
