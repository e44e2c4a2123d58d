// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The negotiation packet cache and the negotiator collaborator contract.
//!
//! An inbound negotiation datagram may arrive in the window between
//! transport start and the user calling `negotiate`. [`NegotiationCache`]
//! holds exactly one such datagram and hands it to the negotiator on
//! attach. The negotiation policy itself — what bytes to exchange, how
//! many round trips, how to pick an MTU — is an external collaborator
//! behind [`NegotiationOperation`]; this module only pins down the wire
//! contract and the cache race.

use std::pin::Pin;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferPool;

/// Outcome of a completed negotiation handshake.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationOutcome {
    pub success: bool,
    /// An MTU the negotiator agreed on with the peer, if any; replaces
    /// the connection's `mtu` on success.
    pub negotiated_mtu: Option<u16>,
}

/// The negotiation policy collaborator.
///
/// Wire format and semantics of the 0x01-typed bytes this trait's
/// methods exchange are not specified here: they belong to whatever
/// handshake protocol the negotiator implements.
pub trait NegotiationOperation: Send + Sync {
    /// Feed an inbound 0x01 datagram to the negotiator while in
    /// `Connecting`. Returns whether this advanced the handshake.
    fn input_packet<'a>(
        &'a self,
        span: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// Notify the negotiator that a non-negotiation datagram arrived
    /// while `Connecting`, as proof the remote end is alive. Returns
    /// whether this counts as meaningful activity.
    fn notify_remote_progressing(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;

    /// Drive the handshake to completion, given any cached early packet.
    fn negotiate_async<'a>(
        &'a self,
        cached_packet: Option<Vec<u8>>,
        cancel: &'a CancellationToken,
    ) -> Pin<Box<dyn Future<Output = NegotiationOutcome> + Send + 'a>>;

    /// The connection was disposed; release any resources.
    fn notify_disposed(&self);
}

/// Holds at most one early inbound datagram received before the user
/// attaches a negotiator.
pub struct NegotiationCache {
    pool: std::sync::Arc<dyn BufferPool>,
    state: Mutex<CacheState>,
}

struct CacheState {
    buffer: Option<Vec<u8>>,
    disabled: bool,
}

impl NegotiationCache {
    pub fn new(pool: std::sync::Arc<dyn BufferPool>, enabled: bool) -> Self {
        Self {
            pool,
            state: Mutex::new(CacheState { buffer: None, disabled: !enabled }),
        }
    }

    /// Offer an inbound datagram while `state == None`. Populates the
    /// cache slot only if caching is enabled and it is currently empty;
    /// later arrivals while still `None` are dropped, not replaced.
    pub async fn offer(&self, datagram: &[u8]) {
        let mut state = self.state.lock().await;
        if state.disabled || state.buffer.is_some() {
            return;
        }
        match self.pool.rent(datagram.len(), false) {
            Ok(mut rented) => {
                rented.copy_from_slice(datagram);
                state.buffer = Some(rented.to_vec());
            },
            Err(_) => {
                tracing::warn!("negotiation cache: buffer pool exhausted, dropping datagram");
            },
        }
    }

    /// Disable caching and extract the cached datagram, if any, handing
    /// it to the negotiator on attach.
    pub async fn take_for_negotiator(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().await;
        state.disabled = true;
        state.buffer.take()
    }

    /// Disable caching and discard any cached datagram (skip-negotiation
    /// path, negotiator completion, or transport close).
    pub async fn disable_and_release(&self) {
        let mut state = self.state.lock().await;
        state.disabled = true;
        state.buffer = None;
    }

    pub async fn is_disabled(&self) -> bool {
        self.state.lock().await.disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HeapBufferPool;

    #[tokio::test]
    async fn first_datagram_is_cached_subsequent_are_dropped() {
        let cache = NegotiationCache::new(HeapBufferPool::shared(), true);
        cache.offer(&[0x01, 0xAA, 0xBB, 0xCC]).await;
        cache.offer(&[0x01, 0xFF, 0xFF, 0xFF]).await;

        let taken = cache.take_for_negotiator().await;
        assert_eq!(taken, Some(vec![0x01, 0xAA, 0xBB, 0xCC]));
    }

    #[tokio::test]
    async fn skip_negotiation_discards_cached_packet() {
        let cache = NegotiationCache::new(HeapBufferPool::shared(), true);
        cache.offer(&[0x01, 0xAA, 0xBB, 0xCC]).await;
        cache.disable_and_release().await;
        assert!(cache.is_disabled().await);

        cache.offer(&[0x01, 0x00]).await;
        assert_eq!(cache.take_for_negotiator().await, None);
    }

    #[tokio::test]
    async fn disabled_cache_never_populates() {
        let cache = NegotiationCache::new(HeapBufferPool::shared(), false);
        cache.offer(&[0x01, 0xAA]).await;
        assert_eq!(cache.take_for_negotiator().await, None);
    }
}
