// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Abstract rent/return of byte buffers.
//!
//! The core never allocates directly on the send/receive hot paths; it
//! rents a buffer from a [`BufferPool`], writes into it, and either hands
//! ownership to the transport or lets it drop back to the pool. Real
//! deployments plug in an arena-backed pool; [`HeapBufferPool`] is the
//! reference implementation used by this crate's demos and tests.

use std::sync::Arc;

use crate::error::{ConnectionError, Result};

/// An abstract allocator of rentable byte buffers.
///
/// Implementations may decline to grow and return
/// [`ConnectionError::TransportError`] when exhausted; callers drop the
/// datagram they were about to write in that case.
pub trait BufferPool: Send + Sync {
    /// Rent a buffer with at least `min_len` bytes of capacity.
    ///
    /// `pinned` hints that the buffer must not move for the lifetime of
    /// the rental (e.g. because it will be handed to a vectored I/O call);
    /// [`HeapBufferPool`] ignores the hint since `Vec<u8>` contents are
    /// always heap-stable once allocated.
    fn rent(&self, min_len: usize, pinned: bool) -> Result<OwnedBuffer>;
}

/// A rented buffer. Scoped: released back to its pool on drop.
pub struct OwnedBuffer {
    data: Vec<u8>,
}

impl OwnedBuffer {
    fn new(len: usize) -> Self {
        Self { data: vec![0u8; len] }
    }
}

impl std::ops::Deref for OwnedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for OwnedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedBuffer").field("len", &self.data.len()).finish()
    }
}

/// A plain heap-backed pool: every rent allocates, every drop frees.
///
/// Sufficient to exercise the framing codec, the negotiation cache, and
/// the demos in this crate; not a production allocator.
#[derive(Debug, Default, Clone)]
pub struct HeapBufferPool {
    max_len: Option<usize>,
}

impl HeapBufferPool {
    pub fn new() -> Self {
        Self { max_len: None }
    }

    /// A pool that declines to grow past `max_len`, for exercising the
    /// `AllocError` -> drop-the-datagram path in tests.
    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len: Some(max_len) }
    }

    pub fn shared() -> Arc<dyn BufferPool> {
        Arc::new(Self::new())
    }
}

impl BufferPool for HeapBufferPool {
    fn rent(&self, min_len: usize, _pinned: bool) -> Result<OwnedBuffer> {
        if let Some(max) = self.max_len
            && min_len > max
        {
            return Err(ConnectionError::TransportError(format!(
                "buffer pool exhausted: requested {min_len}, cap {max}"
            )));
        }
        Ok(OwnedBuffer::new(min_len))
    }
}
