// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The callback fan-out registry.
//!
//! An intrusive singly-linked list of subscriber records. `register`
//! appends to the tail; dropping a [`Handle`] unlinks its node by walking
//! from the head (O(n) in list length). Writes are serialised under the
//! registry lock, which is released before any subscriber is invoked.

use std::{
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::warn;

use crate::connection::ConnState;

/// A subscriber to a connection's delivered payloads and state changes.
///
/// Both methods may suspend. An `Err` return is logged and swallowed by
/// the registry: one misbehaving subscriber never stops its siblings
/// from being notified.
pub trait ConnectionObserver: Send + Sync {
    fn packet_received<'a>(
        &'a self,
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

    fn state_changed(
        &self,
        new_state: ConnState,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

struct Node {
    id: u64,
    observer: Arc<dyn ConnectionObserver>,
    next: Option<Box<Node>>,
}

/// The application registration: an intrusive, concurrently-mutable list
/// of [`ConnectionObserver`]s.
pub struct CallbackRegistry {
    head: Mutex<Option<Box<Node>>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { head: Mutex::new(None), next_id: AtomicU64::new(0) })
    }

    /// Append `observer` to the tail of the list, returning a scoped
    /// handle. Dropping the handle unregisters the observer.
    pub fn register(self: &Arc<Self>, observer: Arc<dyn ConnectionObserver>) -> Handle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut node = Some(Box::new(Node { id, observer, next: None }));

        let mut head = self.head.lock().expect("registry lock poisoned");
        match head.as_mut() {
            None => *head = node.take(),
            Some(first) => {
                let mut cur = first;
                while cur.next.is_some() {
                    cur = cur.next.as_mut().expect("checked is_some above");
                }
                cur.next = node.take();
            },
        }
        drop(head);

        Handle { registry: Arc::clone(self), id }
    }

    /// Drop every subscriber at once (connection disposal).
    pub fn clear(&self) {
        *self.head.lock().expect("registry lock poisoned") = None;
    }

    fn unlink(&self, id: u64) {
        let mut head = self.head.lock().expect("registry lock poisoned");
        if matches!(head.as_deref(), Some(n) if n.id == id) {
            let mut removed = head.take().expect("checked Some above");
            *head = removed.next.take();
            return;
        }
        let mut cur = head.as_mut();
        while let Some(node) = cur {
            if matches!(node.next.as_deref(), Some(n) if n.id == id) {
                let mut removed = node.next.take().expect("checked Some above");
                node.next = removed.next.take();
                return;
            }
            cur = node.next.as_mut();
        }
    }

    /// Snapshot the current subscribers in list order.
    ///
    /// The snapshot is taken once at the start of a delivery pass; a
    /// subscriber registered mid-pass simply receives the next delivery
    /// instead. A subscriber that drops its own handle during delivery
    /// still runs to completion, since the snapshot holds its own
    /// `Arc` independent of the list link.
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        let head = self.head.lock().expect("registry lock poisoned");
        let mut out = Vec::new();
        let mut cur = head.as_deref();
        while let Some(node) = cur {
            out.push(Arc::clone(&node.observer));
            cur = node.next.as_deref();
        }
        out
    }

    /// Deliver a data payload to every current subscriber, in order.
    pub async fn packet_received(&self, payload: &[u8]) {
        for observer in self.snapshot() {
            if let Err(e) = observer.packet_received(payload).await {
                warn!(error = %e, "subscriber packet_received failed, ignoring");
            }
        }
    }

    /// Notify every current subscriber of a state transition, in order.
    pub async fn notify_state_changed(&self, new_state: ConnState) {
        for observer in self.snapshot() {
            if let Err(e) = observer.state_changed(new_state).await {
                warn!(error = %e, "subscriber state_changed failed, ignoring");
            }
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry").finish_non_exhaustive()
    }
}

/// A scoped registration. Dropping it unregisters the observer.
pub struct Handle {
    registry: Arc<CallbackRegistry>,
    id: u64,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.registry.unlink(self.id);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}
