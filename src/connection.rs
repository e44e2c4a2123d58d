// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection state machine: the central object of this crate.
//!
//! Owns current state, serials, liveness tick, and the transport,
//! negotiator, keep-alive and registry handles. Dispatches inbound
//! datagrams by type and current state, and exposes the send, teardown
//! and dead-detection operations.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, Ordering},
};

use once_cell::sync::Lazy;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    buffer::BufferPool,
    cfg::config::{Config, HEADER_LEN},
    error::{ConnectionError, Result},
    framing::{RESET_DATAGRAM, parse_data_header, write_data_header},
    keepalive::KeepAliveHandler,
    negotiation::{NegotiationCache, NegotiationOperation},
    registry::{CallbackRegistry, ConnectionObserver, Handle as RegistryHandle},
    transport::{ConnectionTransport, TransportExceptionHandler},
};

/// The connection's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    None,
    Connecting,
    Connected,
    Failed,
    Dead,
}

static CLOCK_EPOCH: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

/// The connection's monotonic tick, in milliseconds since an arbitrary
/// process-local epoch. Shared by liveness tracking and the
/// dead-detection sweep so both compare against the same clock.
pub fn now_ms() -> i64 {
    CLOCK_EPOCH.elapsed().as_millis() as i64
}

/// A scoped registration representing this connection's listing inside
/// an external demultiplexer. Dropping it (or calling
/// [`Connection::release_application_registration`]) ends the listing.
pub trait ApplicationRegistration: Send + Sync {}

struct RemoteStats {
    next_remote_serial: u32,
    packets_received: u32,
}

struct ExceptionProducer(Weak<Connection>);

impl TransportExceptionHandler for ExceptionProducer {
    fn on_exception(&self, error: &ConnectionError) {
        warn!(%error, "transport exception observed, closing connection");
        if let Some(conn) = self.0.upgrade() {
            tokio::spawn(async move { conn.set_transport_closed().await });
        }
    }
}

/// A connection-oriented session over an unreliable datagram transport.
pub struct Connection {
    transport: Arc<dyn ConnectionTransport>,
    pool: Arc<dyn BufferPool>,
    owns_transport: bool,
    reset_send_timeout: std::time::Duration,
    dead_detection_threshold_ms: i64,

    state: std::sync::Mutex<ConnState>,
    mtu: AtomicU16,
    next_local_serial: AtomicU32,
    remote_stats: std::sync::Mutex<RemoteStats>,
    last_active_tick: AtomicI64,

    transport_closed: AtomicBool,
    closing_started: AtomicBool,
    disposed: AtomicBool,
    reset_received: AtomicBool,

    negotiator: std::sync::Mutex<Option<Arc<dyn NegotiationOperation>>>,
    keep_alive: std::sync::Mutex<Option<Arc<dyn KeepAliveHandler>>>,
    negotiation_cache: NegotiationCache,

    registry: Arc<CallbackRegistry>,
    app_registration: AsyncMutex<Option<Arc<dyn ApplicationRegistration>>>,
}

impl Connection {
    /// Construct a connection over `transport`. When `owns_transport` is
    /// set, the connection installs itself as the transport's exception
    /// handler and disposes the transport when it is itself disposed.
    pub fn new(
        transport: Arc<dyn ConnectionTransport>,
        pool: Arc<dyn BufferPool>,
        config: &Config,
        owns_transport: bool,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            transport,
            pool: Arc::clone(&pool),
            owns_transport,
            reset_send_timeout: config.reset_send_timeout,
            dead_detection_threshold_ms: config.dead_detection_threshold_ms,
            state: std::sync::Mutex::new(ConnState::None),
            mtu: AtomicU16::new(config.mtu),
            next_local_serial: AtomicU32::new(0),
            remote_stats: std::sync::Mutex::new(RemoteStats {
                next_remote_serial: 0,
                packets_received: 0,
            }),
            last_active_tick: AtomicI64::new(now_ms()),
            transport_closed: AtomicBool::new(false),
            closing_started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            reset_received: AtomicBool::new(false),
            negotiator: std::sync::Mutex::new(None),
            keep_alive: std::sync::Mutex::new(None),
            negotiation_cache: NegotiationCache::new(pool, config.negotiation_cache_enabled),
            registry: CallbackRegistry::new(),
            app_registration: AsyncMutex::new(None),
        });

        if owns_transport {
            let producer = Arc::new(ExceptionProducer(Arc::downgrade(&conn)));
            conn.transport.set_exception_handler(producer);
        }
        conn
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    pub fn mss(&self) -> u16 {
        self.mtu() - HEADER_LEN as u16
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Relaxed)
    }

    pub fn reset_received(&self) -> bool {
        self.reset_received.load(Ordering::Relaxed)
    }

    /// Acquire the state lock; fail unless `current == expected`. On
    /// success, set `new` and notify subscribers once the lock is
    /// released.
    async fn check_and_change(&self, expected: ConnState, new: ConnState) -> Result<()> {
        let changed = {
            let mut state = self.state.lock().expect("state lock poisoned");
            if *state != expected {
                return Err(ConnectionError::InvalidState("state does not match expected"));
            }
            let changed = *state != new;
            *state = new;
            changed
        };
        if changed {
            self.registry.notify_state_changed(new).await;
        }
        Ok(())
    }

    /// Acquire the state lock; set `new` unconditionally unless already
    /// `new`. Notify subscribers after releasing the lock.
    async fn change_to(&self, new: ConnState) {
        let changed = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let changed = *state != new;
            *state = new;
            changed
        };
        if changed {
            self.registry.notify_state_changed(new).await;
        }
    }

    /// Register a subscriber for delivered payloads and state changes.
    pub fn register(self: &Arc<Self>, observer: Arc<dyn ConnectionObserver>) -> RegistryHandle {
        self.registry.register(observer)
    }

    /// Install the connection's listing in an external demultiplexer.
    pub async fn set_application_registration(&self, reg: Arc<dyn ApplicationRegistration>) {
        *self.app_registration.lock().await = Some(reg);
    }

    async fn release_application_registration(&self) {
        *self.app_registration.lock().await = None;
    }

    /// Begin the `None -> Connecting` handshake, attach `negotiator`, and
    /// drive it to completion. Returns whether negotiation succeeded.
    pub async fn negotiate(
        self: &Arc<Self>,
        negotiator: Arc<dyn NegotiationOperation>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.check_and_change(ConnState::None, ConnState::Connecting).await?;
        *self.negotiator.lock().expect("negotiator lock poisoned") =
            Some(Arc::clone(&negotiator));

        let cached = self.negotiation_cache.take_for_negotiator().await;
        let outcome = negotiator.negotiate_async(cached, cancel).await;
        self.apply_negotiation_result(outcome).await;
        Ok(outcome.success)
    }

    async fn apply_negotiation_result(
        &self,
        outcome: crate::negotiation::NegotiationOutcome,
    ) {
        self.negotiator.lock().expect("negotiator lock poisoned").take();
        self.negotiation_cache.disable_and_release().await;

        if self.state() != ConnState::Connecting {
            return;
        }
        if let Some(mtu) = outcome.negotiated_mtu {
            self.mtu.store(mtu, Ordering::Relaxed);
        }
        if outcome.success {
            self.last_active_tick.store(now_ms(), Ordering::Relaxed);
            self.change_to(ConnState::Connected).await;
        } else {
            self.change_to(ConnState::Failed).await;
            self.release_application_registration().await;
        }
    }

    /// Bypass negotiation entirely and move straight to `Connected`.
    pub async fn skip_negotiation(&self) -> Result<()> {
        self.check_and_change(ConnState::None, ConnState::Connecting).await?;
        self.negotiation_cache.disable_and_release().await;
        self.last_active_tick.store(now_ms(), Ordering::Relaxed);
        self.change_to(ConnState::Connected).await;
        Ok(())
    }

    /// Attach the keep-alive collaborator. Requires `Connected` and no
    /// prior handler.
    pub fn setup_keep_alive(&self, handler: Arc<dyn KeepAliveHandler>) -> Result<()> {
        if self.state() != ConnState::Connected {
            return Err(ConnectionError::InvalidState("setup_keep_alive requires Connected"));
        }
        let mut guard = self.keep_alive.lock().expect("keep-alive lock poisoned");
        if guard.is_some() {
            return Err(ConnectionError::InvalidState("keep-alive handler already set"));
        }
        *guard = Some(handler);
        Ok(())
    }

    /// Dispatch an inbound datagram by type and current state.
    pub async fn input_packet(&self, datagram: &[u8]) {
        if datagram.is_empty() {
            return;
        }
        if datagram[0] == 0xFF {
            self.handle_reset().await;
            return;
        }
        if self.disposed.load(Ordering::Relaxed) || self.transport_closed.load(Ordering::Relaxed) {
            return;
        }
        if datagram.len() < 4 {
            return;
        }

        let mut remote_serial = None;
        let mut payload_range = None;

        match self.state() {
            ConnState::None => {
                self.negotiation_cache.offer(datagram).await;
            },
            ConnState::Connecting => {
                let negotiator =
                    self.negotiator.lock().expect("negotiator lock poisoned").clone();
                if let Some(negotiator) = negotiator {
                    let meaningful = if datagram[0] == 0x01 {
                        negotiator.input_packet(datagram).await
                    } else {
                        negotiator.notify_remote_progressing().await
                    };
                    if meaningful {
                        self.last_active_tick.store(now_ms(), Ordering::Relaxed);
                    }
                }
            },
            ConnState::Connected => {
                if datagram[0] == 0x02 {
                    let handler =
                        self.keep_alive.lock().expect("keep-alive lock poisoned").clone();
                    if let Some(handler) = handler
                        && handler.process_keep_alive_packet(datagram).await
                    {
                        self.last_active_tick.store(now_ms(), Ordering::Relaxed);
                    }
                } else if datagram[0] == 0x03
                    && let Some(header) = parse_data_header(datagram)
                {
                    remote_serial = Some(header.serial);
                    payload_range = Some((header.payload_start, header.payload_end));
                }
            },
            ConnState::Failed | ConnState::Dead => {},
        }

        if let Some(serial) = remote_serial {
            let mut stats = self.remote_stats.lock().expect("remote stats lock poisoned");
            if serial >= stats.next_remote_serial {
                stats.next_remote_serial = serial.wrapping_add(1);
            }
            stats.packets_received = stats.packets_received.wrapping_add(1);
        }

        if let Some((start, end)) = payload_range {
            self.registry.packet_received(&datagram[start..end]).await;
        }
    }

    /// Snapshot and reset the remote-direction counters.
    pub fn gather_packet_statistics(&self) -> (u32, u32) {
        let mut stats = self.remote_stats.lock().expect("remote stats lock poisoned");
        let packets = stats.packets_received;
        stats.packets_received = 0;
        (stats.next_remote_serial, packets)
    }

    fn rent_and_frame(&self, payload: &[u8]) -> Result<crate::buffer::OwnedBuffer> {
        let mut buf = self.pool.rent(HEADER_LEN + payload.len(), false)?;
        let serial = self.next_local_serial.fetch_add(1, Ordering::SeqCst);
        write_data_header(&mut buf, serial, payload.len())?;
        buf[HEADER_LEN..].copy_from_slice(payload);
        Ok(buf)
    }

    /// Frame `payload` and attempt a non-blocking send. No state check:
    /// a send after close only fails if the transport rejects it.
    pub fn send(&self, payload: &[u8]) -> Result<bool> {
        let buf = self.rent_and_frame(payload)?;
        Ok(self.transport.queue_packet(&[&buf]))
    }

    /// Frame `payload` and send, waiting for transport readiness.
    pub async fn send_async(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }
        let buf = self.rent_and_frame(payload)?;
        self.transport.queue_and_send(&[&buf], cancel).await
    }

    /// Frame a datagram in place over a caller-supplied buffer that
    /// already holds the payload starting at byte 8.
    pub fn send_with_pre_buffer(&self, buf: &mut [u8]) -> Result<bool> {
        if buf.len() < HEADER_LEN {
            return Err(ConnectionError::ArgumentError { need: HEADER_LEN, got: buf.len() });
        }
        let serial = self.next_local_serial.fetch_add(1, Ordering::SeqCst);
        write_data_header(buf, serial, buf.len() - HEADER_LEN)?;
        Ok(self.transport.queue_packet(&[buf]))
    }

    async fn handle_reset(&self) {
        self.reset_received.store(true, Ordering::Relaxed);
        self.set_transport_closed().await;
    }

    /// The configured dead-detection window, in milliseconds.
    pub fn dead_detection_threshold_ms(&self) -> i64 {
        self.dead_detection_threshold_ms
    }

    /// Apply [`Connection::dead_detection_threshold_ms`] against `now`
    /// and call [`Connection::try_set_to_dead`]. The per-connection
    /// counterpart of [`crate::lifecycle::run_dead_detection_sweep`].
    pub async fn check_dead_detection(&self, now: i64) -> bool {
        self.try_set_to_dead(now - self.dead_detection_threshold_ms).await
    }

    /// Mark `threshold_tick` as the dead-detection deadline. Returns
    /// `true` if the connection is (now, or already) effectively dead.
    pub async fn try_set_to_dead(&self, threshold_tick: i64) -> bool {
        match self.state() {
            ConnState::Connected => {
                let last = self.last_active_tick.load(Ordering::Relaxed);
                if threshold_tick > last {
                    self.change_to(ConnState::Dead).await;
                    self.release_application_registration().await;
                    true
                } else {
                    false
                }
            },
            ConnState::Failed | ConnState::Dead => true,
            ConnState::None | ConnState::Connecting => false,
        }
    }

    /// Idempotent synchronous close: marks the transport closed,
    /// transitions to `Dead`, and releases negotiation/keep-alive state.
    pub async fn set_transport_closed(&self) {
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.change_to(ConnState::Dead).await;
        self.negotiation_cache.disable_and_release().await;
        if let Some(negotiator) = self.negotiator.lock().expect("negotiator lock poisoned").take()
        {
            negotiator.notify_disposed();
        }
        self.keep_alive.lock().expect("keep-alive lock poisoned").take();
    }

    /// Idempotent asynchronous close: attempts a single capped reset
    /// send (unless a reset was already received), then performs the
    /// same cleanup as [`Connection::set_transport_closed`].
    pub async fn set_transport_closed_async(&self) {
        if !self.closing_started.swap(true, Ordering::AcqRel) && !self.reset_received.load(Ordering::Relaxed) {
            let cancel = CancellationToken::new();
            let _ = tokio::time::timeout(
                self.reset_send_timeout,
                self.transport.queue_and_send(&[&RESET_DATAGRAM], &cancel),
            )
            .await;
        }
        self.set_transport_closed().await;
    }

    /// Idempotent disposal: closes synchronously, then releases the
    /// owned transport (if any), the application registration, and
    /// every registered subscriber.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_transport_closed().await;
        self.finish_dispose().await;
    }

    /// Idempotent disposal via the asynchronous close path.
    pub async fn dispose_async(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_transport_closed_async().await;
        self.finish_dispose().await;
    }

    async fn finish_dispose(&self) {
        if self.owns_transport {
            self.transport.dispose();
        }
        self.release_application_registration().await;
        self.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{buffer::HeapBufferPool, framing::parse_data_header};

    struct NullTransport {
        sent: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    impl NullTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: std::sync::Mutex::new(Vec::new()) })
        }
    }

    impl ConnectionTransport for NullTransport {
        fn set_exception_handler(
            &self,
            _handler: Arc<dyn crate::transport::TransportExceptionHandler>,
        ) {
        }

        fn remote_endpoint(&self) -> std::net::SocketAddr {
            ([127, 0, 0, 1], 0).into()
        }

        fn queue_packet(&self, buffers: &[&[u8]]) -> bool {
            let mut out = Vec::new();
            for b in buffers {
                out.extend_from_slice(b);
            }
            self.sent.lock().expect("sent lock poisoned").push(out);
            true
        }

        fn queue_and_send<'a>(
            &'a self,
            buffers: &'a [&'a [u8]],
            _cancel: &'a CancellationToken,
        ) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            self.queue_packet(buffers);
            Box::pin(async { Ok(()) })
        }

        fn recv<'a>(
            &'a self,
            _buf: &'a mut [u8],
        ) -> std::pin::Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
            Box::pin(async { Ok(0) })
        }
    }

    struct ImmediateNegotiator {
        success: bool,
        mtu: Option<u16>,
        recorded_cached: std::sync::Mutex<Option<Vec<u8>>>,
    }

    impl NegotiationOperation for ImmediateNegotiator {
        fn input_packet<'a>(
            &'a self,
            _span: &'a [u8],
        ) -> std::pin::Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
            Box::pin(async { true })
        }

        fn notify_remote_progressing(
            &self,
        ) -> std::pin::Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            Box::pin(async { true })
        }

        fn negotiate_async<'a>(
            &'a self,
            cached_packet: Option<Vec<u8>>,
            _cancel: &'a CancellationToken,
        ) -> std::pin::Pin<
            Box<dyn Future<Output = crate::negotiation::NegotiationOutcome> + Send + 'a>,
        > {
            *self.recorded_cached.lock().expect("lock poisoned") = cached_packet;
            Box::pin(async move {
                crate::negotiation::NegotiationOutcome {
                    success: self.success,
                    negotiated_mtu: self.mtu,
                }
            })
        }

        fn notify_disposed(&self) {}
    }

    fn test_config() -> Config {
        Config::default()
    }

    #[tokio::test]
    async fn s1_pre_negotiation_cache_is_observed_by_negotiator() {
        let transport = NullTransport::new();
        let conn = Connection::new(transport, HeapBufferPool::shared(), &test_config(), false);

        conn.input_packet(&[0x01, 0xAA, 0xBB, 0xCC]).await;
        assert_eq!(conn.state(), ConnState::None);

        let negotiator = Arc::new(ImmediateNegotiator {
            success: true,
            mtu: None,
            recorded_cached: std::sync::Mutex::new(None),
        });
        let cancel = CancellationToken::new();
        conn.negotiate(negotiator.clone(), &cancel).await.expect("negotiate");

        assert_eq!(
            negotiator.recorded_cached.lock().expect("lock poisoned").as_deref(),
            Some([0x01, 0xAA, 0xBB, 0xCC].as_slice())
        );
    }

    #[tokio::test]
    async fn s2_negotiation_success_transitions_and_applies_mtu() {
        let transport = NullTransport::new();
        let conn = Connection::new(transport, HeapBufferPool::shared(), &test_config(), false);

        let states = Arc::new(std::sync::Mutex::new(Vec::new()));
        struct Recorder(Arc<std::sync::Mutex<Vec<ConnState>>>);
        impl ConnectionObserver for Recorder {
            fn packet_received<'a>(
                &'a self,
                _payload: &'a [u8],
            ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
                Box::pin(async { Ok(()) })
            }

            fn state_changed(
                &self,
                new_state: ConnState,
            ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
                self.0.lock().expect("lock poisoned").push(new_state);
                Box::pin(async { Ok(()) })
            }
        }
        let _handle = conn.register(Arc::new(Recorder(states.clone())));

        let negotiator = Arc::new(ImmediateNegotiator {
            success: true,
            mtu: Some(1200),
            recorded_cached: std::sync::Mutex::new(None),
        });
        let cancel = CancellationToken::new();
        let ok = conn.negotiate(negotiator, &cancel).await.expect("negotiate");

        assert!(ok);
        assert_eq!(conn.state(), ConnState::Connected);
        assert_eq!(conn.mtu(), 1200);
        assert_eq!(conn.mss(), 1192);
        assert_eq!(*states.lock().expect("lock poisoned"), vec![
            ConnState::Connecting,
            ConnState::Connected
        ]);
    }

    async fn connected(transport: Arc<NullTransport>) -> Arc<Connection> {
        let conn = Connection::new(transport, HeapBufferPool::shared(), &test_config(), false);
        conn.skip_negotiation().await.expect("skip negotiation");
        conn
    }

    #[tokio::test]
    async fn s3_data_path_delivers_payload_and_updates_remote_serial() {
        let transport = NullTransport::new();
        let conn = connected(transport).await;

        let received = Arc::new(AtomicUsize::new(0));
        struct Counter(Arc<AtomicUsize>);
        impl ConnectionObserver for Counter {
            fn packet_received<'a>(
                &'a self,
                payload: &'a [u8],
            ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
                assert_eq!(payload, &[0xDE, 0xAD, 0xBE]);
                self.0.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            }

            fn state_changed(
                &self,
                _new_state: ConnState,
            ) -> std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
                Box::pin(async { Ok(()) })
            }
        }
        let _handle = conn.register(Arc::new(Counter(received.clone())));

        conn.input_packet(&[0x03, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0xDE, 0xAD, 0xBE])
            .await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(conn.gather_packet_statistics(), (6, 1));
    }

    #[tokio::test]
    async fn s4_reset_received_closes_without_outbound_reset() {
        let transport = NullTransport::new();
        let conn = connected(transport.clone()).await;

        conn.input_packet(&[0xFF]).await;
        assert_eq!(conn.state(), ConnState::Dead);

        conn.set_transport_closed_async().await;
        assert!(transport.sent.lock().expect("lock poisoned").is_empty());
    }

    #[tokio::test]
    async fn s5_dead_detection_transitions_past_threshold() {
        let transport = NullTransport::new();
        let conn = connected(transport).await;
        conn.last_active_tick.store(now_ms() - 10_000, Ordering::Relaxed);

        let dead = conn.try_set_to_dead(now_ms() + 1).await;
        assert!(dead);
        assert_eq!(conn.state(), ConnState::Dead);
    }

    #[tokio::test]
    async fn check_dead_detection_uses_configured_threshold() {
        let transport = NullTransport::new();
        let config = Config { dead_detection_threshold_ms: 5_000, ..Config::default() };
        let conn = Connection::new(transport, HeapBufferPool::shared(), &config, false);
        conn.skip_negotiation().await.expect("skip negotiation");

        assert!(
            !conn.check_dead_detection(now_ms()).await,
            "fresh connection is within the window"
        );

        conn.last_active_tick.store(now_ms() - 10_000, Ordering::Relaxed);
        assert!(conn.check_dead_detection(now_ms()).await, "idle past the configured window");
        assert_eq!(conn.state(), ConnState::Dead);
    }

    #[tokio::test]
    async fn s6_send_framing_uses_and_advances_local_serial() {
        let transport = NullTransport::new();
        let conn = connected(transport.clone()).await;
        conn.next_local_serial.store(42, Ordering::SeqCst);

        let queued = conn.send(&[0x11, 0x22]).expect("send");
        assert!(queued);

        let sent = transport.sent.lock().expect("lock poisoned");
        let datagram = &sent[0];
        assert_eq!(datagram, &[0x03, 0x00, 0x00, 0x06, 0x00, 0x00, 0x00, 0x2A, 0x11, 0x22]);
        assert_eq!(
            conn.next_local_serial.load(Ordering::SeqCst),
            43
        );
        let header = parse_data_header(datagram).expect("parse header");
        assert_eq!(header.serial, 42);
    }

    #[tokio::test]
    async fn invalid_negotiate_outside_none_state_is_rejected() {
        let transport = NullTransport::new();
        let conn = connected(transport).await;
        let negotiator = Arc::new(ImmediateNegotiator {
            success: true,
            mtu: None,
            recorded_cached: std::sync::Mutex::new(None),
        });
        let cancel = CancellationToken::new();
        let result = conn.negotiate(negotiator, &cancel).await;
        assert!(matches!(result, Err(ConnectionError::InvalidState(_))));
    }

    #[tokio::test]
    async fn send_with_pre_buffer_rejects_short_buffer() {
        let transport = NullTransport::new();
        let conn = connected(transport).await;
        let mut buf = [0u8; 4];
        assert!(matches!(
            conn.send_with_pre_buffer(&mut buf),
            Err(ConnectionError::ArgumentError { .. })
        ));
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_clears_registry() {
        let transport = NullTransport::new();
        let conn = connected(transport).await;
        conn.dispose().await;
        conn.dispose().await;
        assert_eq!(conn.state(), ConnState::Dead);
        assert!(conn.is_disposed());
    }
}
