// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A connection-oriented session layer over an unreliable datagram
//! transport: negotiation, keep-alive, reliable-order-irrelevant data
//! carriage, remote liveness tracking, and an explicit reset signal.

/// Configuration and logging.
pub mod cfg;

/// Abstract rent/return of byte buffers.
pub mod buffer;
/// The central connection state machine.
pub mod connection;
/// Errors surfaced by the connection's public API.
pub mod error;
/// Datagram type dispatch and the 8-byte data header.
pub mod framing;
/// Keep-alive collaborator contract.
pub mod keepalive;
/// Connection construction and the dead-detection sweep.
pub mod lifecycle;
/// The negotiation packet cache and negotiator collaborator contract.
pub mod negotiation;
/// The callback fan-out registry.
pub mod registry;
/// The datagram transport façade.
pub mod transport;
