// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Errors surfaced by the core connection layer's public API.
///
/// Transport faults never unwind through here: they are routed to the
/// caller-installed exception handler (see
/// [`crate::transport::ConnectionTransport::set_exception_handler`]) and
/// only turn into a `TransportError` when that handler forwards them.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Operation not valid in the connection's current state.
    #[error("invalid state for this operation: {0}")]
    InvalidState(&'static str),

    /// Operation attempted on a connection that has already been disposed.
    #[error("connection is disposed")]
    ObjectDisposed,

    /// `send_with_pre_buffer` was given fewer than 8 bytes of pre-space.
    #[error("buffer has insufficient pre-space: need {need}, got {got}")]
    ArgumentError { need: usize, got: usize },

    /// The operation's cancellation token fired before completion.
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying transport reported a fault.
    #[error("transport error: {0}")]
    TransportError(String),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
