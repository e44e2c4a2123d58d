// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default MTU applied to a freshly constructed connection, per the
/// negotiation contract's fallback value.
pub const DEFAULT_MTU: u16 = 1400;

/// Reserved pre-buffer space every send path must leave ahead of the
/// payload for the data header.
pub const HEADER_LEN: usize = 8;

/// Cap on the async close path's outbound reset attempt.
const DEFAULT_RESET_SEND_TIMEOUT_MS: u64 = 2_000;

/// Tunables for a [`crate::connection::Connection`].
///
/// Everything here travels with the connection for its whole lifetime;
/// none of it is renegotiated except `mtu`, which the negotiator may
/// override on success.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Maximum datagram size the transport will accept.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// How long a peer may go without a "meaningful" negotiation/keep-alive
    /// signal before it is considered dead, in milliseconds. Consumed by
    /// [`crate::connection::Connection::check_dead_detection`] and, through
    /// it, [`crate::lifecycle::run_dead_detection_sweep`].
    #[serde(default = "default_dead_detection_threshold_ms")]
    pub dead_detection_threshold_ms: i64,

    /// Cap on the async close path's best-effort outbound reset send.
    #[serde(with = "serde_millis", default = "default_reset_send_timeout")]
    pub reset_send_timeout: Duration,

    /// Whether an early inbound negotiation datagram may be cached before
    /// `negotiate`/`skip_negotiation` is called.
    #[serde(default = "default_true")]
    pub negotiation_cache_enabled: bool,
}

impl Config {
    /// Load configuration from a YAML file on disk.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let cfg: Config = serde_yaml::from_str(&content).with_context(|| {
            format!("Failed to parse config file: {}", path.as_ref().display())
        })?;
        Ok(cfg)
    }

    /// MSS: the maximum payload per data packet given the current MTU.
    #[inline]
    pub fn mss(&self) -> u16 {
        self.mtu.saturating_sub(HEADER_LEN as u16)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            dead_detection_threshold_ms: default_dead_detection_threshold_ms(),
            reset_send_timeout: default_reset_send_timeout(),
            negotiation_cache_enabled: true,
        }
    }
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_dead_detection_threshold_ms() -> i64 {
    30_000
}

fn default_reset_send_timeout() -> Duration {
    Duration::from_millis(DEFAULT_RESET_SEND_TIMEOUT_MS)
}

fn default_true() -> bool {
    true
}

/// Serde helper for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
