// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Gateway global configuration - single source of truth.
//!
//! This module centralizes ALL wire constants and timing parameters.
//! **NEVER hardcode these elsewhere!**
//!
//! Two levels:
//!
//! - **Static**: compile-time constants (ports, frame sizes, protocol timing)
//! - **Dynamic**: [`GatewayConfig`] built by the daemon from CLI arguments

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

// =======================================================================
// Well-known UDP ports
// =======================================================================

/// UDP port the CCU link protocol listens on (virtual serial port).
pub const CCU_LINK_PORT: u16 = 3008;

/// UDP port for sibling gateway (fleet) traffic.
pub const PROXY_PORT: u16 = 3009;

// =======================================================================
// Frame geometry
// =======================================================================

/// Maximum decoded frame payload in bytes (excluding the 2-byte checksum).
pub const MAX_PAYLOAD: usize = 1020;

/// Deframer accumulation buffer capacity.
///
/// Covers start byte + 2 length bytes + `MAX_PAYLOAD` + 2 checksum bytes,
/// rounded to a power of two. The deframer force-completes rather than
/// ever writing past this bound.
pub const FRAME_BUF_SIZE: usize = 2048;

/// Assumed MTU of the local network.
pub const LINK_MTU: usize = 1500;

/// Largest frame image relayed to the CCU in a single datagram.
///
/// MTU minus IP (20) and UDP (8) headers minus CCU message overhead
/// (type + sequence + 2-byte checksum). Oversized frames are dropped,
/// never fragmented.
pub const MAX_RELAY_PAYLOAD: usize = LINK_MTU - 28 - 4;

// =======================================================================
// Protocol timing
// =======================================================================

/// Outbound keepalive period while a CCU is connected.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(1000);

/// Inbound silence after which the CCU connection is force-closed.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_millis(2500);

/// Decision deadline for best-signal arbitration of duplicate frames.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(40);

/// Upper bound on the lifetime of any dedup bookkeeping entry.
pub const DEDUP_RETENTION: Duration = Duration::from_millis(200);

/// Socket read timeout; also the cadence of periodic liveness checks.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

// =======================================================================
// Queueing
// =======================================================================

/// Outbound serial queue bound. Newest entry is dropped when full
/// (stale retries are worse than a dropped frame on this path).
pub const SERIAL_TX_QUEUE_DEPTH: usize = 32;

/// Serial read chunk size handed to the deframer per iteration.
pub const SERIAL_RX_CHUNK: usize = 256;

/// Replication role of this gateway within a fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// Single gateway, proxy inert, frames go straight to the CCU link.
    #[default]
    Standalone,
    /// Forward every local frame to the configured master; no dedup state.
    Slave,
    /// Deduplicate frames from all siblings and serve the CCU.
    Master,
}

impl std::fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standalone => write!(f, "standalone"),
            Self::Slave => write!(f, "slave"),
            Self::Master => write!(f, "master"),
        }
    }
}

/// Runtime configuration assembled by the daemon.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// UDP port for the CCU link (0 = ephemeral, used by tests).
    pub ccu_port: u16,
    /// UDP port for sibling traffic (0 = ephemeral, used by tests).
    pub proxy_port: u16,
    /// Replication role.
    pub mode: ProxyMode,
    /// Master address a slave forwards to. Required in slave mode.
    pub master_addr: Option<SocketAddr>,
    /// IP this gateway is reachable at by its siblings. `None` = use
    /// the primary interface address. Needed on multi-homed hosts so
    /// "routed via local radio" detection matches what siblings see.
    pub advertised_ip: Option<Ipv4Addr>,
    /// Inbound silence before the CCU connection is dropped.
    pub connection_timeout: Duration,
    /// Outbound keepalive period.
    pub keepalive_interval: Duration,
    /// Dedup decision window.
    pub dedup_window: Duration,
    /// Dedup entry retention bound.
    pub dedup_retention: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ccu_port: CCU_LINK_PORT,
            proxy_port: PROXY_PORT,
            mode: ProxyMode::Standalone,
            master_addr: None,
            advertised_ip: None,
            connection_timeout: CONNECTION_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            dedup_window: DEDUP_WINDOW,
            dedup_retention: DEDUP_RETENTION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_payload_fits_mtu() {
        // frame image + message overhead must fit one datagram
        assert!(MAX_RELAY_PAYLOAD + 4 + 28 <= LINK_MTU);
        assert!(MAX_RELAY_PAYLOAD >= MAX_PAYLOAD + 5);
    }

    #[test]
    fn test_default_config() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.ccu_port, CCU_LINK_PORT);
        assert_eq!(cfg.mode, ProxyMode::Standalone);
        assert!(cfg.master_addr.is_none());
    }
}
