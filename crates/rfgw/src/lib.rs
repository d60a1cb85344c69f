// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # rfgw - Radio Frequency Gateway core
//!
//! Bridges a packet-radio transceiver on a serial link to a central
//! control unit (CCU) over UDP, optionally replicating across a fleet
//! of gateways that act as one logical receiver.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        CCU (remote)                          |
//! +------------------------------+-------------------------------+
//!                                | UDP, virtual-serial protocol
//! +------------------------------+-------------------------------+
//! |  RemoteLink   <---------->   ReplicationProxy  <--> siblings |
//! |  (link)                      (proxy: dedup + routing)        |
//! +------------------------------+-------------------------------+
//! |                  FrameBus (bus: fan-out + tx queue)          |
//! +------------------------------+-------------------------------+
//! |         Deframer / CRC-16 (framing)  |  SerialLink (serial)  |
//! +--------------------------------------------------------------+
//! |                     radio transceiver                        |
//! ```
//!
//! Inbound: serial bytes are deframed and CRC-checked, then fanned out
//! to every registered [`bus::FrameHandler`] - the CCU link relays
//! them, the proxy replicates them. Outbound: CCU commands are routed
//! (fleet master) or queued straight onto the serial link.
//!
//! ## Modules Overview
//!
//! - [`framing`] - escape-coded frame format and CRC-16 trailer
//! - [`serial`] - transport trait plus a loopback test double
//! - [`bus`] - serial reader/writer threads and frame fan-out
//! - [`link`] - virtual-serial-over-UDP protocol spoken by the CCU
//! - [`proxy`] - master/slave fleet replication, dedup and routing
//! - [`config`] - wire constants and runtime configuration

/// Serial reader/writer threads and decoded-frame fan-out.
pub mod bus;
/// Wire constants and runtime configuration (single source of truth).
pub mod config;
/// Escape-coded serial frame format: deframer, encoder, CRC-16.
pub mod framing;
/// Virtual-serial-over-UDP protocol endpoint for the CCU.
pub mod link;
/// Fleet replication: windowed dedup and command routing.
pub mod proxy;
/// Serial transport abstraction and loopback implementation.
pub mod serial;

pub use bus::{FrameBus, FrameHandler};
pub use config::{GatewayConfig, ProxyMode};
pub use link::RemoteLink;
pub use proxy::ReplicationProxy;
pub use serial::{LoopbackSerial, SerialLink};
