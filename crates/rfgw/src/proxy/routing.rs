// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Destination routing for outbound CCU commands (master role).
//!
//! The table maps originating device ids to the sibling that last won
//! a dedup window for that device. It is consulted only for outbound
//! command delivery; entries are never purged explicitly, newer wins
//! simply supersede older ones.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use parking_lot::Mutex;

/// Last-known best path to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Sibling that produced the winning copy of the device's traffic.
    pub addr: SocketAddrV4,
    /// Signal quality of that winning copy.
    pub rssi: u8,
    /// When the route was learned.
    pub last_seen: Instant,
}

/// Delivery decision for one outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxRoute {
    /// Best path is the local radio; do not forward to any sibling.
    Local,
    /// Unicast the command to exactly this sibling.
    Sibling(SocketAddrV4),
    /// Destination unknown: send to every distinct sibling AND deliver
    /// locally, since the device might only be reachable here.
    Broadcast(Vec<SocketAddrV4>),
}

/// Device-id to sibling-address map.
pub struct RoutingTable {
    routes: Mutex<HashMap<u32, Route>>,
    self_ip: Ipv4Addr,
}

impl RoutingTable {
    #[must_use]
    pub fn new(self_ip: Ipv4Addr) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            self_ip,
        }
    }

    /// Record the winner of a dedup window for `device`.
    ///
    /// Called when the window resolves, not at first sighting, so the
    /// table reflects the best-observed path rather than the fastest.
    pub fn learn(&self, device: u32, addr: SocketAddrV4, rssi: u8, now: Instant) {
        let mut routes = self.routes.lock();
        let previous = routes.insert(
            device,
            Route {
                addr,
                rssi,
                last_seen: now,
            },
        );
        if previous.map(|r| r.addr) != Some(addr) {
            if *addr.ip() == self.self_ip {
                log::debug!("[PROXY] device {:06X} now routed via local radio", device);
            } else {
                log::debug!("[PROXY] device {:06X} now routed via {}", device, addr);
            }
        }
    }

    /// Decide delivery for a command addressed to `device`.
    #[must_use]
    pub fn route(&self, device: Option<u32>) -> TxRoute {
        let routes = self.routes.lock();
        match device.and_then(|d| routes.get(&d)) {
            Some(route) if *route.addr.ip() == self.self_ip => TxRoute::Local,
            Some(route) => TxRoute::Sibling(route.addr),
            None => TxRoute::Broadcast(distinct_siblings(&routes, self.self_ip)),
        }
    }

    /// Distinct sibling addresses currently known (excluding self).
    #[must_use]
    pub fn siblings(&self) -> Vec<SocketAddrV4> {
        distinct_siblings(&self.routes.lock(), self.self_ip)
    }

    /// Number of devices with a known route.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }

    /// Look up the route for one device.
    #[must_use]
    pub fn get(&self, device: u32) -> Option<Route> {
        self.routes.lock().get(&device).copied()
    }
}

fn distinct_siblings(routes: &HashMap<u32, Route>, self_ip: Ipv4Addr) -> Vec<SocketAddrV4> {
    let mut addrs: Vec<SocketAddrV4> = routes
        .values()
        .map(|r| r.addr)
        .filter(|a| *a.ip() != self_ip)
        .collect();
    addrs.sort_unstable_by_key(|a| (u32::from(*a.ip()), a.port()));
    addrs.dedup();
    addrs
}
