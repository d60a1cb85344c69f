// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replication proxy: several physical gateways acting as one logical
//! radio receiver for a single CCU.
//!
//! ```text
//!   slave A ──wrap──┐
//!   slave B ──wrap──┼──> master: dedup (40 ms window, best signal)
//!   local radio ────┘        │
//!                            ├──> CCU link (exactly one relay)
//!                            └──> routing table (winner's address)
//!
//!   CCU command ──> routing table ──> unicast sibling / broadcast+local
//! ```
//!
//! A slave has no state: it wraps every locally received frame in a
//! sibling header and forwards it to the master. The master loops its
//! own frames through the same ingest path, resolves each dedup window
//! from the loop that drains the sibling socket, and routes outbound
//! CCU commands by originating device id.
//!
//! # Modules
//!
//! - `wire` - sibling datagram header
//! - `parse` - lenient sub-protocol parser and dedup hash
//! - `dedup` - windowed best-signal arbitration
//! - `routing` - device-id to sibling-address map

pub mod dedup;
pub mod parse;
pub mod routing;
pub mod wire;

pub use dedup::{DedupCache, Relay};
pub use parse::{parse_frame_image, semantic_hash, RadioFrameInfo};
pub use routing::{Route, RoutingTable, TxRoute};
pub use wire::{decode_sibling, encode_sibling, SiblingHeader, SIBLING_COMMAND, SIBLING_FRAME};

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;

use crate::bus::{FrameBus, FrameHandler};
use crate::config::{GatewayConfig, ProxyMode};
use crate::link::{bind_udp, RemoteLink};

/// Proxy counters.
#[derive(Debug, Default, Clone)]
pub struct ProxyStats {
    /// Frames wrapped and forwarded to the master (slave role).
    pub frames_forwarded: u64,
    /// Frame sightings ingested into the dedup cache (master role).
    pub sightings: u64,
    /// Winning frames relayed to the CCU (master role).
    pub relays: u64,
    /// Commands unicast to a known sibling.
    pub commands_unicast: u64,
    /// Commands broadcast to all known siblings.
    pub commands_broadcast: u64,
    /// Sibling datagrams rejected (malformed or wrong source).
    pub rejected: u64,
}

/// Fleet replication endpoint. Inert in standalone mode.
pub struct ReplicationProxy {
    mode: ProxyMode,
    socket: UdpSocket,
    bus: Arc<FrameBus>,
    link: Arc<RemoteLink>,
    /// How siblings see this gateway; used for "local radio" detection.
    self_addr: SocketAddrV4,
    master_addr: Option<SocketAddr>,
    dedup: DedupCache,
    routing: RoutingTable,
    epoch: Instant,
    wire_seq: AtomicU8,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    frames_forwarded: AtomicU64,
    sightings: AtomicU64,
    relays: AtomicU64,
    commands_unicast: AtomicU64,
    commands_broadcast: AtomicU64,
    rejected: AtomicU64,
}

impl ReplicationProxy {
    /// Bind the sibling port and build the proxy for the configured role.
    pub fn new(
        cfg: &GatewayConfig,
        bus: Arc<FrameBus>,
        link: Arc<RemoteLink>,
    ) -> io::Result<Arc<Self>> {
        if cfg.mode == ProxyMode::Slave && cfg.master_addr.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "slave mode requires a master address",
            ));
        }
        let socket = bind_udp(cfg.proxy_port)?;
        let self_ip = cfg.advertised_ip.unwrap_or_else(primary_ipv4);
        let self_addr = SocketAddrV4::new(self_ip, socket.local_addr()?.port());
        log::info!(
            "[PROXY] {} on udp/{} (self {})",
            cfg.mode,
            self_addr.port(),
            self_ip
        );
        Ok(Arc::new(Self {
            mode: cfg.mode,
            socket,
            bus,
            link,
            self_addr,
            master_addr: cfg.master_addr,
            dedup: DedupCache::new(cfg.dedup_window, cfg.dedup_retention),
            routing: RoutingTable::new(self_ip),
            epoch: Instant::now(),
            wire_seq: AtomicU8::new(0),
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            frames_forwarded: AtomicU64::new(0),
            sightings: AtomicU64::new(0),
            relays: AtomicU64::new(0),
            commands_unicast: AtomicU64::new(0),
            commands_broadcast: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }))
    }

    /// Whether fleet replication is enabled at all.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.mode != ProxyMode::Standalone
    }

    #[must_use]
    pub fn mode(&self) -> ProxyMode {
        self.mode
    }

    /// Port the sibling socket actually bound (useful with an
    /// ephemeral config).
    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    #[must_use]
    pub fn stats(&self) -> ProxyStats {
        ProxyStats {
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            sightings: self.sightings.load(Ordering::Relaxed),
            relays: self.relays.load(Ordering::Relaxed),
            commands_unicast: self.commands_unicast.load(Ordering::Relaxed),
            commands_broadcast: self.commands_broadcast.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Route table introspection, for display.
    #[must_use]
    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Process one sibling datagram.
    pub fn ingest_sibling(&self, src: SocketAddrV4, data: &[u8]) {
        let (header, payload) = match decode_sibling(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::debug!("[PROXY] rejected sibling datagram from {}: {}", src, e);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match (self.mode, header.msg_type) {
            (ProxyMode::Master, wire::SIBLING_FRAME) => {
                self.ingest_frame(Instant::now(), src, &header, payload);
            }
            (ProxyMode::Slave, wire::SIBLING_COMMAND) => {
                // only the configured master may inject commands
                let from_master = self
                    .master_addr
                    .is_some_and(|m| m.ip() == std::net::IpAddr::V4(*src.ip()));
                if from_master {
                    log::debug!("[PROXY] command from master, {} bytes to radio", payload.len());
                    self.bus.send(payload);
                } else {
                    log::warn!("[PROXY] command from non-master {} ignored", src);
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
            (_, other) => {
                log::debug!(
                    "[PROXY] sibling type {} not handled in {} mode",
                    other,
                    self.mode
                );
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record one sighting of a frame in the dedup cache (master role).
    pub fn ingest_frame(
        &self,
        now: Instant,
        src: SocketAddrV4,
        header: &SiblingHeader,
        image: &[u8],
    ) {
        let hash = semantic_hash(image);
        let device_id = parse_frame_image(image)
            .map(|info| info.src_id)
            .or_else(|| (header.src_id != 0).then_some(header.src_id));
        self.sightings.fetch_add(1, Ordering::Relaxed);
        self.dedup
            .ingest_at(now, hash, header.rssi, src, device_id, image);
    }

    /// Resolve elapsed dedup windows: relay each winner to the CCU
    /// exactly once and teach the routing table the winning path.
    pub fn poll_at(&self, now: Instant) -> usize {
        let relays = self.dedup.poll_at(now);
        let count = relays.len();
        for relay in relays {
            if let Some(device) = relay.device_id {
                self.routing.learn(device, relay.src, relay.rssi, now);
            }
            self.link.relay_frame(&relay.frame);
            self.relays.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Decide delivery for a CCU command. Returns `true` when the
    /// caller must also deliver the command to the local radio.
    pub fn handle_ccu_tx(&self, image: &[u8]) -> bool {
        if self.mode != ProxyMode::Master {
            return true;
        }
        let dst = parse_frame_image(image).map(|info| info.dst_id);
        match self.routing.route(dst) {
            TxRoute::Local => true,
            TxRoute::Sibling(addr) => {
                self.send_command(addr, image);
                self.commands_unicast.fetch_add(1, Ordering::Relaxed);
                false
            }
            TxRoute::Broadcast(addrs) => {
                // unknown destination: every sibling plus the local
                // radio, it might be reachable only here
                for addr in &addrs {
                    self.send_command(*addr, image);
                }
                self.commands_broadcast.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Spawn the sibling datagram loop. Call once; no-op role checks
    /// are the caller's concern (standalone gateways never start it).
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        self.running.store(true, Ordering::Release);
        let proxy = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rfgw-proxy".into())
            .spawn(move || proxy.run_loop())?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the loop and join the thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn run_loop(self: Arc<Self>) {
        log::debug!("[PROXY] sibling loop started ({})", self.mode);
        let mut buf = [0u8; 2048];
        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, SocketAddr::V4(src))) => self.ingest_sibling(src, &buf[..n]),
                Ok((_, SocketAddr::V6(src))) => {
                    log::debug!("[PROXY] ignoring IPv6 sibling {}", src);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => log::warn!("[PROXY] recv error: {}", e),
            }
            if self.mode == ProxyMode::Master {
                self.poll_at(Instant::now());
            }
        }
        log::debug!("[PROXY] sibling loop stopped");
    }

    /// Wrap a frame image in a sibling header.
    fn make_header(&self, msg_type: u8, image: &[u8]) -> SiblingHeader {
        let info = parse_frame_image(image);
        SiblingHeader {
            msg_type,
            src_id: info.map_or(0, |i| i.src_id),
            dst_id: info.map_or(0, |i| i.dst_id),
            seq: info.map_or_else(|| self.wire_seq.fetch_add(1, Ordering::Relaxed), |i| i.seq),
            rssi: info.map_or(0, |i| i.rssi),
            quality: u8::from(info.is_some()),
            timestamp_ms: self.epoch.elapsed().as_millis() as u64,
        }
    }

    fn send_command(&self, addr: SocketAddrV4, image: &[u8]) {
        let header = self.make_header(wire::SIBLING_COMMAND, image);
        let wire = encode_sibling(&header, image);
        if let Err(e) = self.socket.send_to(&wire, SocketAddr::V4(addr)) {
            log::warn!("[PROXY] command to {} failed: {}", addr, e);
        }
    }
}

impl FrameHandler for ReplicationProxy {
    /// A frame from the local radio enters the fleet path.
    fn on_frame(&self, frame: &[u8]) {
        match self.mode {
            ProxyMode::Standalone => {}
            ProxyMode::Slave => {
                let Some(master) = self.master_addr else {
                    return;
                };
                let header = self.make_header(wire::SIBLING_FRAME, frame);
                let wire = encode_sibling(&header, frame);
                match self.socket.send_to(&wire, master) {
                    Ok(_) => {
                        self.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => log::warn!("[PROXY] forward to master failed: {}", e),
                }
            }
            ProxyMode::Master => {
                // the master's own radio is just another sibling
                let header = self.make_header(wire::SIBLING_FRAME, frame);
                self.ingest_frame(Instant::now(), self.self_addr, &header, frame);
            }
        }
    }
}

/// Primary interface IPv4 of this host, falling back to loopback.
fn primary_ipv4() -> Ipv4Addr {
    match local_ip_address::local_ip() {
        Ok(std::net::IpAddr::V4(ip)) => ip,
        Ok(std::net::IpAddr::V6(ip)) => {
            log::warn!("[PROXY] primary address {} is IPv6, using loopback", ip);
            Ipv4Addr::LOCALHOST
        }
        Err(e) => {
            log::warn!("[PROXY] primary address lookup failed ({}), using loopback", e);
            Ipv4Addr::LOCALHOST
        }
    }
}
