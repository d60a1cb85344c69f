// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Virtual-serial-over-UDP protocol spoken by the CCU.
//!
//! # Wire Format
//!
//! ```text
//! +------+-----+-----------+-----------+
//! | type | seq | payload.. | crc16(BE) |
//! +------+-----+-----------+-----------+
//! ```
//!
//! The checksum covers everything preceding it and uses the same
//! CRC-16 as the serial frame trailer (wire-compatibility
//! requirement). Message types:
//!
//! | Type | Name       | Payload                        |
//! |------|------------|--------------------------------|
//! | 0    | connect    | version (even) or resync id (odd) |
//! | 1    | disconnect | -                              |
//! | 2    | keepalive  | -                              |
//! | 3    | led        | 1 byte, bit0/1/2 = R/G/B       |
//! | 4    | reset      | -                              |
//! | 5    | start      | -                              |
//! | 6    | stop       | -                              |
//! | 7    | frame      | decoded frame image            |
//!
//! The protocol is single-client: exactly one connection record
//! exists, and any non-connect datagram from a different source is
//! rejected (anti-spoofing for an unauthenticated UDP protocol). The
//! endpoint identifier is a small odd counter bumped by 2 on every
//! full (re)connect; the CCU uses it to tell a gateway restart from a
//! missed message. Odd identifiers can never collide with the even
//! protocol version byte of an initial connect.
//!
//! Connection-state fields are atomics rather than lock-protected:
//! they are read on every frame relay and written only on
//! (dis)connect. Multi-field updates are ordered deliberately -
//! address before port on connect, port before address on disconnect -
//! so a concurrent reader never pairs a fresh port with a stale
//! address. Port zero means "no connection".

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::bus::{FrameBus, FrameHandler};
use crate::config::{GatewayConfig, MAX_RELAY_PAYLOAD, POLL_INTERVAL};
use crate::framing::crc16;
use crate::proxy::ReplicationProxy;

/// Message type bytes.
pub mod msg {
    pub const CONNECT: u8 = 0;
    pub const DISCONNECT: u8 = 1;
    pub const KEEPALIVE: u8 = 2;
    pub const LED: u8 = 3;
    pub const RESET: u8 = 4;
    pub const START: u8 = 5;
    pub const STOP: u8 = 6;
    pub const FRAME: u8 = 7;
}

/// Minimum datagram length: type + seq + checksum.
pub const MIN_MESSAGE_LEN: usize = 4;

/// Build a protocol message: `type seq payload crc16`.
#[must_use]
pub fn build_message(msg_type: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + MIN_MESSAGE_LEN);
    out.push(msg_type);
    out.push(seq);
    out.extend_from_slice(payload);
    let crc = crc16(&out);
    out.push((crc >> 8) as u8);
    out.push(crc as u8);
    out
}

/// Validate length and checksum, returning `(type, seq, payload)`.
#[must_use]
pub fn parse_message(data: &[u8]) -> Option<(u8, u8, &[u8])> {
    if data.len() < MIN_MESSAGE_LEN {
        return None;
    }
    let body = &data[..data.len() - 2];
    let expected = u16::from(data[data.len() - 2]) << 8 | u16::from(data[data.len() - 1]);
    if crc16(body) != expected {
        return None;
    }
    Some((data[0], data[1], &data[2..data.len() - 2]))
}

/// Single-client connection record, all fields atomic.
struct ConnState {
    /// Remote IPv4 address bits. Valid only while port is non-zero.
    addr: AtomicU32,
    /// Remote port; zero = disconnected.
    port: AtomicU16,
    /// Whether radio frames are forwarded (start/stop messages).
    active: AtomicBool,
    /// Odd counter, +2 per full (re)connect.
    endpoint_id: AtomicU8,
    /// Rolling per-message sequence byte.
    tx_seq: AtomicU8,
}

impl ConnState {
    fn new() -> Self {
        Self {
            addr: AtomicU32::new(0),
            port: AtomicU16::new(0),
            active: AtomicBool::new(false),
            endpoint_id: AtomicU8::new(1),
            tx_seq: AtomicU8::new(0),
        }
    }

    /// Record a connection. Address is written before the port so a
    /// concurrent reader never sees the new port with the old address.
    fn record(&self, addr: Ipv4Addr, port: u16) {
        self.addr.store(u32::from(addr), Ordering::Release);
        self.port.store(port, Ordering::Release);
    }

    /// Clear the connection. Port first, so in-flight sends become
    /// no-ops immediately.
    fn clear(&self) {
        self.port.store(0, Ordering::Release);
        self.addr.store(0, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }

    /// Current remote endpoint, `None` when disconnected.
    fn remote(&self) -> Option<SocketAddrV4> {
        let port = self.port.load(Ordering::Acquire);
        if port == 0 {
            return None;
        }
        let addr = Ipv4Addr::from(self.addr.load(Ordering::Acquire));
        Some(SocketAddrV4::new(addr, port))
    }

    fn next_seq(&self) -> u8 {
        self.tx_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Bump the endpoint identifier for a full (re)connect. Stays odd.
    fn next_endpoint_id(&self) -> u8 {
        let id = self.endpoint_id.load(Ordering::Acquire).wrapping_add(2);
        self.endpoint_id.store(id, Ordering::Release);
        id
    }
}

/// Protocol counters.
#[derive(Debug, Default, Clone)]
pub struct LinkStats {
    /// Valid datagrams accepted.
    pub accepted: u64,
    /// Datagrams rejected (length, checksum or source mismatch).
    pub rejected: u64,
    /// Radio frames relayed to the CCU.
    pub frames_relayed: u64,
    /// Frames dropped because they exceed the datagram-safe size.
    pub frames_oversize: u64,
    /// Forced disconnects due to keepalive timeout.
    pub timeouts: u64,
}

/// The CCU-facing protocol endpoint.
///
/// Consumes radio frames from the bus (standalone mode) or from the
/// replication proxy (fleet master mode) and relays them as type-7
/// messages; commands from the CCU travel the reverse path.
pub struct RemoteLink {
    socket: UdpSocket,
    bus: Arc<FrameBus>,
    /// Set in fleet master mode; CCU commands are offered here before
    /// local delivery.
    proxy: ArcSwapOption<ReplicationProxy>,
    conn: ConnState,
    epoch: Instant,
    last_rx_ms: AtomicU64,
    /// Keepalive cadence runs on its own clock so sustained frame
    /// relay cannot starve it.
    last_ka_ms: AtomicU64,
    timeout_ms: u64,
    keepalive_ms: u64,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    frames_relayed: AtomicU64,
    frames_oversize: AtomicU64,
    timeouts: AtomicU64,
}

impl RemoteLink {
    /// Bind the CCU link port and build the endpoint.
    pub fn new(cfg: &GatewayConfig, bus: Arc<FrameBus>) -> io::Result<Arc<Self>> {
        let socket = bind_udp(cfg.ccu_port)?;
        log::info!(
            "[LINK] CCU link listening on udp/{}",
            socket.local_addr()?.port()
        );
        Ok(Arc::new(Self {
            socket,
            bus,
            proxy: ArcSwapOption::empty(),
            conn: ConnState::new(),
            epoch: Instant::now(),
            last_rx_ms: AtomicU64::new(0),
            last_ka_ms: AtomicU64::new(0),
            timeout_ms: cfg.connection_timeout.as_millis() as u64,
            keepalive_ms: cfg.keepalive_interval.as_millis() as u64,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            frames_relayed: AtomicU64::new(0),
            frames_oversize: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }))
    }

    /// Attach the replication proxy (fleet master mode).
    pub fn set_proxy(&self, proxy: Arc<ReplicationProxy>) {
        self.proxy.store(Some(proxy));
    }

    /// Port the link actually bound (useful with an ephemeral config).
    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Currently connected CCU, for display.
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.conn.remote().map(SocketAddr::V4)
    }

    /// Whether frame forwarding has been started by the CCU.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.conn.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> LinkStats {
        LinkStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            frames_relayed: self.frames_relayed.load(Ordering::Relaxed),
            frames_oversize: self.frames_oversize.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Milliseconds on this link's monotonic clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Process one inbound datagram. Rejected datagrams mutate nothing.
    pub fn handle_datagram(&self, src: SocketAddr, data: &[u8]) {
        let Some((msg_type, _seq, payload)) = parse_message(data) else {
            log::debug!("[LINK] rejected datagram from {} (length/checksum)", src);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let SocketAddr::V4(src4) = src else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if msg_type > msg::FRAME {
            // unknown types are protocol violations, not liveness proof
            log::debug!(
                "[LINK] rejected unknown message type {} from {}",
                msg_type,
                src
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if msg_type != msg::CONNECT && self.conn.remote() != Some(src4) {
            log::warn!(
                "[LINK] rejected type {} datagram from unexpected source {}",
                msg_type,
                src
            );
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.last_rx_ms.store(self.now_ms(), Ordering::Release);

        match msg_type {
            msg::CONNECT => self.handle_connect(src4, payload),
            msg::DISCONNECT => {
                log::info!("[LINK] CCU {} disconnected", src4);
                self.conn.clear();
            }
            msg::KEEPALIVE => {}
            msg::LED => {
                if let Some(&bits) = payload.first() {
                    self.bus
                        .set_led(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0);
                }
            }
            msg::RESET => self.bus.reset_radio(),
            msg::START => {
                log::info!("[LINK] connection started, forwarding radio frames");
                self.conn.active.store(true, Ordering::Release);
            }
            msg::STOP => {
                log::info!("[LINK] connection stopped");
                self.conn.active.store(false, Ordering::Release);
            }
            msg::FRAME => self.handle_ccu_frame(payload),
            _ => {}
        }
    }

    fn handle_connect(&self, src: SocketAddrV4, payload: &[u8]) {
        let current_id = self.conn.endpoint_id.load(Ordering::Acquire);
        let resync_id = payload.first().copied().filter(|id| id % 2 == 1);

        let reply_id = match resync_id {
            Some(id) if id == current_id => {
                // abbreviated reconnect, session survives
                log::info!("[LINK] CCU {} resynced (endpoint id {})", src, id);
                self.conn.record(*src.ip(), src.port());
                id
            }
            Some(stale) => {
                // stale identifier: force a full re-sync
                log::warn!(
                    "[LINK] CCU {} reconnect with stale endpoint id {} (current {}), full resync",
                    src,
                    stale,
                    current_id
                );
                self.full_connect(src)
            }
            None => {
                log::info!(
                    "[LINK] CCU {} connected (protocol version {})",
                    src,
                    payload.first().copied().unwrap_or(0)
                );
                self.full_connect(src)
            }
        };

        self.send_message(msg::CONNECT, &[reply_id]);
    }

    /// Full (re)connect: new endpoint identifier, forwarding off until
    /// the CCU sends start.
    fn full_connect(&self, src: SocketAddrV4) -> u8 {
        self.conn.active.store(false, Ordering::Release);
        self.conn.record(*src.ip(), src.port());
        self.conn.next_endpoint_id()
    }

    /// A frame message from the CCU: a command for the radio. In fleet
    /// master mode the proxy decides whether it also goes out to a
    /// sibling; local delivery is the fallback for unknown routes.
    fn handle_ccu_frame(&self, image: &[u8]) {
        let deliver_locally = match self.proxy.load_full() {
            Some(proxy) if proxy.is_active() => proxy.handle_ccu_tx(image),
            _ => true,
        };
        if deliver_locally {
            self.bus.send(image);
        }
    }

    /// Relay a radio frame image to the CCU as a type-7 message.
    ///
    /// Dropped silently while the connection is not started; oversized
    /// frames are logged and dropped, never fragmented.
    pub fn relay_frame(&self, image: &[u8]) {
        if !self.is_active() {
            return;
        }
        if image.len() > MAX_RELAY_PAYLOAD {
            self.frames_oversize.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[LINK] frame of {} bytes exceeds datagram-safe size {}, dropped",
                image.len(),
                MAX_RELAY_PAYLOAD
            );
            return;
        }
        self.send_message(msg::FRAME, image);
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Send a protocol message to the connected CCU. No-op while
    /// disconnected (the port is cleared first on disconnect, so an
    /// in-flight send simply fizzles).
    fn send_message(&self, msg_type: u8, payload: &[u8]) {
        let Some(remote) = self.conn.remote() else {
            return;
        };
        let message = build_message(msg_type, self.conn.next_seq(), payload);
        if let Err(e) = self.socket.send_to(&message, SocketAddr::V4(remote)) {
            log::warn!("[LINK] send to {} failed: {}", remote, e);
        }
    }

    /// Periodic work: keepalive emission and timeout detection.
    ///
    /// Runs on every loop iteration; `now_ms` is on the link's clock.
    /// Timeout clears the connection exactly like an explicit
    /// disconnect.
    pub fn check_liveness(&self, now_ms: u64) {
        if self.conn.remote().is_none() {
            return;
        }
        let last_rx = self.last_rx_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last_rx) > self.timeout_ms {
            log::warn!(
                "[LINK] no CCU traffic for {} ms, forcing disconnect",
                now_ms.saturating_sub(last_rx)
            );
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            self.conn.clear();
            return;
        }
        let last_ka = self.last_ka_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last_ka) >= self.keepalive_ms {
            self.last_ka_ms.store(now_ms, Ordering::Release);
            self.send_message(msg::KEEPALIVE, &[]);
        }
    }

    /// Spawn the datagram handling loop. Call once.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        self.running.store(true, Ordering::Release);
        let link = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("rfgw-ccu-link".into())
            .spawn(move || link.run_loop())?;
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
        log::debug!("[LINK] datagram loop started");
        let mut buf = [0u8; 2048];
        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => self.handle_datagram(src, &buf[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::warn!("[LINK] recv error: {}", e);
                }
            }
            self.check_liveness(self.now_ms());
        }
        log::debug!("[LINK] datagram loop stopped");
    }
}

impl FrameHandler for RemoteLink {
    fn on_frame(&self, frame: &[u8]) {
        self.relay_frame(frame);
    }
}

/// Bind a UDP socket with reuse-address and the poll read timeout.
pub(crate) fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&bind_addr.into())?;
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_frame;
    use crate::serial::LoopbackSerial;
    use std::time::Duration;

    fn test_link() -> (Arc<RemoteLink>, Arc<LoopbackSerial>, Arc<FrameBus>) {
        let serial = Arc::new(LoopbackSerial::new());
        let bus = Arc::new(FrameBus::new(serial.clone()));
        let cfg = GatewayConfig {
            ccu_port: 0,
            ..GatewayConfig::default()
        };
        let link = RemoteLink::new(&cfg, bus.clone()).expect("bind");
        (link, serial, bus)
    }

    /// A CCU stand-in with a real socket for observing replies.
    struct FakeCcu {
        socket: UdpSocket,
    }

    impl FakeCcu {
        fn new() -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").expect("bind");
            socket
                .set_read_timeout(Some(Duration::from_millis(500)))
                .expect("timeout");
            Self { socket }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().expect("addr")
        }

        fn recv(&self) -> Option<(u8, Vec<u8>)> {
            let mut buf = [0u8; 2048];
            let n = self.socket.recv(&mut buf).ok()?;
            let (t, _seq, payload) = parse_message(&buf[..n])?;
            Some((t, payload.to_vec()))
        }
    }

    fn connect(link: &RemoteLink, ccu: &FakeCcu) -> u8 {
        link.handle_datagram(ccu.addr(), &build_message(msg::CONNECT, 0, &[2]));
        let (t, payload) = ccu.recv().expect("connect reply");
        assert_eq!(t, msg::CONNECT);
        payload[0]
    }

    #[test]
    fn test_connect_records_remote_and_replies_odd_id() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();

        assert!(link.remote_addr().is_none());
        let id = connect(&link, &ccu);
        assert_eq!(id % 2, 1);
        assert_eq!(link.remote_addr(), Some(ccu.addr()));
        assert!(!link.is_active());
    }

    #[test]
    fn test_second_connect_supersedes_first() {
        let (link, _serial, _bus) = test_link();
        let first = FakeCcu::new();
        let second = FakeCcu::new();

        connect(&link, &first);
        connect(&link, &second);
        assert_eq!(link.remote_addr(), Some(second.addr()));

        // non-connect traffic from the first address is rejected
        let before = link.stats().rejected;
        link.handle_datagram(first.addr(), &build_message(msg::KEEPALIVE, 0, &[]));
        assert_eq!(link.stats().rejected, before + 1);

        // and accepted from the second
        link.handle_datagram(second.addr(), &build_message(msg::KEEPALIVE, 0, &[]));
        assert_eq!(link.stats().rejected, before + 1);
    }

    #[test]
    fn test_resync_keeps_id_stale_id_forces_full() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();

        let id = connect(&link, &ccu);

        // abbreviated reconnect with the current id keeps it
        link.handle_datagram(ccu.addr(), &build_message(msg::CONNECT, 1, &[id]));
        let (_, payload) = ccu.recv().expect("resync reply");
        assert_eq!(payload[0], id);

        // stale odd id forces a full resync with a fresh id
        let stale = id.wrapping_add(4);
        link.handle_datagram(ccu.addr(), &build_message(msg::CONNECT, 2, &[stale]));
        let (_, payload) = ccu.recv().expect("full resync reply");
        assert_eq!(payload[0], id.wrapping_add(2));
        assert_eq!(payload[0] % 2, 1);
    }

    #[test]
    fn test_bad_checksum_and_short_datagrams_rejected() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);

        let mut bad = build_message(msg::KEEPALIVE, 0, &[]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let before = link.stats().rejected;
        link.handle_datagram(ccu.addr(), &bad);
        link.handle_datagram(ccu.addr(), &[msg::KEEPALIVE, 0]);
        assert_eq!(link.stats().rejected, before + 2);
        // rejected datagrams mutate nothing
        assert_eq!(link.remote_addr(), Some(ccu.addr()));
    }

    #[test]
    fn test_start_stop_gate_frame_relay() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);

        let image = encode_frame(&[0x10, 0x20]).expect("encode");

        // inactive: dropped silently
        link.relay_frame(&image);
        assert!(ccu.recv().is_none());

        link.handle_datagram(ccu.addr(), &build_message(msg::START, 0, &[]));
        assert!(link.is_active());
        link.relay_frame(&image);
        let (t, payload) = ccu.recv().expect("frame relay");
        assert_eq!(t, msg::FRAME);
        assert_eq!(payload, image);

        link.handle_datagram(ccu.addr(), &build_message(msg::STOP, 0, &[]));
        assert!(!link.is_active());
        link.relay_frame(&image);
        assert!(ccu.recv().is_none());
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);
        link.handle_datagram(ccu.addr(), &build_message(msg::START, 0, &[]));

        let oversized = vec![0u8; MAX_RELAY_PAYLOAD + 1];
        link.relay_frame(&oversized);
        assert_eq!(link.stats().frames_oversize, 1);
        assert!(ccu.recv().is_none());
    }

    #[test]
    fn test_led_reset_and_frame_to_serial() {
        let (link, serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);

        link.handle_datagram(ccu.addr(), &build_message(msg::LED, 0, &[0b101]));
        assert_eq!(serial.led(), (true, false, true));

        link.handle_datagram(ccu.addr(), &build_message(msg::RESET, 0, &[]));
        assert_eq!(serial.reset_count(), 1);

        // frame messages go to the radio via the bus queue; the bus
        // writer thread is not running here, so just check acceptance
        let image = encode_frame(&[0x42]).expect("encode");
        link.handle_datagram(ccu.addr(), &build_message(msg::FRAME, 0, &image));
        // queued, not rejected
        assert_eq!(link.stats().rejected, 0);
    }

    #[test]
    fn test_disconnect_clears_connection() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);
        link.handle_datagram(ccu.addr(), &build_message(msg::START, 0, &[]));

        link.handle_datagram(ccu.addr(), &build_message(msg::DISCONNECT, 0, &[]));
        assert!(link.remote_addr().is_none());
        assert!(!link.is_active());
    }

    #[test]
    fn test_keepalive_timeout_forces_disconnect() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);

        // within the window: connection survives
        link.check_liveness(link.now_ms() + 1000);
        assert!(link.remote_addr().is_some());

        // past the 2.5 s threshold: cleared like an explicit disconnect
        link.check_liveness(link.now_ms() + 3000);
        assert!(link.remote_addr().is_none());
        assert_eq!(link.stats().timeouts, 1);
    }

    #[test]
    fn test_periodic_keepalive_emitted() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);

        link.check_liveness(link.now_ms() + 1100);
        let (t, _) = ccu.recv().expect("keepalive");
        assert_eq!(t, msg::KEEPALIVE);
    }

    #[test]
    fn test_keepalive_not_suppressed_by_frame_relay() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);
        link.handle_datagram(ccu.addr(), &build_message(msg::START, 0, &[]));

        let t1 = link.now_ms() + 1100;
        link.check_liveness(t1);
        let (t, _) = ccu.recv().expect("keepalive");
        assert_eq!(t, msg::KEEPALIVE);

        // continuous frame relay must not starve the keepalive cadence
        let image = encode_frame(&[0x01]).expect("encode");
        link.relay_frame(&image);
        link.relay_frame(&image);
        link.check_liveness(t1 + 1000);

        let mut types = Vec::new();
        while let Some((t, _)) = ccu.recv() {
            types.push(t);
            if t == msg::KEEPALIVE {
                break;
            }
        }
        assert_eq!(types, vec![msg::FRAME, msg::FRAME, msg::KEEPALIVE]);
    }

    #[test]
    fn test_unknown_type_rejected_and_not_liveness_proof() {
        let (link, _serial, _bus) = test_link();
        let ccu = FakeCcu::new();
        connect(&link, &ccu);

        let before = link.stats();
        let rx_before = link.last_rx_ms.load(Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(20));

        // valid checksum, right source, type outside the protocol
        link.handle_datagram(ccu.addr(), &build_message(9, 0, &[]));
        assert_eq!(link.stats().rejected, before.rejected + 1);
        assert_eq!(link.stats().accepted, before.accepted);
        // the inbound-traffic timestamp did not move
        assert_eq!(link.last_rx_ms.load(Ordering::Acquire), rx_before);

        // so unknown-type chatter alone cannot hold the connection open
        link.check_liveness(rx_before + 3000);
        assert!(link.remote_addr().is_none());
        assert_eq!(link.stats().timeouts, 1);
    }

    #[test]
    fn test_message_round_trip() {
        let built = build_message(msg::FRAME, 7, &[1, 2, 3]);
        let (t, seq, payload) = parse_message(&built).expect("parse");
        assert_eq!((t, seq, payload), (msg::FRAME, 7, &[1u8, 2, 3][..]));
        assert!(parse_message(&[0, 1]).is_none());
    }
}
