// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame bus: serial reader loop and frame fan-out.
//!
//! Owns the two serial-facing threads and the handler registry:
//!
//! ```text
//! serial bytes -> Deframer -> dispatch() -> handler 1..N  (rfgw-serial-rx)
//! send() -> escape -> bounded queue -> SerialLink::write  (rfgw-serial-tx)
//! ```
//!
//! Dispatch takes a snapshot of the handler list under the lock and
//! invokes handlers outside it, so a slow or re-entrant handler can
//! never stall registration changes. Handlers run on the reader thread
//! and must be fast or queue internally; frames are delivered in
//! completion order and the slice is only valid for the callback.
//!
//! The outbound queue is bounded and drops the newest entry when full:
//! this traffic is time-sensitive, a stale retried frame is worse than
//! a dropped one.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;

use crate::config::{POLL_INTERVAL, SERIAL_RX_CHUNK, SERIAL_TX_QUEUE_DEPTH};
use crate::framing::{escape_frame, Deframer};
use crate::serial::SerialLink;

/// Consumer of decoded radio frames.
///
/// `on_frame` receives the decoded frame image; implementors copy what
/// they keep and must not block the reader thread.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: &[u8]);
}

/// Fan-out and counters for the bus.
#[derive(Debug, Default, Clone)]
pub struct BusStats {
    /// Frames dispatched to handlers.
    pub frames_dispatched: u64,
    /// Frames accepted for transmission.
    pub frames_sent: u64,
    /// Outbound frames dropped because the queue was full.
    pub frames_dropped: u64,
}

/// Handler registry plus the serial reader/writer tasks.
pub struct FrameBus {
    link: Arc<dyn SerialLink>,
    handlers: Mutex<Vec<Arc<dyn FrameHandler>>>,
    tx: Sender<Vec<u8>>,
    tx_rx: Receiver<Vec<u8>>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    dispatched: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl FrameBus {
    #[must_use]
    pub fn new(link: Arc<dyn SerialLink>) -> Self {
        let (tx, tx_rx) = bounded(SERIAL_TX_QUEUE_DEPTH);
        Self {
            link,
            handlers: Mutex::new(Vec::new()),
            tx,
            tx_rx,
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            dispatched: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a consumer. Idempotent; safe during dispatch.
    pub fn add_handler(&self, handler: Arc<dyn FrameHandler>) {
        let mut handlers = self.handlers.lock();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }
    }

    /// Unregister a consumer. Idempotent; safe during dispatch (the
    /// current snapshot still completes).
    pub fn remove_handler(&self, handler: &Arc<dyn FrameHandler>) {
        self.handlers.lock().retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Queue a decoded frame image for transmission to the radio.
    ///
    /// The image is escaped to wire form here. Never blocks; newest
    /// frame is dropped when the queue is full.
    pub fn send(&self, image: &[u8]) {
        let wire = escape_frame(image);
        match self.tx.try_send(wire) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 32 == 0 {
                    log::warn!("[BUS] serial tx queue full, {} frames dropped so far", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("[BUS] serial tx queue disconnected");
            }
        }
    }

    /// Deliver a decoded frame to every registered handler, in order.
    pub fn dispatch(&self, frame: &[u8]) {
        let snapshot: Vec<Arc<dyn FrameHandler>> = self.handlers.lock().clone();
        for handler in &snapshot {
            handler.on_frame(frame);
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Drive the status indicator.
    pub fn set_led(&self, red: bool, green: bool, blue: bool) {
        self.link.set_led(red, green, blue);
    }

    /// Pulse the radio module reset line.
    pub fn reset_radio(&self) {
        log::info!("[BUS] radio module reset requested");
        self.link.reset_radio();
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            frames_dispatched: self.dispatched.load(Ordering::Relaxed),
            frames_sent: self.sent.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Spawn the reader and writer threads. Call once.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        self.running.store(true, Ordering::Release);

        let bus = Arc::clone(self);
        let reader = std::thread::Builder::new()
            .name("rfgw-serial-rx".into())
            .spawn(move || bus.reader_loop())?;

        let bus = Arc::clone(self);
        let writer = std::thread::Builder::new()
            .name("rfgw-serial-tx".into())
            .spawn(move || bus.writer_loop())?;

        let mut threads = self.threads.lock();
        threads.push(reader);
        threads.push(writer);
        Ok(())
    }

    /// Stop both threads and wait for them to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn reader_loop(self: Arc<Self>) {
        log::debug!("[BUS] serial reader started");
        let mut deframer = Deframer::new(true);
        let mut buf = [0u8; SERIAL_RX_CHUNK];
        while self.running.load(Ordering::Acquire) {
            if self.link.take_fault() {
                log::warn!("[BUS] serial transport fault, flushing deframer");
                deframer.flush();
            }
            match self.link.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    let bus = &self;
                    deframer.feed(&buf[..n], &mut |frame| bus.dispatch(frame));
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    log::error!("[BUS] serial read error: {}", e);
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
        log::debug!("[BUS] serial reader stopped");
    }

    fn writer_loop(self: Arc<Self>) {
        log::debug!("[BUS] serial writer started");
        while self.running.load(Ordering::Acquire) {
            match self.tx_rx.recv_timeout(POLL_INTERVAL) {
                Ok(wire) => {
                    if let Err(e) = self.link.write(&wire) {
                        log::warn!("[BUS] serial write failed, frame dropped: {}", e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("[BUS] serial writer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_frame;
    use crate::serial::LoopbackSerial;
    use std::time::{Duration, Instant};

    struct Collector {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<Vec<u8>> {
            self.frames.lock().clone()
        }
    }

    impl FrameHandler for Collector {
        fn on_frame(&self, frame: &[u8]) {
            self.frames.lock().push(frame.to_vec());
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn test_dispatch_order_and_fanout() {
        let bus = FrameBus::new(Arc::new(LoopbackSerial::new()));
        let a = Collector::new();
        let b = Collector::new();
        bus.add_handler(a.clone());
        bus.add_handler(b.clone());

        bus.dispatch(&[1, 2, 3]);
        bus.dispatch(&[4, 5]);

        for c in [&a, &b] {
            assert_eq!(c.frames(), vec![vec![1, 2, 3], vec![4, 5]]);
        }
        assert_eq!(bus.stats().frames_dispatched, 2);
    }

    #[test]
    fn test_add_remove_idempotent() {
        let bus = FrameBus::new(Arc::new(LoopbackSerial::new()));
        let c = Collector::new();
        let h: Arc<dyn FrameHandler> = c.clone();
        bus.add_handler(h.clone());
        bus.add_handler(h.clone());
        bus.dispatch(&[7]);
        assert_eq!(c.frames().len(), 1);

        bus.remove_handler(&h);
        bus.remove_handler(&h);
        bus.dispatch(&[8]);
        assert_eq!(c.frames().len(), 1);
    }

    struct SelfRemover {
        bus: Mutex<Option<Arc<FrameBus>>>,
        victim: Mutex<Option<Arc<dyn FrameHandler>>>,
    }

    impl FrameHandler for SelfRemover {
        fn on_frame(&self, _frame: &[u8]) {
            // removing during dispatch must not deadlock
            if let (Some(bus), Some(victim)) =
                (self.bus.lock().clone(), self.victim.lock().clone())
            {
                bus.remove_handler(&victim);
            }
        }
    }

    #[test]
    fn test_removal_during_dispatch() {
        let bus = Arc::new(FrameBus::new(Arc::new(LoopbackSerial::new())));
        let victim = Collector::new();
        let victim_dyn: Arc<dyn FrameHandler> = victim.clone();
        let remover = Arc::new(SelfRemover {
            bus: Mutex::new(Some(bus.clone())),
            victim: Mutex::new(Some(victim_dyn.clone())),
        });

        bus.add_handler(remover);
        bus.add_handler(victim_dyn);

        // snapshot still delivers to the victim this round
        bus.dispatch(&[1]);
        assert_eq!(victim.frames().len(), 1);

        // but not on the next one
        bus.dispatch(&[2]);
        assert_eq!(victim.frames().len(), 1);
    }

    #[test]
    fn test_reader_decodes_injected_bytes() {
        let link = Arc::new(LoopbackSerial::new());
        let bus = Arc::new(FrameBus::new(link.clone()));
        let c = Collector::new();
        bus.add_handler(c.clone());
        bus.start().expect("start");

        let image = encode_frame(&[0x11, 0x22, 0xFD]).expect("encode");
        link.inject(&escape_frame(&image));

        assert!(wait_until(Duration::from_secs(1), || !c.frames().is_empty()));
        assert_eq!(c.frames(), vec![image]);
        bus.stop();
    }

    #[test]
    fn test_fault_flushes_partial_frame() {
        let link = Arc::new(LoopbackSerial::new());
        let bus = Arc::new(FrameBus::new(link.clone()));
        let c = Collector::new();
        bus.add_handler(c.clone());
        bus.start().expect("start");

        let image = encode_frame(&[0xAA; 16]).expect("encode");
        let wire = escape_frame(&image);

        // half a frame, then a fault, then a complete frame
        link.inject(&wire[..8]);
        std::thread::sleep(Duration::from_millis(50));
        link.inject_fault();
        link.inject(&wire);

        assert!(wait_until(Duration::from_secs(1), || !c.frames().is_empty()));
        assert_eq!(c.frames(), vec![image]);
        bus.stop();
    }

    #[test]
    fn test_send_writes_escaped_wire() {
        let link = Arc::new(LoopbackSerial::new());
        let bus = Arc::new(FrameBus::new(link.clone()));
        bus.start().expect("start");

        let image = encode_frame(&[0xFC, 0x01]).expect("encode");
        bus.send(&image);

        assert!(wait_until(Duration::from_secs(1), || link.stats().bytes_written
            == escape_frame(&image).len() as u64));
        assert_eq!(link.take_written(), escape_frame(&image));
        bus.stop();
    }
}
