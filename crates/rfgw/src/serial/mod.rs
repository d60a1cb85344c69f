// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Serial link abstraction between the frame bus and the radio module.
//!
//! The physical UART driver lives outside this crate; the bus consumes
//! it through [`SerialLink`]. Implementations must be safe to share
//! across the reader and writer threads.
//!
//! [`LoopbackSerial`] is the in-memory implementation used by tests and
//! by the daemon until a hardware driver is wired in.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::POLL_INTERVAL;

/// Byte counters for a serial link.
#[derive(Debug, Default, Clone)]
pub struct SerialStats {
    /// Bytes delivered to the reader.
    pub bytes_read: u64,
    /// Bytes accepted for transmission.
    pub bytes_written: u64,
    /// Transport faults reported (overrun, parity, framing).
    pub faults: u64,
    /// Radio reset pulses issued.
    pub resets: u64,
}

/// Byte-oriented duplex channel to the radio module.
///
/// `read` blocks up to an implementation-defined timeout and may return
/// `Ok(0)` when no bytes arrived; the reader loop treats that as a poll
/// tick, not end-of-stream.
pub trait SerialLink: Send + Sync {
    /// Read available bytes into `buf`, blocking briefly.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Queue bytes for transmission. Fire-and-forget.
    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Drive the status indicator.
    fn set_led(&self, red: bool, green: bool, blue: bool);

    /// Pulse the radio module reset line.
    fn reset_radio(&self);

    /// Return `true` if the transport reported an overrun/parity/framing
    /// error since the last call, clearing the flag. The reader flushes
    /// the deframer when this fires.
    fn take_fault(&self) -> bool;

    /// Byte counters.
    fn stats(&self) -> SerialStats {
        SerialStats::default()
    }
}

/// In-memory serial link for tests and bring-up.
///
/// Bytes injected with [`inject`](Self::inject) appear on `read`;
/// bytes passed to `write` accumulate in an output log.
pub struct LoopbackSerial {
    rx_tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    /// Partial chunk left over when a read buffer was smaller than the chunk.
    pending: Mutex<Vec<u8>>,
    written: Mutex<Vec<u8>>,
    fault: AtomicBool,
    led: AtomicU8,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    faults: AtomicU64,
    resets: AtomicU64,
}

impl Default for LoopbackSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSerial {
    #[must_use]
    pub fn new() -> Self {
        let (rx_tx, rx) = unbounded();
        Self {
            rx_tx,
            rx,
            pending: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            fault: AtomicBool::new(false),
            led: AtomicU8::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    /// Make `bytes` available to the next `read` call.
    pub fn inject(&self, bytes: &[u8]) {
        // receiver is owned by self, send cannot fail
        let _ = self.rx_tx.send(bytes.to_vec());
    }

    /// Simulate a transport-reported fault (overrun/framing error).
    pub fn inject_fault(&self) {
        self.fault.store(true, Ordering::Release);
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain and return everything written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.written.lock())
    }

    /// Current LED state as (red, green, blue).
    #[must_use]
    pub fn led(&self) -> (bool, bool, bool) {
        let v = self.led.load(Ordering::Acquire);
        (v & 1 != 0, v & 2 != 0, v & 4 != 0)
    }

    /// Number of reset pulses issued.
    #[must_use]
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }
}

impl SerialLink for LoopbackSerial {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(chunk) => *pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))
                }
            }
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.drain(..n);
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        self.written.lock().extend_from_slice(bytes);
        self.bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn set_led(&self, red: bool, green: bool, blue: bool) {
        let v = u8::from(red) | u8::from(green) << 1 | u8::from(blue) << 2;
        self.led.store(v, Ordering::Release);
    }

    fn reset_radio(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    fn take_fault(&self) -> bool {
        self.fault.swap(false, Ordering::AcqRel)
    }

    fn stats(&self) -> SerialStats {
        SerialStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
        }
    }
}
