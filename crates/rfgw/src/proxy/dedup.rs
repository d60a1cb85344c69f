// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-windowed best-signal deduplication (master role).
//!
//! Every sighting of a frame is keyed by its semantic hash. The first
//! sighting opens a 40 ms decision window; later sightings only raise
//! the recorded best signal/source, never resend and never extend the
//! window. When the deadline elapses the entry is relayed exactly once
//! with the best-observed source attached, so the routing table always
//! learns the best path, not merely the fastest. Entries are purged
//! after a fixed retention period whether or not they were ever sent,
//! bounding memory regardless of traffic pattern.
//!
//! All timing is expressed against a caller-supplied monotonic
//! instant, checked from the same loop that drains the sibling socket.
//! There are no timer callbacks.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct DedupEntry {
    first_seen: Instant,
    deadline: Instant,
    sent: bool,
    best_rssi: u8,
    best_src: SocketAddrV4,
    device_id: Option<u32>,
    frame: Vec<u8>,
}

/// A frame whose decision window elapsed, ready for relay to the CCU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay {
    /// Decoded frame image of the winning copy.
    pub frame: Vec<u8>,
    /// Sibling that produced the best-signal copy.
    pub src: SocketAddrV4,
    /// Best signal quality observed inside the window.
    pub rssi: u8,
    /// Originating device id when the payload was parseable.
    pub device_id: Option<u32>,
}

/// Windowed dedup cache. One per master proxy.
pub struct DedupCache {
    entries: Mutex<HashMap<u64, DedupEntry>>,
    window: Duration,
    retention: Duration,
}

impl DedupCache {
    #[must_use]
    pub fn new(window: Duration, retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            window,
            retention,
        }
    }

    /// Record a sighting. Returns `true` when this opened a new entry.
    ///
    /// A stronger later sighting replaces the recorded signal, source
    /// and frame copy in place; an already-sent entry absorbs late
    /// copies silently (that is the point of the retention period).
    pub fn ingest_at(
        &self,
        now: Instant,
        hash: u64,
        rssi: u8,
        src: SocketAddrV4,
        device_id: Option<u32>,
        frame: &[u8],
    ) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&hash) {
            Some(entry) => {
                if rssi > entry.best_rssi {
                    entry.best_rssi = rssi;
                    entry.best_src = src;
                    // copies can differ in the trailing signal byte;
                    // the CCU gets the strongest one
                    entry.frame = frame.to_vec();
                }
                if entry.device_id.is_none() {
                    entry.device_id = device_id;
                }
                false
            }
            None => {
                entries.insert(
                    hash,
                    DedupEntry {
                        first_seen: now,
                        deadline: now + self.window,
                        sent: false,
                        best_rssi: rssi,
                        best_src: src,
                        device_id,
                        frame: frame.to_vec(),
                    },
                );
                true
            }
        }
    }

    /// Resolve elapsed windows and purge expired entries.
    ///
    /// Each entry transitions to `sent` at most once; the returned
    /// relays carry the winning source for routing-table updates.
    pub fn poll_at(&self, now: Instant) -> Vec<Relay> {
        let mut entries = self.entries.lock();
        let mut relays = Vec::new();
        for entry in entries.values_mut() {
            if !entry.sent && now >= entry.deadline {
                entry.sent = true;
                relays.push(Relay {
                    frame: entry.frame.clone(),
                    src: entry.best_src,
                    rssi: entry.best_rssi,
                    device_id: entry.device_id,
                });
            }
        }
        entries.retain(|_, e| now.duration_since(e.first_seen) < self.retention);
        relays
    }

    /// Sightings currently tracked (sent or pending).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// [`ingest_at`](Self::ingest_at) against the system clock.
    pub fn ingest(
        &self,
        hash: u64,
        rssi: u8,
        src: SocketAddrV4,
        device_id: Option<u32>,
        frame: &[u8],
    ) -> bool {
        self.ingest_at(Instant::now(), hash, rssi, src, device_id, frame)
    }

    /// [`poll_at`](Self::poll_at) against the system clock.
    pub fn poll(&self) -> Vec<Relay> {
        self.poll_at(Instant::now())
    }
}
