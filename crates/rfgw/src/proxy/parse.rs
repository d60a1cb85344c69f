// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lenient parser for the well-known radio sub-protocol.
//!
//! Frame payloads of the recognized sub-protocol look like:
//!
//! ```text
//! +-----+-----+-------+------+--------+--------+------+------+
//! | len | cnt | flags | type | src:3  | dst:3  | body | rssi |
//! +-----+-----+-------+------+--------+--------+------+------+
//! ```
//!
//! where `len` counts every byte after itself and the trailing byte is
//! the receiver-reported signal quality. Recognition is deliberately
//! lenient: anything that does not match falls back to whole-payload
//! hashing for dedup and broadcast for routing. Mis-delivery would
//! break reliability, so correctness wins over precision.

use crate::framing::frame_payload;

/// Minimum recognizable payload: len cnt flags type src dst + rssi.
const MIN_PARSEABLE: usize = 11;

/// Fields extracted from a recognized radio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioFrameInfo {
    /// 24-bit originating device id.
    pub src_id: u32,
    /// 24-bit destination device id.
    pub dst_id: u32,
    /// Message counter byte.
    pub seq: u8,
    /// Receiver-reported signal quality, higher is better.
    pub rssi: u8,
}

/// Try to parse a frame payload as the recognized sub-protocol.
#[must_use]
pub fn parse_radio_payload(payload: &[u8]) -> Option<RadioFrameInfo> {
    if payload.len() < MIN_PARSEABLE {
        return None;
    }
    if usize::from(payload[0]) != payload.len() - 1 {
        return None;
    }
    Some(RadioFrameInfo {
        src_id: u32::from(payload[4]) << 16 | u32::from(payload[5]) << 8 | u32::from(payload[6]),
        dst_id: u32::from(payload[7]) << 16 | u32::from(payload[8]) << 8 | u32::from(payload[9]),
        seq: payload[1],
        rssi: payload[payload.len() - 1],
    })
}

/// Extract routing/dedup info from a decoded frame image, if possible.
#[must_use]
pub fn parse_frame_image(image: &[u8]) -> Option<RadioFrameInfo> {
    frame_payload(image).ok().and_then(parse_radio_payload)
}

/// 64-bit FNV-1a, the dedup hash.
#[must_use]
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Dedup key for a frame image.
///
/// For a recognized sub-protocol the hash covers the semantic content
/// only - counter through body, excluding the locally measured signal
/// byte - so copies of the same radio event heard by different
/// gateways collide. Otherwise the whole validated payload (or, for
/// an unvalidatable image, the image itself) is hashed. Source
/// identity is deliberately NOT part of the key: identical payloads
/// from different devices are indistinguishable to the dedup layer's
/// purpose, which is suppressing redundant relays of the same event.
#[must_use]
pub fn semantic_hash(image: &[u8]) -> u64 {
    match frame_payload(image) {
        Ok(payload) => {
            if parse_radio_payload(payload).is_some() {
                fnv1a(&payload[1..payload.len() - 1])
            } else {
                fnv1a(payload)
            }
        }
        Err(_) => fnv1a(image),
    }
}

/// Build a recognizable payload for tests: src/dst ids, counter, body, rssi.
#[cfg(test)]
pub(crate) fn radio_payload(src: u32, dst: u32, cnt: u8, body: &[u8], rssi: u8) -> Vec<u8> {
    let mut p = vec![0u8; 10];
    p[1] = cnt;
    p[2] = 0x86; // flags
    p[3] = 0x10; // type
    p[4..7].copy_from_slice(&src.to_be_bytes()[1..]);
    p[7..10].copy_from_slice(&dst.to_be_bytes()[1..]);
    p.extend_from_slice(body);
    p.push(rssi);
    p[0] = (p.len() - 1) as u8;
    p
}
