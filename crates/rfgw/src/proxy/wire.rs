// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sibling datagram format for fleet replication.
//!
//! # Wire Format
//!
//! ```text
//! +------+--------+--------+-----+------+---------+--------------+---------+---------+
//! | type | src_id | dst_id | seq | rssi | quality | timestamp_ms | payload | payload |
//! | (u8) | (u32)  | (u32)  |(u8) | (u8) | (u8)    | (u64)        | len(u16)| (bytes) |
//! +------+--------+--------+-----+------+---------+--------------+---------+---------+
//! ```
//!
//! All multi-byte fields big-endian. One header plus the raw frame
//! image per datagram, no batching.

/// Wrapped radio frame, slave -> master.
pub const SIBLING_FRAME: u8 = 0;

/// Wrapped CCU command, master -> slave.
pub const SIBLING_COMMAND: u8 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 22;

/// Error decoding a sibling datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header.
    TooShort,
    /// Announced payload length disagrees with the datagram size.
    LengthMismatch,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "sibling datagram shorter than header"),
            Self::LengthMismatch => write!(f, "sibling payload length mismatch"),
        }
    }
}

impl std::error::Error for WireError {}

/// Decoded sibling datagram header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingHeader {
    /// [`SIBLING_FRAME`] or [`SIBLING_COMMAND`].
    pub msg_type: u8,
    /// Originating device id, 0 when the payload was not parseable.
    pub src_id: u32,
    /// Destination device id, 0 when unknown.
    pub dst_id: u32,
    /// Sub-protocol sequence/counter byte, 0 when unknown.
    pub seq: u8,
    /// Signal quality of the local reception, higher is better.
    pub rssi: u8,
    /// 1 when `rssi`/ids were extracted from a recognized sub-protocol.
    pub quality: u8,
    /// Sender's monotonic clock at capture, milliseconds.
    pub timestamp_ms: u64,
}

/// Encode a sibling datagram.
#[must_use]
pub fn encode_sibling(header: &SiblingHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(header.msg_type);
    out.extend_from_slice(&header.src_id.to_be_bytes());
    out.extend_from_slice(&header.dst_id.to_be_bytes());
    out.push(header.seq);
    out.push(header.rssi);
    out.push(header.quality);
    out.extend_from_slice(&header.timestamp_ms.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decode a sibling datagram into header and borrowed payload.
pub fn decode_sibling(data: &[u8]) -> Result<(SiblingHeader, &[u8]), WireError> {
    if data.len() < HEADER_LEN {
        return Err(WireError::TooShort);
    }
    let payload_len = usize::from(u16::from_be_bytes([data[20], data[21]]));
    if data.len() != HEADER_LEN + payload_len {
        return Err(WireError::LengthMismatch);
    }
    let header = SiblingHeader {
        msg_type: data[0],
        src_id: u32::from_be_bytes([data[1], data[2], data[3], data[4]]),
        dst_id: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
        seq: data[9],
        rssi: data[10],
        quality: data[11],
        timestamp_ms: u64::from_be_bytes([
            data[12], data[13], data[14], data[15], data[16], data[17], data[18], data[19],
        ]),
    };
    Ok((header, &data[HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = SiblingHeader {
            msg_type: SIBLING_FRAME,
            src_id: 0x00AB_CDEF,
            dst_id: 0x0012_3456,
            seq: 42,
            rssi: 200,
            quality: 1,
            timestamp_ms: 123_456_789,
        };
        let payload = [0xFD, 0x00, 0x01, 0x55, 0xAA, 0xBB];
        let wire = encode_sibling(&header, &payload);
        assert_eq!(wire.len(), HEADER_LEN + payload.len());

        let (decoded, body) = decode_sibling(&wire).expect("decode");
        assert_eq!(decoded, header);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let header = SiblingHeader {
            msg_type: SIBLING_COMMAND,
            src_id: 1,
            dst_id: 2,
            seq: 3,
            rssi: 4,
            quality: 0,
            timestamp_ms: 5,
        };
        let wire = encode_sibling(&header, &[9, 9, 9]);

        assert_eq!(decode_sibling(&wire[..10]), Err(WireError::TooShort));
        assert_eq!(
            decode_sibling(&wire[..wire.len() - 1]),
            Err(WireError::LengthMismatch)
        );
    }

    #[test]
    fn test_empty_payload() {
        let header = SiblingHeader {
            msg_type: SIBLING_FRAME,
            src_id: 0,
            dst_id: 0,
            seq: 0,
            rssi: 0,
            quality: 0,
            timestamp_ms: 0,
        };
        let wire = encode_sibling(&header, &[]);
        let (_, body) = decode_sibling(&wire).expect("decode");
        assert!(body.is_empty());
    }
}
