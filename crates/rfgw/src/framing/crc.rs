// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CRC-16/CCITT-FALSE checksum shared by frame trailers and CCU link messages.
//!
//! The same algorithm runs on both ends of every link (radio module,
//! CCU, sibling gateways), so the variant is a wire-compatibility
//! requirement and must never change per message.
//!
//! # Parameters (CRC-16/CCITT-FALSE)
//!
//! | Parameter | Value |
//! |-----------|-------|
//! | Polynomial | 0x1021 |
//! | Init | 0xFFFF |
//! | RefIn | false |
//! | RefOut | false |
//! | XorOut | 0x0000 |

/// CRC-16/CCITT-FALSE polynomial.
const POLY: u16 = 0x1021;

/// Initial value for CRC calculation.
const INIT: u16 = 0xFFFF;

/// Precomputed lookup table, generated at compile time.
const CRC_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Calculate the CRC-16/CCITT-FALSE checksum of `data`.
#[inline]
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(INIT, data)
}

/// Update an existing CRC with more data (streaming calculation).
#[inline]
#[must_use]
pub fn crc16_update(crc: u16, data: &[u8]) -> u16 {
    let mut crc = crc;
    for &byte in data {
        let index = ((crc >> 8) ^ u16::from(byte)) as usize;
        crc = (crc << 8) ^ CRC_TABLE[index];
    }
    crc
}

/// Verify `data` against an expected CRC.
#[inline]
#[must_use]
pub fn verify_crc16(data: &[u8], expected: u16) -> bool {
    crc16(data) == expected
}
