// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame codec for the radio serial link.
//!
//! Converts the escaped, length-prefixed serial byte stream into
//! decoded frame images and back. No knowledge of network or
//! replication concerns lives here.
//!
//! # Modules
//!
//! - `crc` - CRC-16/CCITT-FALSE checksums (frame trailers + CCU messages)
//! - `deframer` - streaming parser, encoder and escape handling

pub mod crc;
pub mod deframer;

pub use crc::{crc16, crc16_update, verify_crc16};
pub use deframer::{
    encode_frame, escape_frame, frame_payload, Deframer, DeframerState, FrameError, FRAME_ESCAPE,
    FRAME_START,
};
