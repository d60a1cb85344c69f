// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Radio frame deframer: recovers discrete frames from the escaped,
//! length-prefixed serial byte stream.
//!
//! # Wire Format
//!
//! ```text
//! +--------+---------+---------+-----------+--------+
//! | start  | len_hi  | len_lo  | payload   | crc16  |
//! | (0xFD) | (esc)   | (esc)   | (esc...)  | (esc)  |
//! +--------+---------+---------+-----------+--------+
//! ```
//!
//! - `0xFD` starts a frame and unconditionally resets parsing state
//! - `0xFC` escapes the next byte: decoded value is `byte | 0x80`
//! - the 16-bit length (big-endian, escape-aware) counts decoded
//!   payload bytes; `length + 2` decoded bytes follow the length field
//! - the trailing CRC-16 covers start byte, length and payload
//!
//! The deframer emits the *decoded frame image* (`0xFD len payload crc`
//! with escapes resolved). With `decode_escaped` disabled the escape
//! markers are retained verbatim in the output while length tracking
//! stays escape-aware; that mode feeds consumers that need the raw
//! byte stream unmodified.
//!
//! Malformed or truncated input never raises an error: the engine
//! waits for the next start marker and resynchronizes.

use super::crc::{crc16, verify_crc16};
use crate::config::{FRAME_BUF_SIZE, MAX_PAYLOAD};

/// Start-of-frame marker. Never appears escaped inside a frame.
pub const FRAME_START: u8 = 0xFD;

/// Escape marker. The following byte decodes as `byte | 0x80`.
pub const FRAME_ESCAPE: u8 = 0xFC;

/// Error during frame encoding or inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds [`MAX_PAYLOAD`].
    PayloadTooLarge,
    /// Frame image too short to carry header and checksum.
    TooShort,
    /// Start byte or length field inconsistent with the image.
    Malformed,
    /// Trailing checksum does not match the frame body.
    CrcMismatch,
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge => write!(f, "payload exceeds maximum frame size"),
            Self::TooShort => write!(f, "frame image too short"),
            Self::Malformed => write!(f, "malformed frame image"),
            Self::CrcMismatch => write!(f, "frame checksum mismatch"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Deframer parsing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeframerState {
    /// Waiting for a start marker; all other bytes are ignored.
    Idle,
    /// Start marker seen, expecting the high length byte.
    LengthHigh,
    /// Expecting the low length byte.
    LengthLow,
    /// Accumulating `length + 2` decoded payload/checksum bytes.
    Receiving,
}

/// Streaming frame parser. One instance per serial channel.
///
/// Bytes are pushed via [`feed`](Self::feed) or
/// [`feed_byte`](Self::feed_byte); every completed frame is handed to
/// the sink closure as a borrowed slice valid only for the duration of
/// the call (consumers copy what they keep).
pub struct Deframer {
    buf: Box<[u8; FRAME_BUF_SIZE]>,
    cursor: usize,
    /// Decoded payload length announced by the length field.
    frame_len: usize,
    /// Decoded payload + checksum bytes still expected.
    remaining: usize,
    escape: bool,
    state: DeframerState,
    decode_escaped: bool,
}

impl Deframer {
    /// Create a deframer. `decode_escaped` resolves escape sequences in
    /// the output; disable it to retain the raw byte stream verbatim.
    #[must_use]
    pub fn new(decode_escaped: bool) -> Self {
        Self {
            buf: Box::new([0u8; FRAME_BUF_SIZE]),
            cursor: 0,
            frame_len: 0,
            remaining: 0,
            escape: false,
            state: DeframerState::Idle,
            decode_escaped,
        }
    }

    /// Current parsing state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> DeframerState {
        self.state
    }

    /// Discard any partial frame and return to `Idle`.
    ///
    /// Called after a transport-reported overrun/framing error.
    pub fn flush(&mut self) {
        self.cursor = 0;
        self.frame_len = 0;
        self.remaining = 0;
        self.escape = false;
        self.state = DeframerState::Idle;
    }

    /// Feed a block of bytes, invoking `sink` once per completed frame.
    ///
    /// Fast path: while receiving payload with no escape pending, the
    /// block is scanned for the next marker byte and everything before
    /// it is bulk-copied. Output is byte-identical to feeding one byte
    /// at a time.
    pub fn feed(&mut self, chunk: &[u8], sink: &mut dyn FnMut(&[u8])) {
        let mut i = 0;
        while i < chunk.len() {
            match self.state {
                DeframerState::Idle => {
                    // skip straight to the next start marker
                    match chunk[i..].iter().position(|&b| b == FRAME_START) {
                        Some(k) => {
                            i += k;
                            self.feed_byte(chunk[i], sink);
                            i += 1;
                        }
                        None => return,
                    }
                }
                DeframerState::Receiving if !self.escape => {
                    let space = FRAME_BUF_SIZE - self.cursor;
                    if space == 0 {
                        self.force_complete(sink);
                        continue;
                    }
                    let n = self.remaining.min(chunk.len() - i).min(space);
                    let window = &chunk[i..i + n];
                    match window
                        .iter()
                        .position(|&b| b == FRAME_START || b == FRAME_ESCAPE)
                    {
                        Some(0) => {
                            self.feed_byte(chunk[i], sink);
                            i += 1;
                        }
                        Some(k) => {
                            self.copy_run(&chunk[i..i + k]);
                            i += k;
                        }
                        None => {
                            self.copy_run(window);
                            i += n;
                            if self.remaining == 0 {
                                self.emit(sink);
                            }
                        }
                    }
                }
                _ => {
                    self.feed_byte(chunk[i], sink);
                    i += 1;
                }
            }
        }
    }

    /// Feed a single byte through the full state machine.
    pub fn feed_byte(&mut self, b: u8, sink: &mut dyn FnMut(&[u8])) {
        if b == FRAME_START {
            // start marker resets parsing unconditionally
            self.flush();
            self.store(b);
            self.state = DeframerState::LengthHigh;
            return;
        }

        if self.state == DeframerState::Idle {
            return;
        }

        if self.cursor == FRAME_BUF_SIZE {
            // defensive bound: emit what accumulated, current byte is lost
            self.force_complete(sink);
            return;
        }

        if b == FRAME_ESCAPE && !self.escape {
            self.escape = true;
            if !self.decode_escaped {
                // raw mode keeps the marker; it carries no decoded value
                self.store(b);
            }
            return;
        }

        let decoded = if self.escape {
            self.escape = false;
            b | 0x80
        } else {
            b
        };
        let stored = if self.decode_escaped { decoded } else { b };

        match self.state {
            DeframerState::LengthHigh => {
                self.frame_len = usize::from(decoded) << 8;
                self.store(stored);
                self.state = DeframerState::LengthLow;
            }
            DeframerState::LengthLow => {
                self.frame_len |= usize::from(decoded);
                self.store(stored);
                if self.frame_len > MAX_PAYLOAD {
                    log::warn!(
                        "[FRAME] length {} exceeds maximum {}, waiting for resync",
                        self.frame_len,
                        MAX_PAYLOAD
                    );
                    self.flush();
                } else {
                    self.remaining = self.frame_len + 2;
                    self.state = DeframerState::Receiving;
                }
            }
            DeframerState::Receiving => {
                self.store(stored);
                self.remaining = self.remaining.saturating_sub(1);
                if self.remaining == 0 {
                    self.emit(sink);
                }
            }
            DeframerState::Idle => {}
        }
    }

    /// Bulk-copy a run of literal payload bytes (no markers inside).
    fn copy_run(&mut self, run: &[u8]) {
        self.buf[self.cursor..self.cursor + run.len()].copy_from_slice(run);
        self.cursor += run.len();
        self.remaining -= run.len();
    }

    fn store(&mut self, b: u8) {
        self.buf[self.cursor] = b;
        self.cursor += 1;
    }

    /// Emit whatever has accumulated. Defensive bound against buffer
    /// overflow, not a protocol success.
    fn force_complete(&mut self, sink: &mut dyn FnMut(&[u8])) {
        log::warn!(
            "[FRAME] buffer full after {} bytes, forcing frame completion",
            self.cursor
        );
        self.emit(sink);
    }

    fn emit(&mut self, sink: &mut dyn FnMut(&[u8])) {
        if self.cursor > 0 {
            sink(&self.buf[..self.cursor]);
        }
        self.flush();
    }
}

/// Build the decoded frame image for `payload`:
/// `0xFD len_hi len_lo payload crc_hi crc_lo`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge);
    }
    let mut image = Vec::with_capacity(payload.len() + 5);
    image.push(FRAME_START);
    image.push((payload.len() >> 8) as u8);
    image.push(payload.len() as u8);
    image.extend_from_slice(payload);
    let crc = crc16(&image);
    image.push((crc >> 8) as u8);
    image.push(crc as u8);
    Ok(image)
}

/// Convert a decoded frame image to its escaped wire form.
///
/// Every `0xFC`/`0xFD` after the start byte becomes `0xFC, b & 0x7F`.
#[must_use]
pub fn escape_frame(image: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(image.len() + 8);
    for (i, &b) in image.iter().enumerate() {
        if i > 0 && (b == FRAME_START || b == FRAME_ESCAPE) {
            wire.push(FRAME_ESCAPE);
            wire.push(b & 0x7F);
        } else {
            wire.push(b);
        }
    }
    wire
}

/// Validate a decoded frame image and borrow its payload.
pub fn frame_payload(image: &[u8]) -> Result<&[u8], FrameError> {
    if image.len() < 5 {
        return Err(FrameError::TooShort);
    }
    if image[0] != FRAME_START {
        return Err(FrameError::Malformed);
    }
    let len = usize::from(image[1]) << 8 | usize::from(image[2]);
    if len != image.len() - 5 {
        return Err(FrameError::Malformed);
    }
    let body = &image[..image.len() - 2];
    let expected = u16::from(image[image.len() - 2]) << 8 | u16::from(image[image.len() - 1]);
    if !verify_crc16(body, expected) {
        return Err(FrameError::CrcMismatch);
    }
    Ok(&image[3..image.len() - 2])
}
