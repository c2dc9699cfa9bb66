//! SLIP (Serial Line Internet Protocol) framing for the byte link.
//!
//! Implements RFC 1055 byte stuffing. Frames are written as
//! `END + escaped(payload) + END` and read back through a streaming decoder
//! because link reads return arbitrary slices of the byte stream.

use super::config::{SLIP_END, SLIP_ESC, SLIP_ESC_END, SLIP_ESC_ESC};
use super::error::{DfuError, DfuResult};

/// Wrap `data` in END delimiters, escaping END and ESC bytes.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(data.len() * 2 + 2);
    encoded.push(SLIP_END);

    for &byte in data {
        match byte {
            SLIP_END => encoded.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
            SLIP_ESC => encoded.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
            _ => encoded.push(byte),
        }
    }

    encoded.push(SLIP_END);
    encoded
}

/// Streaming SLIP decoder with a bounded frame buffer.
#[derive(Debug)]
pub struct SlipDecoder {
    buffer: Vec<u8>,
    escape_next: bool,
    in_frame: bool,
    max_frame_size: usize,
}

impl SlipDecoder {
    /// Create a decoder that rejects frames longer than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_frame_size.min(1024)),
            escape_next: false,
            in_frame: false,
            max_frame_size,
        }
    }

    /// Feed a byte to the decoder.
    ///
    /// Returns `Some(Ok(frame))` when an END closes a non-empty frame,
    /// `Some(Err(_))` on a bad escape or an oversized frame, `None` otherwise.
    /// After an error the decoder resynchronises on the next END byte.
    pub fn feed(&mut self, byte: u8) -> Option<DfuResult<Vec<u8>>> {
        if byte == SLIP_END {
            let complete = self.in_frame && !self.buffer.is_empty() && !self.escape_next;
            let frame = std::mem::take(&mut self.buffer);
            self.in_frame = true;
            self.escape_next = false;
            return complete.then_some(Ok(frame));
        }

        if !self.in_frame {
            // Garbage between frames.
            return None;
        }

        if self.buffer.len() >= self.max_frame_size {
            let size = self.buffer.len();
            self.reset();
            return Some(Err(DfuError::SlipBufferOverflow {
                size,
                max_size: self.max_frame_size,
            }));
        }

        if self.escape_next {
            self.escape_next = false;
            match byte {
                SLIP_ESC_END => self.buffer.push(SLIP_END),
                SLIP_ESC_ESC => self.buffer.push(SLIP_ESC),
                _ => {
                    self.reset();
                    return Some(Err(DfuError::InvalidSlipEscape));
                }
            }
        } else if byte == SLIP_ESC {
            self.escape_next = true;
        } else {
            self.buffer.push(byte);
        }

        None
    }

    /// Drop any partial frame and wait for the next END.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.escape_next = false;
        self.in_frame = false;
    }

    /// Whether a frame is currently being accumulated.
    pub fn in_frame(&self) -> bool {
        self.in_frame && !self.buffer.is_empty()
    }
}
