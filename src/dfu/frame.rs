//! Frame encoding for the DFU byte link.
//!
//! Every request and response travels as one SLIP frame:
//!
//! ```text
//! END | op | seq | status | len_lo | len_hi | body... | crc_lo | crc_hi | END
//! ```
//!
//! The CRC is CRC-16/XMODEM over everything before it. Responses repeat the
//! request opcode with [`RESPONSE_FLAG`] set and echo its sequence number.

use super::config::MAX_CHUNK_SIZE;
use super::error::{DfuError, DfuResult};
use super::slip;

/// Bytes in the fixed frame header (op, seq, status, len).
pub const FRAME_HEADER_LEN: usize = 5;

/// Bytes in the CRC trailer.
pub const FRAME_CRC_LEN: usize = 2;

/// Bytes preceding the data in a chunk write body (slot, offset, total).
pub const CHUNK_BODY_HEADER_LEN: usize = 9;

/// Largest decoded frame the link will accept.
pub const MAX_FRAME_SIZE: usize =
    FRAME_HEADER_LEN + CHUNK_BODY_HEADER_LEN + MAX_CHUNK_SIZE + FRAME_CRC_LEN;

/// High bit marking a response opcode.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Status byte for a successful response.
pub const STATUS_OK: u8 = 0x00;

/// Image hash length carried by test/confirm commands.
pub const HASH_LEN: usize = 32;

/// DFU frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Write one chunk of an image at an offset.
    WriteChunk = 0x01,
    /// Mark an uploaded image for a trial boot.
    TestImage = 0x02,
    /// Make an image permanent.
    ConfirmImage = 0x03,
    /// Erase the application settings partition.
    EraseAppSettings = 0x04,
    /// Reboot the device into the bootloader swap.
    Reset = 0x05,
}

impl Opcode {
    /// Parse an opcode byte, ignoring the response flag.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte & !RESPONSE_FLAG {
            0x01 => Some(Opcode::WriteChunk),
            0x02 => Some(Opcode::TestImage),
            0x03 => Some(Opcode::ConfirmImage),
            0x04 => Some(Opcode::EraseAppSettings),
            0x05 => Some(Opcode::Reset),
            _ => None,
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub is_response: bool,
    pub seq: u8,
    pub status: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn request(opcode: Opcode, seq: u8, body: Vec<u8>) -> Self {
        Self {
            opcode,
            is_response: false,
            seq,
            status: STATUS_OK,
            body,
        }
    }

    pub fn response(opcode: Opcode, seq: u8, status: u8, body: Vec<u8>) -> Self {
        Self {
            opcode,
            is_response: true,
            seq,
            status,
            body,
        }
    }

    /// Serialize header, body and CRC (without SLIP framing).
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.body.len() as u16;
        let op = if self.is_response {
            self.opcode as u8 | RESPONSE_FLAG
        } else {
            self.opcode as u8
        };

        let mut data = Vec::with_capacity(FRAME_HEADER_LEN + self.body.len() + FRAME_CRC_LEN);
        data.push(op);
        data.push(self.seq);
        data.push(self.status);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&self.body);

        let crc = calc_crc16(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    /// Serialize and SLIP-encode, ready to write to the link.
    pub fn encode(&self) -> Vec<u8> {
        slip::encode(&self.to_bytes())
    }

    /// Parse a frame from SLIP-decoded bytes, verifying length and CRC.
    pub fn decode(data: &[u8]) -> DfuResult<Self> {
        if data.len() < FRAME_HEADER_LEN + FRAME_CRC_LEN {
            return Err(DfuError::IncompleteSlipFrame);
        }

        let (content, crc_bytes) = data.split_at(data.len() - FRAME_CRC_LEN);
        let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let actual = calc_crc16(content);
        if expected != actual {
            return Err(DfuError::CrcMismatch { expected, actual });
        }

        let body_len = u16::from_le_bytes([content[3], content[4]]) as usize;
        if content.len() != FRAME_HEADER_LEN + body_len {
            return Err(DfuError::IncompleteSlipFrame);
        }

        let opcode = Opcode::from_byte(content[0]).ok_or_else(|| DfuError::UnexpectedResponse {
            reason: format!("unknown opcode 0x{:02X}", content[0]),
        })?;

        Ok(Self {
            opcode,
            is_response: content[0] & RESPONSE_FLAG != 0,
            seq: content[1],
            status: content[2],
            body: content[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

/// CRC-16/XMODEM as used by serial SMP transports.
pub fn calc_crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

// ============================================================================
// Frame Bodies
// ============================================================================

/// Build the body of a `WriteChunk` request.
///
/// Layout: `slot(1) | offset(4, LE) | total_len(4, LE) | data`
pub fn build_chunk_body(slot: u8, offset: u32, total_len: u32, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(CHUNK_BODY_HEADER_LEN + data.len());
    body.push(slot);
    body.extend_from_slice(&offset.to_le_bytes());
    body.extend_from_slice(&total_len.to_le_bytes());
    body.extend_from_slice(data);
    body
}

/// Decoded `WriteChunk` request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWriteBody {
    pub slot: u8,
    pub offset: u32,
    pub total_len: u32,
    pub data: Vec<u8>,
}

impl ChunkWriteBody {
    pub fn parse(body: &[u8]) -> DfuResult<Self> {
        if body.len() < CHUNK_BODY_HEADER_LEN {
            return Err(DfuError::IncompleteSlipFrame);
        }
        Ok(Self {
            slot: body[0],
            offset: read_u32_le(&body[1..5]),
            total_len: read_u32_le(&body[5..9]),
            data: body[CHUNK_BODY_HEADER_LEN..].to_vec(),
        })
    }
}

/// Body of a `WriteChunk` response: the echoed slot and offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAckBody {
    pub slot: u8,
    pub offset: u32,
}

impl ChunkAckBody {
    pub fn to_bytes(self) -> Vec<u8> {
        let mut body = Vec::with_capacity(5);
        body.push(self.slot);
        body.extend_from_slice(&self.offset.to_le_bytes());
        body
    }

    pub fn parse(body: &[u8]) -> DfuResult<Self> {
        if body.len() != 5 {
            return Err(DfuError::UnexpectedResponse {
                reason: format!("chunk ack body of {} bytes", body.len()),
            });
        }
        Ok(Self {
            slot: body[0],
            offset: read_u32_le(&body[1..5]),
        })
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
