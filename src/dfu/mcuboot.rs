//! MCUboot image header and TLV trailer parsing.
//!
//! A signed MCUboot image is laid out as:
//!
//! ```text
//! header (hdr_size) | body (img_size) | protected TLVs | unprotected TLVs
//! ```
//!
//! The SHA-256 TLV in the unprotected area covers the header, the body and
//! the protected TLV block.

use std::fmt;

use super::error::{DfuError, DfuResult};
use super::package::ImageHash;

/// Little-endian `ih_magic` value of an MCUboot image.
pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

/// Size of the fixed `image_header` structure.
pub const IMAGE_HEADER_SIZE: usize = 32;

/// Magic of the unprotected TLV info block.
pub const TLV_INFO_MAGIC: u16 = 0x6907;

/// Magic of the protected TLV info block.
pub const TLV_PROT_INFO_MAGIC: u16 = 0x6908;

/// TLV type carrying the SHA-256 image digest.
pub const TLV_SHA256: u16 = 0x10;

const TLV_INFO_SIZE: usize = 4;
const TLV_ENTRY_HEADER_SIZE: usize = 4;

/// Semantic version stored in the image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

impl fmt::Display for ImageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)?;
        if self.build_num != 0 {
            write!(f, "+{}", self.build_num)?;
        }
        Ok(())
    }
}

/// Decoded `image_header`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub load_addr: u32,
    pub hdr_size: u16,
    pub protect_tlv_size: u16,
    pub img_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
}

impl ImageHeader {
    pub fn parse(data: &[u8]) -> DfuResult<Self> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(DfuError::invalid_format(format!(
                "MCUboot header truncated: {} bytes",
                data.len()
            )));
        }
        let magic = read_u32(data, 0);
        if magic != IMAGE_MAGIC {
            return Err(DfuError::invalid_format(format!(
                "bad MCUboot magic 0x{:08x}",
                magic
            )));
        }

        let header = Self {
            load_addr: read_u32(data, 4),
            hdr_size: read_u16(data, 8),
            protect_tlv_size: read_u16(data, 10),
            img_size: read_u32(data, 12),
            flags: read_u32(data, 16),
            version: ImageVersion {
                major: data[20],
                minor: data[21],
                revision: read_u16(data, 22),
                build_num: read_u32(data, 24),
            },
        };

        if (header.hdr_size as usize) < IMAGE_HEADER_SIZE {
            return Err(DfuError::invalid_format(format!(
                "MCUboot hdr_size {} smaller than header",
                header.hdr_size
            )));
        }
        Ok(header)
    }

    /// Offset of the first TLV block (protected if present).
    fn tlv_offset(&self) -> usize {
        self.hdr_size as usize + self.img_size as usize
    }
}

/// A validated MCUboot image.
#[derive(Debug, Clone)]
pub struct McubootImage {
    pub header: ImageHeader,
    pub hash: ImageHash,
}

/// Parse an MCUboot image and check its SHA-256 TLV against the content.
pub fn parse_image(data: &[u8]) -> DfuResult<McubootImage> {
    let header = ImageHeader::parse(data)?;
    let protected_end = header.tlv_offset() + header.protect_tlv_size as usize;

    if header.protect_tlv_size > 0 {
        let magic = read_info_magic(data, header.tlv_offset())?;
        if magic != TLV_PROT_INFO_MAGIC {
            return Err(DfuError::invalid_format(format!(
                "bad protected TLV magic 0x{:04x}",
                magic
            )));
        }
    }

    let declared = find_sha256_tlv(data, protected_end)?;
    let actual = ImageHash::of(&data[..protected_end]);
    if declared != actual {
        return Err(DfuError::HashMismatch {
            slot: 0,
            expected: declared.to_hex(),
            actual: actual.to_hex(),
        });
    }

    Ok(McubootImage {
        header,
        hash: declared,
    })
}

fn read_info_magic(data: &[u8], offset: usize) -> DfuResult<u16> {
    if data.len() < offset + TLV_INFO_SIZE {
        return Err(DfuError::invalid_format("MCUboot TLV area truncated"));
    }
    Ok(read_u16(data, offset))
}

fn find_sha256_tlv(data: &[u8], info_offset: usize) -> DfuResult<ImageHash> {
    let magic = read_info_magic(data, info_offset)?;
    if magic != TLV_INFO_MAGIC {
        return Err(DfuError::invalid_format(format!(
            "bad TLV info magic 0x{:04x}",
            magic
        )));
    }

    let tlv_total = read_u16(data, info_offset + 2) as usize;
    let end = info_offset + tlv_total;
    if tlv_total < TLV_INFO_SIZE || end > data.len() {
        return Err(DfuError::invalid_format("MCUboot TLV area truncated"));
    }

    let mut offset = info_offset + TLV_INFO_SIZE;
    while offset + TLV_ENTRY_HEADER_SIZE <= end {
        let tlv_type = read_u16(data, offset);
        let tlv_len = read_u16(data, offset + 2) as usize;
        let value_start = offset + TLV_ENTRY_HEADER_SIZE;
        if value_start + tlv_len > end {
            return Err(DfuError::invalid_format("MCUboot TLV entry overruns area"));
        }
        if tlv_type == TLV_SHA256 {
            return ImageHash::from_slice(&data[value_start..value_start + tlv_len]);
        }
        offset = value_start + tlv_len;
    }

    Err(DfuError::invalid_format("MCUboot image has no SHA-256 TLV"))
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
