//! Firmware package parser.
//!
//! Accepts either a zip package:
//! - manifest.json - Package metadata and per-image digests
//! - one binary per image slot, named by the manifest
//!
//! or a bare MCUboot image, which becomes a single-slot package. Parsing is
//! atomic: any malformed entry or digest mismatch fails the whole package.

use std::collections::HashSet;
use std::fmt;
use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::{DfuError, DfuResult};
use super::mcuboot;

/// Manifest format version understood by this parser.
pub const SUPPORTED_FORMAT_VERSION: u32 = 1;

/// Name of the manifest entry inside a zip package.
pub const MANIFEST_FILE: &str = "manifest.json";

const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// SHA-256 digest of an image.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHash([u8; 32]);

impl ImageHash {
    /// Hash `data` with SHA-256.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> DfuResult<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            DfuError::invalid_format(format!("digest must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// Parse a 64-character hex digest (case-insensitive).
    pub fn from_hex(hex: &str) -> DfuResult<Self> {
        let hex = hex.trim();
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(DfuError::invalid_format(format!(
                "digest '{}' is not 64 hex characters",
                hex
            )));
        }

        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| {
                DfuError::invalid_format(format!("digest '{}' is not valid hex", hex))
            })?;
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageHash({})", self.to_hex())
    }
}

impl fmt::Display for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One independently uploadable firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSlot {
    slot_index: u32,
    image_bytes: Vec<u8>,
    expected_hash: ImageHash,
    version: Option<String>,
}

impl ImageSlot {
    /// Build a slot from raw bytes, deriving its digest.
    pub fn from_bytes(slot_index: u32, image_bytes: Vec<u8>) -> DfuResult<Self> {
        if image_bytes.is_empty() {
            return Err(DfuError::invalid_format(format!(
                "image {} is empty",
                slot_index
            )));
        }
        let expected_hash = ImageHash::of(&image_bytes);
        Ok(Self {
            slot_index,
            image_bytes,
            expected_hash,
            version: None,
        })
    }

    pub fn slot_index(&self) -> u32 {
        self.slot_index
    }

    pub fn image_bytes(&self) -> &[u8] {
        &self.image_bytes
    }

    pub fn len(&self) -> usize {
        self.image_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_bytes.is_empty()
    }

    pub fn expected_hash(&self) -> ImageHash {
        self.expected_hash
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Recompute the digest and compare against the declared one.
    pub fn verify(&self) -> DfuResult<()> {
        let actual = ImageHash::of(&self.image_bytes);
        if actual != self.expected_hash {
            return Err(DfuError::HashMismatch {
                slot: self.slot_index,
                expected: self.expected_hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

/// Container the package was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerKind {
    /// Zip archive with a manifest.json.
    Zip,
    /// A single bare MCUboot image.
    McubootImage,
}

/// A validated, immutable set of images ready to upload.
#[derive(Debug, Clone)]
pub struct ImagePackage {
    kind: ContainerKind,
    name: Option<String>,
    slots: Vec<ImageSlot>,
}

impl ImagePackage {
    /// Assemble a package from already-built slots.
    pub fn from_slots(slots: Vec<ImageSlot>) -> DfuResult<Self> {
        Self::new(ContainerKind::Zip, None, slots)
    }

    fn new(kind: ContainerKind, name: Option<String>, slots: Vec<ImageSlot>) -> DfuResult<Self> {
        if slots.is_empty() {
            return Err(DfuError::invalid_format("package contains no images"));
        }
        let mut seen = HashSet::new();
        for slot in &slots {
            if !seen.insert(slot.slot_index) {
                return Err(DfuError::invalid_format(format!(
                    "duplicate image index {}",
                    slot.slot_index
                )));
            }
        }
        Ok(Self { kind, name, slots })
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Images in upload order.
    pub fn slots(&self) -> &[ImageSlot] {
        &self.slots
    }

    /// Sum of all image lengths.
    pub fn total_len(&self) -> usize {
        self.slots.iter().map(ImageSlot::len).sum()
    }

    /// Re-check every slot's digest.
    pub fn verify(&self) -> DfuResult<()> {
        self.slots.iter().try_for_each(ImageSlot::verify)
    }
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    files: Vec<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestVersion {
    #[serde(rename = "format-version")]
    format_version: u32,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    image_index: u32,
    file: String,
    size: usize,
    sha256: String,
    version: Option<String>,
}

/// Parse a firmware package from raw bytes.
///
/// The container kind is sniffed from the leading magic bytes.
pub fn parse(raw: &[u8]) -> DfuResult<ImagePackage> {
    if raw.starts_with(&ZIP_MAGIC) {
        parse_zip(raw)
    } else if raw.len() >= 4 && raw[..4] == mcuboot::IMAGE_MAGIC.to_le_bytes() {
        parse_mcuboot(raw)
    } else {
        Err(DfuError::invalid_format(
            "unrecognised container (expected zip package or MCUboot image)",
        ))
    }
}

fn parse_mcuboot(raw: &[u8]) -> DfuResult<ImagePackage> {
    let image = mcuboot::parse_image(raw)?;
    // The TLV digest excludes the trailer; the slot digest covers every uploaded byte.
    let slot = ImageSlot {
        slot_index: 0,
        image_bytes: raw.to_vec(),
        expected_hash: ImageHash::of(raw),
        version: Some(image.header.version.to_string()),
    };
    ImagePackage::new(ContainerKind::McubootImage, None, vec![slot])
}

fn parse_zip(raw: &[u8]) -> DfuResult<ImagePackage> {
    let mut archive = zip::ZipArchive::new(Cursor::new(raw))?;
    let manifest_json = read_manifest(&mut archive)?;

    // Version gate runs before the rest of the manifest is interpreted.
    let version: ManifestVersion = serde_json::from_str(&manifest_json)?;
    if version.format_version != SUPPORTED_FORMAT_VERSION {
        return Err(DfuError::UnsupportedVersion {
            version: version.format_version,
        });
    }

    let manifest: RawManifest = serde_json::from_str(&manifest_json)?;
    let mut slots = Vec::with_capacity(manifest.files.len());

    for entry in manifest.files {
        let expected_hash = ImageHash::from_hex(&entry.sha256)?;
        let image_bytes = read_image_from_zip(&mut archive, &entry)?;

        if image_bytes.is_empty() {
            return Err(DfuError::invalid_format(format!(
                "image {} ({}) is empty",
                entry.image_index, entry.file
            )));
        }
        if image_bytes.len() != entry.size {
            return Err(size_mismatch(&entry, image_bytes.len() as u64));
        }

        let slot = ImageSlot {
            slot_index: entry.image_index,
            image_bytes,
            expected_hash,
            version: entry.version,
        };
        slot.verify()?;
        slots.push(slot);
    }

    ImagePackage::new(ContainerKind::Zip, manifest.name, slots)
}

/// Read manifest.json from the archive.
fn read_manifest(archive: &mut zip::ZipArchive<Cursor<&[u8]>>) -> DfuResult<String> {
    let mut manifest_file = archive
        .by_name(MANIFEST_FILE)
        .map_err(|_| DfuError::invalid_format(format!("missing {}", MANIFEST_FILE)))?;

    let mut contents = String::new();
    manifest_file
        .read_to_string(&mut contents)
        .map_err(|e| DfuError::invalid_format(format!("unreadable {}: {}", MANIFEST_FILE, e)))?;
    Ok(contents)
}

fn size_mismatch(entry: &ManifestFile, actual: u64) -> DfuError {
    DfuError::invalid_format(format!(
        "image {} ({}) is {} bytes, manifest says {}",
        entry.image_index, entry.file, actual, entry.size
    ))
}

/// Read a manifest entry's image from the zip archive.
///
/// The archive's recorded size must match the manifest before any data is
/// read. The buffer grows with the bytes actually inflated and stops at the
/// declared size.
fn read_image_from_zip(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    entry: &ManifestFile,
) -> DfuResult<Vec<u8>> {
    let name = entry.file.as_str();
    let file = archive
        .by_name(name)
        .map_err(|_| DfuError::invalid_format(format!("missing file '{}'", name)))?;

    if file.size() != entry.size as u64 {
        return Err(size_mismatch(entry, file.size()));
    }

    let mut data = Vec::new();
    file.take(entry.size as u64)
        .read_to_end(&mut data)
        .map_err(|e| DfuError::invalid_format(format!("unreadable file '{}': {}", name, e)))?;
    Ok(data)
}
