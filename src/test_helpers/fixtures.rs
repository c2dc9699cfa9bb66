use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};

use serde_json::json;

use crate::dfu::mcuboot::{IMAGE_HEADER_SIZE, IMAGE_MAGIC, TLV_INFO_MAGIC, TLV_PROT_INFO_MAGIC, TLV_SHA256};
use crate::dfu::package::ImageHash;

/// Builder for zip firmware packages with a generated manifest.json.
pub struct PackageBuilder {
    name: Option<String>,
    format_version: u32,
    images: Vec<(u32, String, Vec<u8>)>,
    tampered: HashSet<u32>,
    omitted: HashSet<String>,
    declared_sizes: HashMap<u32, usize>,
    include_manifest: bool,
    raw_manifest: Option<String>,
}

impl PackageBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            format_version: 1,
            images: Vec::new(),
            tampered: HashSet::new(),
            omitted: HashSet::new(),
            declared_sizes: HashMap::new(),
            include_manifest: true,
            raw_manifest: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn format_version(mut self, version: u32) -> Self {
        self.format_version = version;
        self
    }

    pub fn image(mut self, image_index: u32, file: &str, bytes: Vec<u8>) -> Self {
        self.images.push((image_index, file.to_string(), bytes));
        self
    }

    /// Flip a byte of the stored image after its digest was recorded.
    pub fn tamper(mut self, image_index: u32) -> Self {
        self.tampered.insert(image_index);
        self
    }

    /// List the file in the manifest but leave it out of the archive.
    pub fn omit_file(mut self, file: &str) -> Self {
        self.omitted.insert(file.to_string());
        self
    }

    pub fn declared_size(mut self, image_index: u32, size: usize) -> Self {
        self.declared_sizes.insert(image_index, size);
        self
    }

    pub fn without_manifest(mut self) -> Self {
        self.include_manifest = false;
        self
    }

    /// Use `manifest` verbatim instead of generating one.
    pub fn raw_manifest(mut self, manifest: &str) -> Self {
        self.raw_manifest = Some(manifest.to_string());
        self
    }

    fn manifest(&self) -> String {
        if let Some(raw) = &self.raw_manifest {
            return raw.clone();
        }
        let files: Vec<_> = self
            .images
            .iter()
            .map(|(index, file, bytes)| {
                json!({
                    "image_index": index,
                    "file": file,
                    "size": self.declared_sizes.get(index).copied().unwrap_or(bytes.len()),
                    "sha256": ImageHash::of(bytes).to_hex(),
                })
            })
            .collect();
        json!({
            "format-version": self.format_version,
            "name": self.name,
            "files": files,
        })
        .to_string()
    }

    pub fn build(self) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();

        if self.include_manifest {
            writer
                .start_file("manifest.json", options)
                .expect("Failed to start manifest");
            writer
                .write_all(self.manifest().as_bytes())
                .expect("Failed to write manifest");
        }

        for (index, file, bytes) in &self.images {
            if self.omitted.contains(file) {
                continue;
            }
            let mut stored = bytes.clone();
            if self.tampered.contains(index) {
                if let Some(first) = stored.first_mut() {
                    *first ^= 0xFF;
                }
            }
            writer
                .start_file(file.as_str(), options)
                .expect("Failed to start image file");
            writer.write_all(&stored).expect("Failed to write image");
        }

        writer
            .finish()
            .expect("Failed to finish zip")
            .into_inner()
    }
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for bare MCUboot images with a valid SHA-256 TLV.
pub struct McubootImageBuilder {
    body: Vec<u8>,
    version: (u8, u8, u16, u32),
    protected: Vec<(u16, Vec<u8>)>,
    with_hash: bool,
}

impl McubootImageBuilder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            version: (1, 0, 0, 0),
            protected: Vec::new(),
            with_hash: true,
        }
    }

    pub fn version(mut self, major: u8, minor: u8, revision: u16, build_num: u32) -> Self {
        self.version = (major, minor, revision, build_num);
        self
    }

    pub fn protected_tlv(mut self, tlv_type: u16, value: Vec<u8>) -> Self {
        self.protected.push((tlv_type, value));
        self
    }

    pub fn without_hash(mut self) -> Self {
        self.with_hash = false;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let protect_tlv_size = if self.protected.is_empty() {
            0
        } else {
            4 + self.protected.iter().map(|(_, v)| 4 + v.len()).sum::<usize>()
        };
        let (major, minor, revision, build_num) = self.version;

        let mut out = Vec::new();
        out.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // load_addr
        out.extend_from_slice(&(IMAGE_HEADER_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(protect_tlv_size as u16).to_le_bytes());
        out.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
        out.push(major);
        out.push(minor);
        out.extend_from_slice(&revision.to_le_bytes());
        out.extend_from_slice(&build_num.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // pad
        assert_eq!(out.len(), IMAGE_HEADER_SIZE);

        out.extend_from_slice(&self.body);

        if protect_tlv_size > 0 {
            out.extend_from_slice(&TLV_PROT_INFO_MAGIC.to_le_bytes());
            out.extend_from_slice(&(protect_tlv_size as u16).to_le_bytes());
            for (tlv_type, value) in &self.protected {
                out.extend_from_slice(&tlv_type.to_le_bytes());
                out.extend_from_slice(&(value.len() as u16).to_le_bytes());
                out.extend_from_slice(value);
            }
        }

        let digest = ImageHash::of(&out);
        let unprotected_size: u16 = if self.with_hash { 4 + 4 + 32 } else { 4 };
        out.extend_from_slice(&TLV_INFO_MAGIC.to_le_bytes());
        out.extend_from_slice(&unprotected_size.to_le_bytes());
        if self.with_hash {
            out.extend_from_slice(&TLV_SHA256.to_le_bytes());
            out.extend_from_slice(&32u16.to_le_bytes());
            out.extend_from_slice(digest.as_bytes());
        }
        out
    }
}
