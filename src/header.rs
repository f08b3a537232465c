//! The fixed-size record leading every OAT file, together with the running
//! checksum that the offset-planning pass folds emitted ranges into.

use crc32fast::Hasher;

use crate::arch::{InstructionSet, PAGE_SIZE};

pub const OAT_MAGIC: [u8; 4] = *b"oat\n";
pub const OAT_VERSION: [u8; 4] = *b"001\0";

/// On-disk layout, little-endian:
///
/// ```text
/// magic | version | checksum | instruction_set | dex_checksum |
/// image_checksum | image_begin | executable_offset | image_location_len
/// ```
///
/// followed immediately by the image-location bytes (no trailing NUL). The
/// checksum is a CRC-32 folded incrementally over the header fields, the
/// image location, every per-DEX and per-class record, and every blob
/// payload that is physically stored (deduplicated repeats are absent from
/// the file and from the checksum).
pub struct OatHeader {
    instruction_set: InstructionSet,
    dex_checksum: u32,
    image_checksum: u32,
    image_begin: u32,
    executable_offset: u32,
    image_location: String,
    hasher: Hasher,
}

impl OatHeader {
    /// Byte count of the fixed part, excluding the image-location string.
    pub const SIZE: u32 = 36;

    /// `dex_checksum` is the XOR of every input DEX location checksum.
    /// `image_checksum` and `image_begin` anchor a previously produced boot
    /// image and are zero otherwise.
    pub fn new(
        instruction_set: InstructionSet,
        dex_checksum: u32,
        image_checksum: u32,
        image_begin: u32,
        image_location: &str,
    ) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(&OAT_MAGIC);
        hasher.update(&OAT_VERSION);
        hasher.update(&instruction_set.as_u32().to_le_bytes());
        hasher.update(&dex_checksum.to_le_bytes());
        hasher.update(&image_checksum.to_le_bytes());
        hasher.update(&image_begin.to_le_bytes());
        hasher.update(&(image_location.len() as u32).to_le_bytes());
        hasher.update(image_location.as_bytes());
        OatHeader {
            instruction_set,
            dex_checksum,
            image_checksum,
            image_begin,
            executable_offset: 0,
            image_location: image_location.to_string(),
            hasher,
        }
    }

    /// Folds bytes into the running checksum. Callers must fold in exactly
    /// the order and over exactly the ranges the writing pass emits.
    pub fn update_checksum(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Current CRC-32 value over everything folded so far.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Called exactly once by the planning pass, with the page-aligned
    /// offset of the executable section.
    pub fn set_executable_offset(&mut self, offset: u32) {
        assert_eq!(self.executable_offset, 0, "executable offset already set");
        assert_eq!(offset % PAGE_SIZE, 0, "executable offset not page aligned");
        self.executable_offset = offset;
    }

    #[must_use]
    pub fn executable_offset(&self) -> u32 {
        self.executable_offset
    }

    #[must_use]
    pub fn instruction_set(&self) -> InstructionSet {
        self.instruction_set
    }

    #[must_use]
    pub fn dex_checksum(&self) -> u32 {
        self.dex_checksum
    }

    #[must_use]
    pub fn image_location(&self) -> &str {
        &self.image_location
    }

    /// On-disk size of the header plus the trailing image-location string.
    #[must_use]
    pub fn size_of(&self) -> u32 {
        Self::SIZE + self.image_location.len() as u32
    }

    /// The fixed part as written to disk, checksum and executable offset
    /// included.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[0..4].copy_from_slice(&OAT_MAGIC);
        bytes[4..8].copy_from_slice(&OAT_VERSION);
        bytes[8..12].copy_from_slice(&self.checksum().to_le_bytes());
        bytes[12..16].copy_from_slice(&self.instruction_set.as_u32().to_le_bytes());
        bytes[16..20].copy_from_slice(&self.dex_checksum.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.image_checksum.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.image_begin.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.executable_offset.to_le_bytes());
        bytes[32..36].copy_from_slice(&(self.image_location.len() as u32).to_le_bytes());
        bytes
    }
}
