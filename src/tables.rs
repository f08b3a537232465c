//! Per-DEX and per-class records. Each record serializes once; the same
//! bytes are folded into the header checksum by the planning pass and
//! written by the emission pass.

use anyhow::{Context, Result};

use crate::arch::STACK_ALIGNMENT;
use crate::compiler::ClassStatus;
use crate::dex::DexFile;
use crate::header::OatHeader;
use crate::stream::OutputStream;

/// Offsets and frame facts for one method, embedded in its class record.
///
/// Eight consecutive u32 fields on disk, nine when the compiler emits proxy
/// stubs. A zero offset means "absent".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatMethodOffsets {
    pub code_offset: u32,
    pub frame_size_in_bytes: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub mapping_table_offset: u32,
    pub vmap_table_offset: u32,
    pub gc_map_offset: u32,
    pub invoke_stub_offset: u32,
    pub proxy_stub_offset: Option<u32>,
}

impl OatMethodOffsets {
    /// The record for a method with no compiled code. Frame size defaults
    /// to the stack alignment so the runtime still sees a valid frame.
    pub(crate) fn uncompiled(with_proxy: bool) -> Self {
        OatMethodOffsets {
            code_offset: 0,
            frame_size_in_bytes: STACK_ALIGNMENT,
            core_spill_mask: 0,
            fp_spill_mask: 0,
            mapping_table_offset: 0,
            vmap_table_offset: 0,
            gc_map_offset: 0,
            invoke_stub_offset: 0,
            proxy_stub_offset: with_proxy.then_some(0),
        }
    }

    pub(crate) fn size_of(&self) -> u32 {
        8 * 4 + if self.proxy_stub_offset.is_some() { 4 } else { 0 }
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.code_offset.to_le_bytes());
        out.extend_from_slice(&self.frame_size_in_bytes.to_le_bytes());
        out.extend_from_slice(&self.core_spill_mask.to_le_bytes());
        out.extend_from_slice(&self.fp_spill_mask.to_le_bytes());
        out.extend_from_slice(&self.mapping_table_offset.to_le_bytes());
        out.extend_from_slice(&self.vmap_table_offset.to_le_bytes());
        out.extend_from_slice(&self.gc_map_offset.to_le_bytes());
        out.extend_from_slice(&self.invoke_stub_offset.to_le_bytes());
        if let Some(proxy_stub_offset) = self.proxy_stub_offset {
            out.extend_from_slice(&proxy_stub_offset.to_le_bytes());
        }
    }
}

/// One record per input DEX:
/// `u32 loc_len | loc_bytes | u32 loc_checksum | u32 dex_offset |
/// u32 methods_offsets[num_class_defs]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatDexFile {
    pub(crate) location: String,
    pub(crate) location_checksum: u32,
    pub(crate) dex_file_offset: u32,
    pub(crate) methods_offsets: Vec<u32>,
}

impl OatDexFile {
    pub(crate) fn new(dex: &dyn DexFile) -> Self {
        OatDexFile {
            location: dex.location().to_string(),
            location_checksum: dex.location_checksum(),
            dex_file_offset: 0,
            methods_offsets: vec![0; dex.num_class_defs() as usize],
        }
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn location_checksum(&self) -> u32 {
        self.location_checksum
    }

    /// Offset of the embedded DEX payload within the OAT file.
    #[must_use]
    pub fn dex_file_offset(&self) -> u32 {
        self.dex_file_offset
    }

    /// Offset of each class definition's method table, by class-def index.
    #[must_use]
    pub fn methods_offsets(&self) -> &[u32] {
        &self.methods_offsets
    }

    pub(crate) fn size_of(&self) -> u32 {
        4 + self.location.len() as u32 + 4 + 4 + 4 * self.methods_offsets.len() as u32
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_of() as usize);
        out.extend_from_slice(&(self.location.len() as u32).to_le_bytes());
        out.extend_from_slice(self.location.as_bytes());
        out.extend_from_slice(&self.location_checksum.to_le_bytes());
        out.extend_from_slice(&self.dex_file_offset.to_le_bytes());
        for offset in &self.methods_offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out
    }

    pub(crate) fn fold_checksum(&self, header: &mut OatHeader) {
        header.update_checksum(&self.serialize());
    }

    pub(crate) fn write(&self, out: &mut dyn OutputStream) -> Result<()> {
        out.write_fully(&self.serialize()).with_context(|| {
            format!(
                "failed to write oat dex file record for {} to {}",
                self.location,
                out.location()
            )
        })
    }
}

/// One record per class definition: `u32 status | OatMethodOffsets[N]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OatClass {
    status: ClassStatus,
    method_offsets: Vec<OatMethodOffsets>,
}

impl OatClass {
    pub(crate) fn new(status: ClassStatus, num_methods: u32, with_proxy: bool) -> Self {
        OatClass {
            status,
            method_offsets: vec![OatMethodOffsets::uncompiled(with_proxy); num_methods as usize],
        }
    }

    #[must_use]
    pub fn status(&self) -> ClassStatus {
        self.status
    }

    #[must_use]
    pub fn method_offsets(&self) -> &[OatMethodOffsets] {
        &self.method_offsets
    }

    pub(crate) fn set_method_offsets(&mut self, index: usize, offsets: OatMethodOffsets) {
        self.method_offsets[index] = offsets;
    }

    pub(crate) fn size_of(&self) -> u32 {
        4 + self
            .method_offsets
            .iter()
            .map(OatMethodOffsets::size_of)
            .sum::<u32>()
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_of() as usize);
        out.extend_from_slice(&self.status.as_u32().to_le_bytes());
        for offsets in &self.method_offsets {
            offsets.serialize_into(&mut out);
        }
        out
    }

    pub(crate) fn fold_checksum(&self, header: &mut OatHeader) {
        header.update_checksum(&self.serialize());
    }

    pub(crate) fn write(&self, out: &mut dyn OutputStream) -> Result<()> {
        out.write_fully(&self.serialize()).with_context(|| {
            format!("failed to write oat class record to {}", out.location())
        })
    }
}
