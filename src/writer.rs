//! The OAT writer proper: an offset-planning pass that runs in the
//! constructor and computes every byte position in the image, and a writing
//! pass that emits bytes onto that plan.
//!
//! The writing pass performs no offset arithmetic of its own; it replays the
//! plan and proves, position check by position check, that the stream lands
//! exactly where the plan said it would.

use anyhow::{bail, Context, Result};

use crate::arch::{round_up, InstructionSet, PAGE_SIZE};
use crate::compiler::{Blob, ClassStatus, Compiler, LeWord, Verifier};
use crate::dedup::DedupMap;
use crate::dex::{ClassData, DexFile, InvokeType, MethodEntry};
use crate::header::OatHeader;
use crate::image::MethodRegistry;
use crate::stream::{OutputStream, Whence};
use crate::tables::{OatClass, OatDexFile, OatMethodOffsets};

/// Every stored code-type blob is preceded by its u32 byte count.
const SIZE_PREFIX: u32 = std::mem::size_of::<u32>() as u32;

pub struct OatWriter<'a> {
    compiler: &'a dyn Compiler,
    verifier: &'a dyn Verifier,
    dex_files: &'a [&'a dyn DexFile],
    instruction_set: InstructionSet,
    header: OatHeader,
    oat_dex_files: Vec<OatDexFile>,
    oat_classes: Vec<OatClass>,
    code_offsets: DedupMap,
    mapping_table_offsets: DedupMap,
    vmap_table_offsets: DedupMap,
    gc_map_offsets: DedupMap,
    executable_offset_padding: u32,
    total_size: u32,
}

impl<'a> OatWriter<'a> {
    /// Plans the whole image. All records are frozen when this returns.
    ///
    /// `image_checksum`/`image_begin` anchor a previously produced boot
    /// image (zero for non-image builds). A method registry must be
    /// supplied iff the compiler is in image mode; its entries are
    /// populated while planning, and the caller must hold the runtime
    /// mutator lock for that to be sound.
    ///
    /// Inconsistent inputs (a DEX payload shorter than its declared size, a
    /// class whose method count changes between iterations) are programmer
    /// errors and abort.
    pub fn new(
        compiler: &'a dyn Compiler,
        verifier: &'a dyn Verifier,
        dex_files: &'a [&'a dyn DexFile],
        image_checksum: u32,
        image_begin: u32,
        image_location: &str,
        mut registry: Option<&mut dyn MethodRegistry>,
    ) -> OatWriter<'a> {
        assert_eq!(
            compiler.is_image(),
            registry.is_some(),
            "a method registry is required exactly in image mode"
        );

        let dex_checksum = dex_files
            .iter()
            .fold(0u32, |acc, dex| acc ^ dex.location_checksum());
        let instruction_set = compiler.instruction_set();
        let mut writer = OatWriter {
            compiler,
            verifier,
            dex_files,
            instruction_set,
            header: OatHeader::new(
                instruction_set,
                dex_checksum,
                image_checksum,
                image_begin,
                image_location,
            ),
            oat_dex_files: Vec::with_capacity(dex_files.len()),
            oat_classes: Vec::new(),
            code_offsets: DedupMap::default(),
            mapping_table_offsets: DedupMap::default(),
            vmap_table_offsets: DedupMap::default(),
            gc_map_offsets: DedupMap::default(),
            executable_offset_padding: 0,
            total_size: 0,
        };

        let mut offset = writer.init_oat_header();
        offset = writer.init_oat_dex_files(offset);
        offset = writer.init_dex_files(offset);
        offset = writer.init_oat_classes(offset);
        offset = writer.init_oat_code(offset);
        offset = writer.init_oat_code_dex_files(offset, &mut registry);
        writer.total_size = offset;

        assert_eq!(writer.oat_dex_files.len(), dex_files.len());
        let total_class_defs: u32 = dex_files.iter().map(|dex| dex.num_class_defs()).sum();
        assert_eq!(
            writer.oat_classes.len() as u32,
            total_class_defs,
            "oat class count disagrees with the class definition count"
        );
        log::debug!(
            "planned oat image: {} dex file(s), {} class(es), {} bytes, executable section at {:#x}",
            dex_files.len(),
            writer.oat_classes.len(),
            writer.total_size,
            writer.header.executable_offset()
        );
        writer
    }

    /// Plans and writes in one step, discarding the writer.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        compiler: &dyn Compiler,
        verifier: &dyn Verifier,
        dex_files: &[&dyn DexFile],
        image_checksum: u32,
        image_begin: u32,
        image_location: &str,
        registry: Option<&mut dyn MethodRegistry>,
        out: &mut dyn OutputStream,
    ) -> Result<()> {
        let writer = OatWriter::new(
            compiler,
            verifier,
            dex_files,
            image_checksum,
            image_begin,
            image_location,
            registry,
        );
        writer.write(out)
    }

    #[must_use]
    pub fn header(&self) -> &OatHeader {
        &self.header
    }

    #[must_use]
    pub fn oat_dex_files(&self) -> &[OatDexFile] {
        &self.oat_dex_files
    }

    /// Class records flattened across DEX files in definition order.
    #[must_use]
    pub fn oat_classes(&self) -> &[OatClass] {
        &self.oat_classes
    }

    /// Planned length of the image in bytes.
    #[must_use]
    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    fn init_oat_header(&mut self) -> u32 {
        self.header.size_of()
    }

    fn init_oat_dex_files(&mut self, mut offset: u32) -> u32 {
        for dex in self.dex_files {
            let oat_dex_file = OatDexFile::new(*dex);
            offset += oat_dex_file.size_of();
            self.oat_dex_files.push(oat_dex_file);
        }
        offset
    }

    fn init_dex_files(&mut self, mut offset: u32) -> u32 {
        let dex_files = self.dex_files;
        for (dex_index, dex) in dex_files.iter().enumerate() {
            // embedded payloads are 4-byte aligned
            offset = round_up(offset, 4);
            self.oat_dex_files[dex_index].dex_file_offset = offset;
            assert_eq!(
                dex.bytes().len(),
                dex.file_size() as usize,
                "dex payload for {} disagrees with its declared file size",
                dex.location()
            );
            offset += dex.file_size();
        }
        offset
    }

    fn init_oat_classes(&mut self, mut offset: u32) -> u32 {
        let dex_files = self.dex_files;
        let with_proxy = self.compiler.emits_proxy_stubs();
        for (dex_index, dex) in dex_files.iter().enumerate() {
            for class_def_index in 0..dex.num_class_defs() {
                self.oat_dex_files[dex_index].methods_offsets[class_def_index as usize] = offset;
                let num_methods = dex
                    .class_data(class_def_index)
                    .map_or(0, ClassData::num_methods);
                let status = self.class_status(dex_index, class_def_index);
                let oat_class = OatClass::new(status, num_methods, with_proxy);
                offset += oat_class.size_of();
                self.oat_classes.push(oat_class);
            }
            self.oat_dex_files[dex_index].fold_checksum(&mut self.header);
        }
        offset
    }

    fn init_oat_code(&mut self, offset: u32) -> u32 {
        let aligned = round_up(offset, PAGE_SIZE);
        self.header.set_executable_offset(aligned);
        self.executable_offset_padding = aligned - offset;
        aligned
    }

    fn init_oat_code_dex_files(
        &mut self,
        mut offset: u32,
        registry: &mut Option<&mut dyn MethodRegistry>,
    ) -> u32 {
        let dex_files = self.dex_files;
        let mut oat_class_index = 0;
        for (dex_index, dex) in dex_files.iter().enumerate() {
            for class_def_index in 0..dex.num_class_defs() {
                offset = self.init_oat_code_class_def(
                    offset,
                    oat_class_index,
                    dex_index,
                    class_def_index,
                    registry,
                );
                self.oat_classes[oat_class_index].fold_checksum(&mut self.header);
                oat_class_index += 1;
            }
        }
        offset
    }

    fn init_oat_code_class_def(
        &mut self,
        mut offset: u32,
        oat_class_index: usize,
        dex_index: usize,
        class_def_index: u32,
        registry: &mut Option<&mut dyn MethodRegistry>,
    ) -> u32 {
        let dex = self.dex_files[dex_index];
        let Some(class_data) = dex.class_data(class_def_index) else {
            // no class data, e.g. a marker interface
            return offset;
        };
        assert_eq!(
            self.oat_classes[oat_class_index].method_offsets().len() as u32,
            class_data.num_methods(),
            "method count for class {class_def_index} in {} changed between iterations",
            dex.location()
        );
        for (class_def_method_index, method) in class_data.methods().enumerate() {
            offset = self.init_oat_code_method(
                offset,
                oat_class_index,
                class_def_method_index,
                dex_index,
                class_def_index,
                method,
                registry,
            );
        }
        offset
    }

    #[allow(clippy::too_many_arguments)]
    fn init_oat_code_method(
        &mut self,
        mut offset: u32,
        oat_class_index: usize,
        class_def_method_index: usize,
        dex_index: usize,
        class_def_index: u32,
        method: &MethodEntry,
        registry: &mut Option<&mut dyn MethodRegistry>,
    ) -> u32 {
        let compiler = self.compiler;
        let dex = self.dex_files[dex_index];
        let mut record = OatMethodOffsets::uncompiled(compiler.emits_proxy_stubs());

        if let Some(compiled) = compiler.compiled_method(dex_index, method.method_idx) {
            let (code_offset, next) = Self::plan_code(
                &mut self.code_offsets,
                &mut self.header,
                self.instruction_set,
                &compiled.code,
                compiled.code_delta,
                offset,
            );
            record.code_offset = code_offset;
            record.frame_size_in_bytes = compiled.frame_size_in_bytes;
            record.core_spill_mask = compiled.core_spill_mask;
            record.fp_spill_mask = compiled.fp_spill_mask;
            offset = next;

            let (mapping_table_offset, next) = Self::plan_table(
                &mut self.mapping_table_offsets,
                &mut self.header,
                &compiled.mapping_table,
                offset,
            );
            record.mapping_table_offset = mapping_table_offset;
            offset = next;

            let (vmap_table_offset, next) = Self::plan_table(
                &mut self.vmap_table_offsets,
                &mut self.header,
                &compiled.vmap_table,
                offset,
            );
            record.vmap_table_offset = vmap_table_offset;
            offset = next;

            // a verified method carries a GC map unless it is native
            debug_assert!(
                !compiled.gc_map.is_empty()
                    || method.is_native()
                    || self.class_status(dex_index, class_def_index) < ClassStatus::Verified,
                "missing GC map for method {} in {}",
                method.method_idx,
                dex.location()
            );
            let (gc_map_offset, next) = Self::plan_table(
                &mut self.gc_map_offsets,
                &mut self.header,
                &compiled.gc_map,
                offset,
            );
            record.gc_map_offset = gc_map_offset;
            offset = next;
        }

        let shorty = dex.method_shorty(method.method_idx);
        let is_static = method.invoke_type == InvokeType::Static;
        if let Some(stub) = compiler.invoke_stub(is_static, shorty) {
            let (invoke_stub_offset, next) = Self::plan_code(
                &mut self.code_offsets,
                &mut self.header,
                self.instruction_set,
                &stub.code,
                stub.code_delta,
                offset,
            );
            record.invoke_stub_offset = invoke_stub_offset;
            offset = next;
        }

        if compiler.emits_proxy_stubs() && !is_static {
            if let Some(stub) = compiler.proxy_stub(shorty) {
                let (proxy_stub_offset, next) = Self::plan_code(
                    &mut self.code_offsets,
                    &mut self.header,
                    self.instruction_set,
                    &stub.code,
                    stub.code_delta,
                    offset,
                );
                record.proxy_stub_offset = Some(proxy_stub_offset);
                offset = next;
            }
        }

        if compiler.is_image() {
            let registry = registry
                .as_deref_mut()
                .expect("image mode requires a method registry");
            let entry = registry.resolve_method(dex_index, method.method_idx, method.invoke_type);
            entry.set_frame_size_in_bytes(record.frame_size_in_bytes);
            entry.set_core_spill_mask(record.core_spill_mask);
            entry.set_fp_spill_mask(record.fp_spill_mask);
            entry.set_mapping_table_offset(record.mapping_table_offset);
            // static methods of uninitialized classes keep the resolution
            // trampoline
            if !entry.is_static() || entry.is_constructor() || entry.is_declaring_class_initialized()
            {
                entry.set_code_offset(record.code_offset);
            } else {
                entry.set_resolution_trampoline();
            }
            entry.set_vmap_table_offset(record.vmap_table_offset);
            entry.set_gc_map_offset(record.gc_map_offset);
            entry.set_invoke_stub_offset(record.invoke_stub_offset);
        }

        self.oat_classes[oat_class_index].set_method_offsets(class_def_method_index, record);
        offset
    }

    fn class_status(&self, dex_index: usize, class_def_index: u32) -> ClassStatus {
        if let Some(compiled_class) = self.compiler.compiled_class(dex_index, class_def_index) {
            compiled_class.status
        } else if self.verifier.is_class_rejected(dex_index, class_def_index) {
            ClassStatus::Error
        } else {
            ClassStatus::NotReady
        }
    }

    /// Plans one size-prefixed code blob (method code or a stub): aligns
    /// the cursor, interns by identity, and advances and folds only on
    /// first sight. Returns the offset recorded for the owner and the new
    /// cursor.
    fn plan_code(
        code_offsets: &mut DedupMap,
        header: &mut OatHeader,
        instruction_set: InstructionSet,
        code: &Blob<u8>,
        code_delta: u32,
        mut offset: u32,
    ) -> (u32, u32) {
        offset = instruction_set.align_code(offset);
        let code_size = code.byte_len();
        assert_ne!(code_size, 0, "code blobs must not be empty");
        let tentative = offset + SIZE_PREFIX + code_delta;
        let (stored, is_new) = code_offsets.intern(code.id, tentative);
        if is_new {
            offset += SIZE_PREFIX + code_size;
            header.update_checksum(&code.to_le_bytes());
        }
        (stored, offset)
    }

    /// Plans one side table (mapping, vmap, or GC map): no size prefix, no
    /// alignment; an empty table records offset 0.
    fn plan_table<T: LeWord>(
        table_offsets: &mut DedupMap,
        header: &mut OatHeader,
        table: &Blob<T>,
        mut offset: u32,
    ) -> (u32, u32) {
        let tentative = if table.is_empty() { 0 } else { offset };
        let (stored, is_new) = table_offsets.intern(table.id, tentative);
        if is_new {
            offset += table.byte_len();
            header.update_checksum(&table.to_le_bytes());
        }
        (stored, offset)
    }

    /// Emits the planned image.
    ///
    /// Takes `&self`: the plan is immutable, so writing the same writer to
    /// two streams produces byte-identical output. Any stream failure or
    /// position mismatch is reported with the stream location and, where
    /// applicable, the method and DEX being written; the partial file
    /// should be discarded.
    pub fn write(&self, out: &mut dyn OutputStream) -> Result<()> {
        let result = self.write_inner(out);
        if let Err(err) = &result {
            log::error!("oat write to {} failed: {err:#}", out.location());
        }
        result
    }

    fn write_inner(&self, out: &mut dyn OutputStream) -> Result<()> {
        out.write_fully(&self.header.to_bytes())
            .with_context(|| format!("failed to write oat header to {}", out.location()))?;
        out.write_fully(self.header.image_location().as_bytes())
            .with_context(|| format!("failed to write image location to {}", out.location()))?;
        self.write_tables(out)?;
        let code_offset = self.write_code(out)?;
        self.write_code_dex_files(out, code_offset)?;
        Ok(())
    }

    fn write_tables(&self, out: &mut dyn OutputStream) -> Result<()> {
        for oat_dex_file in &self.oat_dex_files {
            oat_dex_file.write(out)?;
        }
        for (dex_index, oat_dex_file) in self.oat_dex_files.iter().enumerate() {
            let dex = self.dex_files[dex_index];
            let expected = oat_dex_file.dex_file_offset;
            let actual = out.seek(i64::from(expected), Whence::Set).with_context(|| {
                format!(
                    "failed to seek to the dex payload for {} in {}",
                    dex.location(),
                    out.location()
                )
            })?;
            if actual != u64::from(expected) {
                bail!(
                    "misplaced dex payload for {} in {}: planned offset {expected}, got {actual}",
                    dex.location(),
                    out.location()
                );
            }
            out.write_fully(&dex.bytes()[..dex.file_size() as usize])
                .with_context(|| {
                    format!(
                        "failed to write the dex payload for {} to {}",
                        dex.location(),
                        out.location()
                    )
                })?;
        }
        for oat_class in &self.oat_classes {
            oat_class.write(out)?;
        }
        Ok(())
    }

    fn write_code(&self, out: &mut dyn OutputStream) -> Result<u32> {
        let code_offset = self.header.executable_offset();
        let actual = out
            .seek(i64::from(self.executable_offset_padding), Whence::Current)
            .with_context(|| {
                format!(
                    "failed to seek to the executable section of {}",
                    out.location()
                )
            })?;
        if actual != u64::from(code_offset) {
            bail!(
                "executable section of {} starts at {actual}, planned {code_offset}",
                out.location()
            );
        }
        Ok(code_offset)
    }

    fn write_code_dex_files(&self, out: &mut dyn OutputStream, mut code_offset: u32) -> Result<()> {
        let mut oat_class_index = 0;
        for (dex_index, dex) in self.dex_files.iter().enumerate() {
            for class_def_index in 0..dex.num_class_defs() {
                code_offset = self.write_code_class_def(
                    out,
                    code_offset,
                    oat_class_index,
                    dex_index,
                    class_def_index,
                )?;
                oat_class_index += 1;
            }
        }
        expect_position(out, self.total_size)
    }

    fn write_code_class_def(
        &self,
        out: &mut dyn OutputStream,
        mut code_offset: u32,
        oat_class_index: usize,
        dex_index: usize,
        class_def_index: u32,
    ) -> Result<u32> {
        let dex = self.dex_files[dex_index];
        let Some(class_data) = dex.class_data(class_def_index) else {
            return Ok(code_offset);
        };
        for (class_def_method_index, method) in class_data.methods().enumerate() {
            code_offset = self.write_code_method(
                out,
                code_offset,
                oat_class_index,
                class_def_method_index,
                dex_index,
                method,
            )?;
        }
        Ok(code_offset)
    }

    fn write_code_method(
        &self,
        out: &mut dyn OutputStream,
        mut code_offset: u32,
        oat_class_index: usize,
        class_def_method_index: usize,
        dex_index: usize,
        method: &MethodEntry,
    ) -> Result<u32> {
        let dex = self.dex_files[dex_index];
        let record = &self.oat_classes[oat_class_index].method_offsets()[class_def_method_index];

        if let Some(compiled) = self.compiler.compiled_method(dex_index, method.method_idx) {
            code_offset = self.write_prefixed_blob(
                out,
                &self.code_offsets,
                &compiled.code,
                compiled.code_delta,
                record.code_offset,
                code_offset,
                "method code",
                dex.location(),
                method.method_idx,
            )?;
            code_offset = write_table_blob(
                out,
                &self.mapping_table_offsets,
                &compiled.mapping_table,
                record.mapping_table_offset,
                code_offset,
                "mapping table",
                dex.location(),
                method.method_idx,
            )?;
            code_offset = write_table_blob(
                out,
                &self.vmap_table_offsets,
                &compiled.vmap_table,
                record.vmap_table_offset,
                code_offset,
                "vmap table",
                dex.location(),
                method.method_idx,
            )?;
            code_offset = write_table_blob(
                out,
                &self.gc_map_offsets,
                &compiled.gc_map,
                record.gc_map_offset,
                code_offset,
                "GC map",
                dex.location(),
                method.method_idx,
            )?;
        }

        let shorty = dex.method_shorty(method.method_idx);
        let is_static = method.invoke_type == InvokeType::Static;
        if let Some(stub) = self.compiler.invoke_stub(is_static, shorty) {
            code_offset = self.write_prefixed_blob(
                out,
                &self.code_offsets,
                &stub.code,
                stub.code_delta,
                record.invoke_stub_offset,
                code_offset,
                "invoke stub",
                dex.location(),
                method.method_idx,
            )?;
        }
        if self.compiler.emits_proxy_stubs() && !is_static {
            if let Some(stub) = self.compiler.proxy_stub(shorty) {
                let recorded = record
                    .proxy_stub_offset
                    .expect("proxy slot planned for every method when the gate is on");
                code_offset = self.write_prefixed_blob(
                    out,
                    &self.code_offsets,
                    &stub.code,
                    stub.code_delta,
                    recorded,
                    code_offset,
                    "proxy stub",
                    dex.location(),
                    method.method_idx,
                )?;
            }
        }
        Ok(code_offset)
    }

    /// Emits one size-prefixed blob, or nothing when the plan stored it at
    /// an earlier first-use site. The interned offset must match the
    /// method record either way; divergence is a writer bug.
    #[allow(clippy::too_many_arguments)]
    fn write_prefixed_blob(
        &self,
        out: &mut dyn OutputStream,
        map: &DedupMap,
        code: &Blob<u8>,
        code_delta: u32,
        recorded: u32,
        code_offset: u32,
        what: &str,
        dex_location: &str,
        method_idx: u32,
    ) -> Result<u32> {
        let aligned = self.instruction_set.align_code(code_offset);
        let mut code_offset = seek_forward(out, code_offset, aligned, what)?;
        let code_size = code.byte_len();
        let tentative = code_offset + SIZE_PREFIX + code_delta;
        let stored = map.get(code.id).expect("blob interned during planning");
        assert_eq!(
            stored, recorded,
            "{what} offset for method {method_idx} in {dex_location} diverges from the plan"
        );
        if stored == tentative {
            out.write_fully(&code_size.to_le_bytes()).with_context(|| {
                format!(
                    "failed to write {what} size for method {method_idx} in {dex_location} to {}",
                    out.location()
                )
            })?;
            code_offset += SIZE_PREFIX;
            out.write_fully(&code.to_le_bytes()).with_context(|| {
                format!(
                    "failed to write {what} for method {method_idx} in {dex_location} to {}",
                    out.location()
                )
            })?;
            code_offset += code_size;
        }
        expect_position(out, code_offset)?;
        Ok(code_offset)
    }
}

/// Emits one side table, or nothing when it was deduplicated or is empty.
#[allow(clippy::too_many_arguments)]
fn write_table_blob<T: LeWord>(
    out: &mut dyn OutputStream,
    map: &DedupMap,
    table: &Blob<T>,
    recorded: u32,
    mut code_offset: u32,
    what: &str,
    dex_location: &str,
    method_idx: u32,
) -> Result<u32> {
    let tentative = if table.is_empty() { 0 } else { code_offset };
    let stored = map.get(table.id).expect("table interned during planning");
    assert_eq!(
        stored, recorded,
        "{what} offset for method {method_idx} in {dex_location} diverges from the plan"
    );
    if stored == tentative {
        out.write_fully(&table.to_le_bytes()).with_context(|| {
            format!(
                "failed to write {what} for method {method_idx} in {dex_location} to {}",
                out.location()
            )
        })?;
        code_offset += table.byte_len();
    }
    expect_position(out, code_offset)?;
    Ok(code_offset)
}

fn seek_forward(out: &mut dyn OutputStream, from: u32, to: u32, what: &str) -> Result<u32> {
    if to == from {
        return Ok(from);
    }
    let actual = out
        .seek(i64::from(to - from), Whence::Current)
        .with_context(|| format!("failed to seek to {what} in {}", out.location()))?;
    if actual != u64::from(to) {
        bail!(
            "failed to seek to {what} in {}: planned {to}, got {actual}",
            out.location()
        );
    }
    Ok(to)
}

fn expect_position(out: &mut dyn OutputStream, expected: u32) -> Result<()> {
    let actual = out
        .seek(0, Whence::Current)
        .with_context(|| format!("failed to query the position of {}", out.location()))?;
    if actual != u64::from(expected) {
        bail!(
            "stream position drifted in {}: planned {expected}, at {actual}",
            out.location()
        );
    }
    Ok(())
}
