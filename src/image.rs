//! Boot-image bridge. When the compiler is producing a boot image, the
//! planning pass copies each method's computed offsets into the runtime's
//! method registry through these traits; a non-image build passes no
//! registry and the bridge never runs.

use crate::dex::InvokeType;

/// The runtime's registry of resolved methods.
pub trait MethodRegistry {
    /// Resolves the registry entry for one method.
    ///
    /// Precondition: the caller holds the runtime mutator lock for the
    /// whole lifetime of the writer; the writer declares but cannot enforce
    /// this.
    fn resolve_method(
        &mut self,
        dex_index: usize,
        method_idx: u32,
        invoke_type: InvokeType,
    ) -> &mut dyn RegistryMethod;
}

/// One resolved method record inside the registry.
pub trait RegistryMethod {
    fn set_frame_size_in_bytes(&mut self, frame_size_in_bytes: u32);
    fn set_core_spill_mask(&mut self, core_spill_mask: u32);
    fn set_fp_spill_mask(&mut self, fp_spill_mask: u32);
    fn set_mapping_table_offset(&mut self, offset: u32);
    fn set_vmap_table_offset(&mut self, offset: u32);
    fn set_gc_map_offset(&mut self, offset: u32);
    fn set_invoke_stub_offset(&mut self, offset: u32);

    /// Stores the direct code entry. Skipped for static methods of
    /// uninitialized classes, which keep the resolution trampoline.
    fn set_code_offset(&mut self, offset: u32);

    /// Points the entry at the runtime's resolution trampoline instead of
    /// compiled code.
    fn set_resolution_trampoline(&mut self);

    fn is_static(&self) -> bool;
    fn is_constructor(&self) -> bool;
    fn is_declaring_class_initialized(&self) -> bool;
}
