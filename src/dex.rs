//! The DEX-file seam. The writer never parses bytecode containers; it
//! iterates class definitions and method lists through this interface and
//! embeds the raw payload bytes verbatim.

/// Method access flag: declared static.
pub const ACC_STATIC: u32 = 0x0008;
/// Method access flag: implemented in native code.
pub const ACC_NATIVE: u32 = 0x0100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeType {
    Static,
    Direct,
    Virtual,
    Super,
    Interface,
}

/// One method as yielded by the container's class-data iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodEntry {
    pub method_idx: u32,
    pub access_flags: u32,
    pub invoke_type: InvokeType,
}

impl MethodEntry {
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }
}

/// Per-class method lists, already partitioned the way the container
/// iterates them: direct methods first, then virtual.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassData {
    pub direct_methods: Vec<MethodEntry>,
    pub virtual_methods: Vec<MethodEntry>,
}

impl ClassData {
    #[must_use]
    pub fn num_methods(&self) -> u32 {
        (self.direct_methods.len() + self.virtual_methods.len()) as u32
    }

    /// All methods in emission order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodEntry> {
        self.direct_methods.iter().chain(&self.virtual_methods)
    }
}

/// An input bytecode container.
///
/// Implementations must outlive the writer and stay immutable while it
/// exists; `bytes()` must be exactly `file_size()` long.
pub trait DexFile {
    fn location(&self) -> &str;

    fn location_checksum(&self) -> u32;

    /// Size declared by the container's own header.
    fn file_size(&self) -> u32;

    /// The raw container payload embedded into the OAT file.
    fn bytes(&self) -> &[u8];

    fn num_class_defs(&self) -> u32;

    /// None for class definitions with no class data, e.g. marker
    /// interfaces.
    fn class_data(&self, class_def_index: u32) -> Option<&ClassData>;

    /// Compact parameter-and-return signature; the invoke-stub lookup key.
    fn method_shorty(&self, method_idx: u32) -> &str;
}
