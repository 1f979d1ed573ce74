//! Architecture tagging and the per-architecture descriptor table.
//!
//! The engine supports x86 and x64 targets with a single implementation of every
//! algorithm; all width- and layout-dependent constants (pointer size, PEB field
//! offsets, loader-structure layouts, relocation kinds) live in an [`ArchLayout`]
//! selected at runtime from the [`Architecture`] tag, instead of duplicated code
//! paths per architecture.

/// COFF machine value for 32-bit x86 images.
pub(crate) const MACHINE_I386: u16 = 0x014C;
/// COFF machine value for x64 images.
pub(crate) const MACHINE_AMD64: u16 = 0x8664;

/// Base relocation kind applying a 32-bit addend.
pub(crate) const RELOCATION_HIGHLOW: u16 = 3;
/// Base relocation kind applying a 64-bit addend.
pub(crate) const RELOCATION_DIR64: u16 = 10;

/// The pointer width of the foreign process and of the image being mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// 32-bit x86
    X86,
    /// 64-bit x64
    X64,
}

/// Field offsets of the process environment block for one architecture.
#[derive(Debug)]
pub(crate) struct PebLayout {
    /// Offset of the `Ldr` pointer
    pub ldr: u64,
    /// Offset of the `ProcessHeap` pointer
    pub process_heap: u64,
    /// Offset of the `ApiSetMap` pointer
    pub api_set_map: u64,
    /// Offset of `InLoadOrderModuleList` within `PEB_LDR_DATA`
    pub in_load_order_list: u64,
    /// Offset of `DllBase` within `LDR_DATA_TABLE_ENTRY`
    pub entry_dll_base: u64,
    /// Offset of `FullDllName` within `LDR_DATA_TABLE_ENTRY`
    pub entry_full_name: u64,
}

/// Layout of one loader TLS list entry (`LdrpTlsEntry`).
#[derive(Debug)]
pub(crate) struct TlsEntryLayout {
    /// Total size of the entry in bytes
    pub size: usize,
    /// Offset of the embedded copy of the image's TLS directory
    pub directory: usize,
    /// Size of the embedded TLS directory in bytes
    pub directory_size: usize,
    /// Offset of the assigned TLS index
    pub index: usize,
}

/// Layout of one inverted-function-table entry.
#[derive(Debug)]
pub(crate) struct FunctionTableEntryLayout {
    /// Total size of the entry in bytes
    pub size: usize,
    /// Offset of the (possibly encoded) exception directory address
    pub exception_directory: usize,
    /// Offset of the image base
    pub image_base: usize,
    /// Offset of the image size
    pub image_size: usize,
    /// Offset of the exception directory size / handler count
    pub table_size: usize,
}

/// The per-architecture descriptor table consumed by every width-dependent algorithm.
#[derive(Debug)]
pub(crate) struct ArchLayout {
    /// Native pointer width in bytes
    pub pointer_size: usize,
    /// The base relocation kind this architecture applies
    pub relocation_kind: u16,
    /// PEB and loader-list offsets
    pub peb: PebLayout,
    /// Loader TLS list entry layout
    pub tls_entry: TlsEntryLayout,
    /// Growth increment of the loader TLS bitmap, in bits
    pub tls_bitmap_growth: u32,
    /// Inverted-function-table entry layout
    pub function_table_entry: FunctionTableEntryLayout,
    /// Number of random bytes in a generated security cookie
    pub cookie_size: usize,
    /// The default compiler-emitted security cookie for this architecture
    pub default_cookie: &'static [u8],
    /// Offset of `GuardCFCheckFunctionPointer` within the load-config directory
    pub guard_check_offset: usize,
    /// Offset of `GuardCFDispatchFunctionPointer` within the load-config directory,
    /// when the architecture carries one
    pub guard_dispatch_offset: Option<usize>,
}

static LAYOUT_X86: ArchLayout = ArchLayout {
    pointer_size: 4,
    relocation_kind: RELOCATION_HIGHLOW,
    peb: PebLayout {
        ldr: 0x0C,
        process_heap: 0x18,
        api_set_map: 0x38,
        in_load_order_list: 0x0C,
        entry_dll_base: 0x18,
        entry_full_name: 0x24,
    },
    tls_entry: TlsEntryLayout {
        size: 40,
        directory: 0x08,
        directory_size: 24,
        index: 0x24,
    },
    tls_bitmap_growth: 0x20,
    function_table_entry: FunctionTableEntryLayout {
        size: 16,
        exception_directory: 0x0,
        image_base: 0x4,
        image_size: 0x8,
        table_size: 0xC,
    },
    cookie_size: 4,
    default_cookie: &[0xBB, 0x40, 0xE6, 0x4E],
    guard_check_offset: 0x48,
    guard_dispatch_offset: None,
};

static LAYOUT_X64: ArchLayout = ArchLayout {
    pointer_size: 8,
    relocation_kind: RELOCATION_DIR64,
    peb: PebLayout {
        ldr: 0x18,
        process_heap: 0x30,
        api_set_map: 0x68,
        in_load_order_list: 0x10,
        entry_dll_base: 0x30,
        entry_full_name: 0x48,
    },
    tls_entry: TlsEntryLayout {
        size: 72,
        directory: 0x10,
        directory_size: 40,
        index: 0x40,
    },
    tls_bitmap_growth: 0x40,
    function_table_entry: FunctionTableEntryLayout {
        size: 24,
        exception_directory: 0x0,
        image_base: 0x8,
        image_size: 0x10,
        table_size: 0x14,
    },
    cookie_size: 6,
    default_cookie: &[0x2B, 0x99, 0x2D, 0xDF, 0xA2, 0x32],
    guard_check_offset: 0x70,
    guard_dispatch_offset: Some(0x78),
};

impl Architecture {
    /// Maps a COFF machine value to an [`Architecture`], if supported.
    #[must_use]
    pub fn from_machine(machine: u16) -> Option<Architecture> {
        match machine {
            MACHINE_I386 => Some(Architecture::X86),
            MACHINE_AMD64 => Some(Architecture::X64),
            _ => None,
        }
    }

    /// The native pointer width in bytes.
    #[must_use]
    pub fn pointer_size(&self) -> usize {
        self.layout().pointer_size
    }

    pub(crate) fn layout(&self) -> &'static ArchLayout {
        match self {
            Architecture::X86 => &LAYOUT_X86,
            Architecture::X64 => &LAYOUT_X64,
        }
    }
}
