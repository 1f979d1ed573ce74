//! Load configuration directory reader.
//!
//! Surfaces the three pieces of the load-config directory the mapper consumes: the
//! security cookie location, the control-flow-guard flags, and (on x86) the
//! structured-exception-handler table.

use bitflags::bitflags;
use goblin::pe::data_directories::DataDirectoryType;

use super::{io::read_le, Image};
use crate::{arch::Architecture, Result};

bitflags! {
    /// Control-flow-guard flags of an image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GuardFlags: u32 {
        /// The module performs control flow integrity checks.
        const CF_INSTRUMENTED = 0x100;
        /// The module does not make use of the security cookie.
        const SECURITY_COOKIE_UNUSED = 0x800;
        /// The module contains export suppression information.
        const EXPORT_SUPPRESSION_INFO_PRESENT = 0x4000;
    }
}

/// The x86 structured-exception-handler table of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SehTable {
    /// RVA of the handler table.
    pub rva: u32,
    /// Number of handlers in the table.
    pub handler_count: u32,
}

/// The parsed load configuration data of an image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadConfigData {
    /// RVA of the security cookie, when the image carries one.
    pub security_cookie_rva: Option<u32>,
    /// The control-flow-guard flags.
    pub guard_flags: GuardFlags,
    /// The structured-exception-handler table (x86 only).
    pub seh_table: Option<SehTable>,
}

/// Per-width field offsets within `IMAGE_LOAD_CONFIG_DIRECTORY`.
struct FieldOffsets {
    security_cookie: usize,
    seh_table: usize,
    seh_count: usize,
    guard_flags: usize,
}

const OFFSETS_X86: FieldOffsets = FieldOffsets {
    security_cookie: 0x3C,
    seh_table: 0x40,
    seh_count: 0x44,
    guard_flags: 0x58,
};

const OFFSETS_X64: FieldOffsets = FieldOffsets {
    security_cookie: 0x58,
    seh_table: 0x60,
    seh_count: 0x68,
    guard_flags: 0x90,
};

impl Image {
    /// Reads the load configuration directory.
    ///
    /// Fields past the declared directory size are treated as absent, matching how
    /// the loader handles images built against older SDK headers. Returns the empty
    /// default when the image has no load-config directory at all.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory is malformed or truncated.
    pub fn load_config(&self) -> Result<LoadConfigData> {
        let Some((directory_rva, _)) = self.data_directory(DataDirectoryType::LoadConfigTable)
        else {
            return Ok(LoadConfigData::default());
        };

        let directory_offset = self.rva_to_offset(directory_rva as usize)?;
        // The directory's own Size field governs which fields are present.
        let declared_size = self.data_slice(directory_offset, 4).and_then(read_le::<u32>)? as usize;
        let directory = self.data_slice(directory_offset, declared_size)?;

        let offsets = match self.architecture() {
            Architecture::X86 => &OFFSETS_X86,
            Architecture::X64 => &OFFSETS_X64,
        };

        let pointer_size = self.architecture().pointer_size();
        let read_pointer = |offset: usize| -> Result<Option<u64>> {
            if offset + pointer_size > directory.len() {
                return Ok(None);
            }

            let value = match self.architecture() {
                Architecture::X86 => u64::from(read_le::<u32>(&directory[offset..])?),
                Architecture::X64 => read_le::<u64>(&directory[offset..])?,
            };

            Ok(Some(value))
        };

        let security_cookie_rva = match read_pointer(offsets.security_cookie)? {
            Some(va) if va != 0 => Some(self.va_to_rva(va)?),
            _ => None,
        };

        let guard_flags = if offsets.guard_flags + 4 <= directory.len() {
            GuardFlags::from_bits_truncate(read_le::<u32>(&directory[offsets.guard_flags..])?)
        } else {
            GuardFlags::empty()
        };

        let seh_table = if self.architecture() == Architecture::X86 {
            match (
                read_pointer(offsets.seh_table)?,
                read_pointer(offsets.seh_count)?,
            ) {
                (Some(table_va), Some(handler_count)) if table_va != 0 && handler_count != 0 => {
                    Some(SehTable {
                        rva: self.va_to_rva(table_va)?,
                        handler_count: handler_count as u32,
                    })
                }
                _ => None,
            }
        } else {
            None
        };

        Ok(LoadConfigData {
            security_cookie_rva,
            guard_flags,
            seh_table,
        })
    }
}
