//! Import and delay-load import directory readers.
//!
//! Both directories yield the same shape: per dependency module, the list of
//! imported functions (by name or by ordinal) together with the file offset of the
//! IAT slot the mapper patches with the resolved address.

use goblin::pe::data_directories::DataDirectoryType;

use super::{
    io::{read_le, read_string},
    Image,
};
use crate::{arch::Architecture, Result};

/// Size of one `IMAGE_IMPORT_DESCRIPTOR`.
const IMPORT_DESCRIPTOR_SIZE: usize = 20;
/// Size of one `IMAGE_DELAYLOAD_DESCRIPTOR`.
const DELAY_DESCRIPTOR_SIZE: usize = 32;

/// One function imported from a dependency module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedFunction {
    /// The import name, or `None` for an import by ordinal.
    pub name: Option<String>,
    /// The import ordinal for ordinal imports, otherwise the hint.
    pub ordinal: u16,
    /// File offset of the IAT slot to patch with the resolved address.
    pub iat_offset: usize,
}

/// One dependency of an image together with its imported functions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportDescriptor {
    /// The name of the dependency module as it appears in the directory.
    pub name: String,
    /// The functions imported from the module.
    pub functions: Vec<ImportedFunction>,
}

impl Image {
    /// Reads the import directory and the delay-load import directory.
    ///
    /// Delay-loaded dependencies are resolved eagerly by the mapper, so both
    /// directories are returned as one list. Returns an empty list when the image
    /// imports nothing.
    ///
    /// # Errors
    ///
    /// Returns an error when either directory is malformed or truncated.
    pub fn import_descriptors(&self) -> Result<Vec<ImportDescriptor>> {
        let mut descriptors = Vec::new();

        if let Some((directory_rva, _)) = self.data_directory(DataDirectoryType::ImportTable) {
            let mut offset = self.rva_to_offset(directory_rva as usize)?;

            loop {
                let descriptor = self.data_slice(offset, IMPORT_DESCRIPTOR_SIZE)?;
                let original_first_thunk = read_le::<u32>(descriptor)?;
                let name_rva = read_le::<u32>(&descriptor[0xC..])?;
                let first_thunk = read_le::<u32>(&descriptor[0x10..])?;

                if first_thunk == 0 {
                    break;
                }

                // Unbound images may leave the original thunk table empty.
                let thunk_rva = if original_first_thunk == 0 {
                    first_thunk
                } else {
                    original_first_thunk
                };

                descriptors.push(self.read_thunks(name_rva, thunk_rva, first_thunk)?);
                offset += IMPORT_DESCRIPTOR_SIZE;
            }
        }

        if let Some((directory_rva, _)) = self.data_directory(DataDirectoryType::DelayImportDescriptor) {
            let mut offset = self.rva_to_offset(directory_rva as usize)?;

            loop {
                let descriptor = self.data_slice(offset, DELAY_DESCRIPTOR_SIZE)?;
                let name_rva = read_le::<u32>(&descriptor[0x4..])?;
                let iat_rva = read_le::<u32>(&descriptor[0xC..])?;
                let name_table_rva = read_le::<u32>(&descriptor[0x10..])?;

                if iat_rva == 0 {
                    break;
                }

                descriptors.push(self.read_thunks(name_rva, name_table_rva, iat_rva)?);
                offset += DELAY_DESCRIPTOR_SIZE;
            }
        }

        Ok(descriptors)
    }

    /// Walks one thunk table, pairing each entry with its IAT slot offset.
    fn read_thunks(
        &self,
        name_rva: u32,
        thunk_rva: u32,
        iat_rva: u32,
    ) -> Result<ImportDescriptor> {
        let module_name = read_string(self.data(), self.rva_to_offset(name_rva as usize)?)?;
        let thunk_size = self.architecture().pointer_size();
        let mut thunk_offset = self.rva_to_offset(thunk_rva as usize)?;
        let mut iat_offset = self.rva_to_offset(iat_rva as usize)?;
        let mut functions = Vec::new();

        loop {
            let thunk = match self.architecture() {
                Architecture::X86 => {
                    u64::from(self.data_slice(thunk_offset, 4).and_then(read_le::<u32>)?)
                }
                Architecture::X64 => self.data_slice(thunk_offset, 8).and_then(read_le::<u64>)?,
            };

            if thunk == 0 {
                break;
            }

            let ordinal_flag = match self.architecture() {
                Architecture::X86 => 1 << 31,
                Architecture::X64 => 1 << 63,
            };

            let function = if thunk & ordinal_flag != 0 {
                ImportedFunction {
                    name: None,
                    ordinal: thunk as u16,
                    iat_offset,
                }
            } else {
                let hint_offset = self.rva_to_offset(thunk as usize)?;
                let hint = self.data_slice(hint_offset, 2).and_then(read_le::<u16>)?;
                let name = read_string(self.data(), hint_offset + 2)?;

                ImportedFunction {
                    name: Some(name),
                    ordinal: hint,
                    iat_offset,
                }
            };

            functions.push(function);
            thunk_offset += thunk_size;
            iat_offset += thunk_size;
        }

        Ok(ImportDescriptor {
            name: module_name,
            functions,
        })
    }
}
