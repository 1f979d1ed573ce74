//! Export directory reader.
//!
//! Resolves exported functions by name (binary search over the sorted name table)
//! or by ordinal, and detects forwarded exports whose address falls back inside the
//! export directory.

use goblin::pe::data_directories::DataDirectoryType;

use super::{
    io::{read_le, read_string},
    Image,
};
use crate::Result;

/// Size of the ordinal base field region preceding the table pointers.
const EXPORT_BASE_OFFSET: usize = 0x10;
const EXPORT_FUNCTION_COUNT_OFFSET: usize = 0x14;
const EXPORT_NAME_COUNT_OFFSET: usize = 0x18;
const EXPORT_FUNCTIONS_OFFSET: usize = 0x1C;
const EXPORT_NAMES_OFFSET: usize = 0x20;
const EXPORT_NAME_ORDINALS_OFFSET: usize = 0x24;

/// One resolved export of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// The RVA of the exported symbol.
    pub address: u32,
    /// The forwarder string (`"TARGETDLL.TargetName"` or `"TARGETDLL.#ordinal"`)
    /// when the export forwards to another module.
    pub forwarder: Option<String>,
}

/// Raw view of the export directory tables of one image.
struct ExportDirectory<'a> {
    image: &'a Image,
    directory_rva: u32,
    directory_size: u32,
    ordinal_base: u32,
    function_count: u32,
    name_count: u32,
    functions_offset: usize,
    names_offset: usize,
    name_ordinals_offset: usize,
}

impl<'a> ExportDirectory<'a> {
    fn open(image: &'a Image) -> Result<Option<ExportDirectory<'a>>> {
        let Some((directory_rva, directory_size)) =
            image.data_directory(DataDirectoryType::ExportTable)
        else {
            return Ok(None);
        };

        let offset = image.rva_to_offset(directory_rva as usize)?;
        let header = image.data_slice(offset, EXPORT_NAME_ORDINALS_OFFSET + 4)?;

        let ordinal_base = read_le::<u32>(&header[EXPORT_BASE_OFFSET..])?;
        let function_count = read_le::<u32>(&header[EXPORT_FUNCTION_COUNT_OFFSET..])?;
        let name_count = read_le::<u32>(&header[EXPORT_NAME_COUNT_OFFSET..])?;
        let functions_rva = read_le::<u32>(&header[EXPORT_FUNCTIONS_OFFSET..])?;
        let names_rva = read_le::<u32>(&header[EXPORT_NAMES_OFFSET..])?;
        let name_ordinals_rva = read_le::<u32>(&header[EXPORT_NAME_ORDINALS_OFFSET..])?;

        Ok(Some(ExportDirectory {
            image,
            directory_rva,
            directory_size,
            ordinal_base,
            function_count,
            name_count,
            functions_offset: image.rva_to_offset(functions_rva as usize)?,
            names_offset: image.rva_to_offset(names_rva as usize)?,
            name_ordinals_offset: image.rva_to_offset(name_ordinals_rva as usize)?,
        }))
    }

    fn name_at(&self, index: usize) -> Result<String> {
        let entry = self
            .image
            .data_slice(self.names_offset + index * 4, 4)
            .and_then(read_le::<u32>)?;
        let name_offset = self.image.rva_to_offset(entry as usize)?;

        read_string(self.image.data(), name_offset)
    }

    fn export_at(&self, function_index: usize) -> Result<Option<Export>> {
        if function_index >= self.function_count as usize {
            return Ok(None);
        }

        let address = self
            .image
            .data_slice(self.functions_offset + function_index * 4, 4)
            .and_then(read_le::<u32>)?;

        // An address inside the export directory itself marks a forwarded export.
        let forwarder = if address >= self.directory_rva
            && address < self.directory_rva + self.directory_size
        {
            let forwarder_offset = self.image.rva_to_offset(address as usize)?;
            Some(read_string(self.image.data(), forwarder_offset)?)
        } else {
            None
        };

        Ok(Some(Export { address, forwarder }))
    }
}

impl Image {
    /// Looks up an export by name.
    ///
    /// The name pointer table is lexically sorted, so the lookup is a binary search.
    /// Returns `Ok(None)` when the image has no export directory or no export of
    /// that name.
    ///
    /// # Errors
    ///
    /// Returns an error when the export directory is malformed or truncated.
    pub fn export_by_name(&self, name: &str) -> Result<Option<Export>> {
        let Some(directory) = ExportDirectory::open(self)? else {
            return Ok(None);
        };

        let mut low = 0_i64;
        let mut high = i64::from(directory.name_count) - 1;

        while low <= high {
            let middle = ((low + high) / 2) as usize;
            let candidate = directory.name_at(middle)?;

            match candidate.as_str().cmp(name) {
                std::cmp::Ordering::Equal => {
                    let ordinal_index = directory
                        .image
                        .data_slice(directory.name_ordinals_offset + middle * 2, 2)
                        .and_then(read_le::<u16>)?;

                    return directory.export_at(ordinal_index as usize);
                }
                std::cmp::Ordering::Less => low = middle as i64 + 1,
                std::cmp::Ordering::Greater => high = middle as i64 - 1,
            }
        }

        Ok(None)
    }

    /// Looks up an export by its (biased) ordinal.
    ///
    /// Returns `Ok(None)` when the image has no export directory or the ordinal is
    /// outside the exported range.
    ///
    /// # Errors
    ///
    /// Returns an error when the export directory is malformed or truncated.
    pub fn export_by_ordinal(&self, ordinal: u32) -> Result<Option<Export>> {
        let Some(directory) = ExportDirectory::open(self)? else {
            return Ok(None);
        };

        let Some(function_index) = ordinal.checked_sub(directory.ordinal_base) else {
            return Ok(None);
        };

        directory.export_at(function_index as usize)
    }
}
