//! Base relocation directory reader.

use goblin::pe::data_directories::DataDirectoryType;

use super::{io::read_le, Image};
use crate::Result;

/// Size of one relocation block header (page RVA plus block size).
const BLOCK_HEADER_SIZE: usize = 8;

/// One base relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// File offset of the slot the relocation patches.
    pub offset: usize,
    /// The relocation kind (`IMAGE_REL_BASED_*` value).
    pub kind: u16,
}

impl Image {
    /// Reads every entry of the base relocation directory.
    ///
    /// Returns an empty list when the image carries no relocations.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory is malformed or truncated.
    pub fn relocations(&self) -> Result<Vec<Relocation>> {
        let Some((directory_rva, directory_size)) =
            self.data_directory(DataDirectoryType::BaseRelocationTable)
        else {
            return Ok(Vec::new());
        };

        let directory_offset = self.rva_to_offset(directory_rva as usize)?;
        let directory = self.data_slice(directory_offset, directory_size as usize)?;
        let mut relocations = Vec::new();
        let mut block_offset = 0_usize;

        while block_offset + BLOCK_HEADER_SIZE <= directory.len() {
            let page_rva = read_le::<u32>(&directory[block_offset..])?;
            let block_size = read_le::<u32>(&directory[block_offset + 4..])? as usize;

            if block_size < BLOCK_HEADER_SIZE || block_offset + block_size > directory.len() {
                return Err(image_format_error!(
                    "Relocation block at {:#x} has invalid size {:#x}",
                    block_offset,
                    block_size
                ));
            }

            let entry_count = (block_size - BLOCK_HEADER_SIZE) / 2;
            let page_offset = self.rva_to_offset(page_rva as usize)?;

            for index in 0..entry_count {
                let entry =
                    read_le::<u16>(&directory[block_offset + BLOCK_HEADER_SIZE + index * 2..])?;
                let kind = entry >> 12;

                // Absolute entries are alignment padding.
                if kind == 0 {
                    continue;
                }

                relocations.push(Relocation {
                    offset: page_offset + usize::from(entry & 0x0FFF),
                    kind,
                });
            }

            block_offset += block_size;
        }

        Ok(relocations)
    }
}
