//! TLS directory reader.

use goblin::pe::data_directories::DataDirectoryType;

use super::{io::read_le, Image};
use crate::{arch::Architecture, Result};

/// The parsed TLS directory of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsDirectory {
    /// File offset of the raw directory bytes.
    pub directory_offset: usize,
    /// Preferred-base virtual address of the `AddressOfIndex` slot.
    pub index_va: u64,
    /// The RVAs of the TLS callbacks, in directory order.
    pub callbacks: Vec<u32>,
}

impl Image {
    /// Reads the TLS directory, when the image has one.
    ///
    /// Callback addresses are converted from preferred-base VAs into RVAs so they
    /// stay meaningful after the image is rebased.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory is malformed or truncated.
    pub fn tls_directory(&self) -> Result<Option<TlsDirectory>> {
        let Some((directory_rva, _)) = self.data_directory(DataDirectoryType::TlsTable) else {
            return Ok(None);
        };

        let directory_offset = self.rva_to_offset(directory_rva as usize)?;

        let (index_va, callbacks_va) = match self.architecture() {
            Architecture::X86 => {
                let directory = self.data_slice(directory_offset, 24)?;
                (
                    u64::from(read_le::<u32>(&directory[0x8..])?),
                    u64::from(read_le::<u32>(&directory[0xC..])?),
                )
            }
            Architecture::X64 => {
                let directory = self.data_slice(directory_offset, 40)?;
                (
                    read_le::<u64>(&directory[0x10..])?,
                    read_le::<u64>(&directory[0x18..])?,
                )
            }
        };

        let mut callbacks = Vec::new();

        if callbacks_va != 0 {
            let pointer_size = self.architecture().pointer_size();
            let mut callback_offset =
                self.rva_to_offset(self.va_to_rva(callbacks_va)? as usize)?;

            loop {
                let callback_va = match self.architecture() {
                    Architecture::X86 => u64::from(
                        self.data_slice(callback_offset, 4).and_then(read_le::<u32>)?,
                    ),
                    Architecture::X64 => {
                        self.data_slice(callback_offset, 8).and_then(read_le::<u64>)?
                    }
                };

                if callback_va == 0 {
                    break;
                }

                callbacks.push(self.va_to_rva(callback_va)?);
                callback_offset += pointer_size;
            }
        }

        Ok(Some(TlsDirectory {
            directory_offset,
            index_va,
            callbacks,
        }))
    }
}
