//! The immutable parsed view of one PE binary.
//!
//! [`Image`] wraps the raw bytes of a DLL (from memory or a memory-mapped file) and
//! exposes read-only queries over its headers and data directories: the section table,
//! import and delay-import descriptors, export lookup by name or ordinal, base
//! relocation entries, TLS callbacks, load-config data, and the embedded SxS manifest.
//!
//! Header and section parsing is delegated to `goblin`; the directory readers are
//! implemented here because the mapper needs details goblin does not surface: IAT
//! patch offsets, forwarder strings, relocation kinds, and the raw TLS directory
//! location.
//!
//! # Invariants
//!
//! Construction validates the image once: it must be a PE file with an optional
//! header, marked as a DLL, non-managed (no CLR runtime header), and of a supported
//! machine type. Malformed input is rejected at construction with
//! [`crate::Error::ImageFormat`], never later. Relative-address arithmetic only
//! accepts RVAs inside the header region or a section; anything else is invalid input.
//!
//! # Thread Safety
//!
//! [`Image`] is immutable after construction and can be shared freely across threads.

pub mod io;

mod exports;
mod imports;
mod loadconfig;
mod memory;
mod physical;
mod relocations;
mod resources;
mod tls;

pub use exports::Export;
pub use imports::{ImportDescriptor, ImportedFunction};
pub use loadconfig::{GuardFlags, LoadConfigData, SehTable};
pub use relocations::Relocation;
pub use tls::TlsDirectory;

use std::path::Path;

use crate::{arch::Architecture, Result};
use goblin::pe::{
    data_directories::DataDirectoryType, header::Header, optional_header::OptionalHeader,
    section_table::SectionTable, PE,
};
use memory::Memory;
use ouroboros::self_referencing;
use physical::Physical;

/// Backend trait for image data sources.
///
/// Abstracts over the source of the DLL bytes, allowing both in-memory and on-disk
/// (memory-mapped) representations. All implementations must be thread-safe.
pub trait Backend: Send + Sync {
    /// Returns a bounds-checked slice of the data at the given offset and length.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the entire data buffer.
    fn data(&self) -> &[u8];

    /// Returns the total length of the data buffer.
    fn len(&self) -> usize;
}

#[self_referencing]
/// An immutable parsed view of one PE binary, held as a byte buffer plus derived
/// offsets.
///
/// This is the file-layout form of the image (raw, not virtually mapped); all offsets
/// returned by the directory readers are file offsets into [`Image::data`].
pub struct Image {
    /// The underlying data source (memory or file).
    data: Box<dyn Backend>,
    /// The parsed PE structure, referencing the data.
    #[borrows(data)]
    #[not_covariant]
    pe: PE<'this>,
}

impl Image {
    /// Loads and validates a DLL image from the given path, memory-mapping the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a valid PE, is not a DLL,
    /// is a managed image, or targets an unsupported machine.
    pub fn from_file(file: &Path) -> Result<Image> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Loads and validates a DLL image from a memory buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is empty, is not a valid PE, is not a DLL,
    /// is a managed image, or targets an unsupported machine.
    pub fn from_mem(data: Vec<u8>) -> Result<Image> {
        let input = Memory::new(data);

        Self::load(input)
    }

    /// Internal loader for any backend.
    fn load<T: Backend + 'static>(data: T) -> Result<Image> {
        if data.len() == 0 {
            return Err(image_format_error!("The provided image was empty"));
        }

        let data = Box::new(data);

        Image::try_new(data, |data| {
            let pe = PE::parse(data.data())?;

            let Some(optional_header) = pe.header.optional_header else {
                return Err(image_format_error!("File does not have an OptionalHeader"));
            };

            if !pe.is_lib {
                return Err(image_format_error!("The provided file was not a valid DLL"));
            }

            if optional_header
                .data_directories
                .get_clr_runtime_header()
                .is_some()
            {
                return Err(image_format_error!(
                    "The provided file was a managed DLL and cannot be mapped"
                ));
            }

            if Architecture::from_machine(pe.header.coff_header.machine).is_none() {
                return Err(image_format_error!(
                    "Unsupported machine type {:#06x}",
                    pe.header.coff_header.machine
                ));
            }

            Ok(pe)
        })
    }

    /// Returns the total size of the loaded file in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.borrow_data().len()
    }

    /// Returns `true` if the file has a length of zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The architecture the image was built for.
    ///
    /// # Panics
    ///
    /// Never panics for a constructed image; the machine type is validated at load.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.with_pe(|pe| {
            Architecture::from_machine(pe.header.coff_header.machine)
                .expect("machine validated at load")
        })
    }

    /// Returns the preferred base address of the image.
    #[must_use]
    pub fn preferred_base(&self) -> u64 {
        self.with_pe(|pe| pe.image_base)
    }

    /// Returns a reference to the PE header.
    #[must_use]
    pub fn header(&self) -> &Header {
        self.with_pe(|pe| &pe.header)
    }

    /// Returns the optional header.
    ///
    /// # Panics
    ///
    /// Never panics for a constructed image; presence is validated at load.
    #[must_use]
    pub fn header_optional(&self) -> OptionalHeader {
        self.with_pe(|pe| pe.header.optional_header.expect("validated at load"))
    }

    /// The total virtual size of the mapped image in bytes.
    #[must_use]
    pub fn size_of_image(&self) -> u32 {
        self.header_optional().windows_fields.size_of_image
    }

    /// The combined size of all headers, rounded to the file alignment.
    #[must_use]
    pub fn size_of_headers(&self) -> u32 {
        self.header_optional().windows_fields.size_of_headers
    }

    /// The in-memory alignment of sections.
    #[must_use]
    pub fn section_alignment(&self) -> u32 {
        self.header_optional().windows_fields.section_alignment
    }

    /// The RVA of the image entry point, or zero when the image has none.
    #[must_use]
    pub fn entry_point(&self) -> u32 {
        self.with_pe(|pe| pe.entry as u32)
    }

    /// Returns an iterator over the section headers of the image.
    pub fn sections(&self) -> impl Iterator<Item = &SectionTable> {
        self.with_pe(|pe| pe.sections.iter())
    }

    /// Returns the RVA and size of a data directory entry, or `None` when the
    /// directory is absent or empty.
    #[must_use]
    pub fn data_directory(&self, dir_type: DataDirectoryType) -> Option<(u32, u32)> {
        self.with_pe(|pe| {
            pe.header
                .optional_header
                .expect("validated at load")
                .data_directories
                .dirs()
                .find(|(directory_type, directory)| {
                    *directory_type == dir_type
                        && directory.virtual_address != 0
                        && directory.size != 0
                })
                .map(|(_, directory)| (directory.virtual_address, directory.size))
        })
    }

    /// Converts an RVA into a file offset using the section table.
    ///
    /// RVAs inside the header region map to themselves; the containing section
    /// determines the linear mapping for everything else.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ImageFormat`] when the RVA falls outside the headers
    /// and every section.
    pub fn rva_to_offset(&self, rva: usize) -> Result<usize> {
        if rva < self.size_of_headers() as usize {
            return Ok(rva);
        }

        self.with_pe(|pe| {
            for section in &pe.sections {
                let virtual_address = section.virtual_address as usize;
                let virtual_size = section.virtual_size as usize;

                if rva >= virtual_address && rva < virtual_address + virtual_size {
                    return Ok(rva - virtual_address + section.pointer_to_raw_data as usize);
                }
            }

            Err(image_format_error!(
                "RVA {:#x} falls outside all sections",
                rva
            ))
        })
    }

    /// Converts a virtual address (relative to the preferred base) into an RVA.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ImageFormat`] when the address is below the preferred
    /// base or past the end of the image.
    pub fn va_to_rva(&self, va: u64) -> Result<u32> {
        let Some(rva) = va.checked_sub(self.preferred_base()) else {
            return Err(image_format_error!(
                "VA {:#x} lies below the preferred base",
                va
            ));
        };

        if rva >= u64::from(self.size_of_image()) {
            return Err(image_format_error!(
                "VA {:#x} lies past the end of the image",
                va
            ));
        }

        Ok(rva as u32)
    }

    /// Returns the entire image data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.borrow_data().data()
    }

    /// Returns a bounds-checked slice of the image data.
    ///
    /// # Errors
    ///
    /// Returns an error if the requested range is out of bounds.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.borrow_data().data_slice(offset, len)
    }

    /// Resolves the file offset of a data directory, when present.
    pub(crate) fn directory_offset(&self, dir_type: DataDirectoryType) -> Result<Option<usize>> {
        match self.data_directory(dir_type) {
            Some((rva, _)) => Ok(Some(self.rva_to_offset(rva as usize)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").finish_non_exhaustive()
    }
}
