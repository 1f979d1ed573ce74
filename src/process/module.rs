//! Cached view of one foreign module and PEB-based module enumeration.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use widestring::U16String;

use super::native::{ModuleEntry, RemoteProcess};
use crate::{image::Image, Result};

/// One module loaded in the foreign process, with its image parsed on demand.
///
/// Parsing the backing file is deferred until a lookup actually needs the module's
/// export directory, then cached for the lifetime of the entry.
#[derive(Debug)]
pub struct Module {
    base: u64,
    path: PathBuf,
    image: OnceLock<Image>,
}

impl Module {
    /// Creates a module entry whose image is parsed lazily from `path`.
    pub fn new(base: u64, path: PathBuf) -> Module {
        Module {
            base,
            path,
            image: OnceLock::new(),
        }
    }

    /// Creates a module entry with a pre-parsed image.
    pub fn with_image(base: u64, path: PathBuf, image: Image) -> Module {
        let cell = OnceLock::new();
        let _ = cell.set(image);

        Module {
            base,
            path,
            image: cell,
        }
    }

    /// Base address of the module in the foreign process.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Full path of the module's backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the module, lowercased.
    #[must_use]
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    /// The parsed image of the module, loading it from disk on first use.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing file cannot be read or parsed.
    pub fn image(&self) -> Result<&Image> {
        if let Some(image) = self.image.get() {
            return Ok(image);
        }

        let image = Image::from_file(&self.path)?;

        Ok(self.image.get_or_init(|| image))
    }
}

/// Walks the foreign loader's `InLoadOrderModuleList` and returns every entry.
pub(crate) fn enumerate_modules(
    process: &(impl RemoteProcess + ?Sized),
) -> Result<Vec<ModuleEntry>> {
    let layout = process.architecture().layout();
    let pointer_size = process.architecture().pointer_size() as u64;

    let peb = process.peb_address()?;
    let ldr = process.read_ptr(peb + layout.peb.ldr)?;
    let list_head = ldr + layout.peb.in_load_order_list;

    let mut modules = Vec::new();
    let mut entry = process.read_ptr(list_head)?;

    while entry != 0 && entry != list_head {
        let base = process.read_ptr(entry + layout.peb.entry_dll_base)?;

        // FullDllName is a UNICODE_STRING: length, padding, then the buffer pointer.
        let name_length = process.read_u32(entry + layout.peb.entry_full_name)? & 0xFFFF;
        let name_buffer = process.read_ptr(entry + layout.peb.entry_full_name + pointer_size)?;

        if base != 0 && name_buffer != 0 {
            let mut raw_name = vec![0_u8; name_length as usize];
            process.read(name_buffer, &mut raw_name)?;

            let wide: Vec<u16> = raw_name
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            let path = U16String::from_vec(wide).to_string_lossy();

            modules.push(ModuleEntry {
                base,
                path: PathBuf::from(path),
            });
        }

        entry = process.read_ptr(entry)?;
    }

    Ok(modules)
}
