//! The mapping and unmapping state machine.
//!
//! [`LibraryMapper`] owns one mapping session: the pristine DLL bytes, the foreign
//! base address once mapped, and the registry state reserved along the way. The
//! map sequence patches a local staged copy of the image first (IAT and
//! relocations, both data-parallel), then commits it to the foreign process
//! section by section, then wires up CFG, the security cookie, exception dispatch
//! and TLS, and finally runs the initialisation routines. Every committed step
//! pushes its reversal onto an undo stack; a failure unwinds the stack LIFO with
//! each action's own failure swallowed, so a failed `map` leaves nothing behind.

mod flags;

pub use flags::MappingFlags;

use std::{path::Path, sync::Arc};

use goblin::pe::{data_directories::DataDirectoryType, section_table};
use rand::RngCore;
use rayon::prelude::*;
use widestring::U16CString;

use crate::{
    arch::Architecture,
    image::{
        io::{read_le, write_le_at},
        Image,
    },
    process::{FunctionId, Module, ProcessContext, Protection, RemoteProcess, SymbolSource},
    registry::{exceptions, exceptions::ExceptionTableData, tls, TlsBinding},
    resolve::FileResolver,
    stub::CallingConvention,
    Error, Result,
};

/// `DLL_PROCESS_ATTACH`
const DLL_PROCESS_ATTACH: u64 = 1;
/// `DLL_PROCESS_DETACH`
const DLL_PROCESS_DETACH: u64 = 0;

/// Reversal actions recorded as map steps commit, unwound LIFO on failure.
enum CleanupAction {
    FreeImage,
    UnloadDependencies,
    RemoveExceptionEntry,
    RemoveTlsEntry,
}

/// Maps one DLL into one foreign process and reverses the mapping on demand.
pub struct LibraryMapper {
    context: ProcessContext,
    resolver: Box<dyn FileResolver>,
    flags: MappingFlags,
    image: Image,
    dll_bytes: Vec<u8>,
    base_address: u64,
    dependencies: Vec<u64>,
    tls_binding: Option<TlsBinding>,
    exception_registered: bool,
    mapped: bool,
}

impl LibraryMapper {
    /// Creates a mapper for in-memory DLL bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when the process is dead or of a different
    /// architecture than the image, or when mapping a 64-bit image from a 32-bit
    /// host; image validation failures surface as [`Error::ImageFormat`].
    pub fn new(
        process: Arc<dyn RemoteProcess>,
        dll_bytes: Vec<u8>,
        symbols: Box<dyn SymbolSource>,
        resolver: Box<dyn FileResolver>,
        flags: MappingFlags,
    ) -> Result<LibraryMapper> {
        let image = Image::from_mem(dll_bytes.clone())?;

        Self::build(process, image, dll_bytes, symbols, resolver, flags)
    }

    /// Creates a mapper for a DLL on disk.
    ///
    /// The DLL's own directory takes part in dependency resolution when the
    /// supplied resolver is built with it; this constructor only reads the bytes.
    ///
    /// # Errors
    ///
    /// Same conditions as [`LibraryMapper::new`], plus file read failures.
    pub fn from_file(
        process: Arc<dyn RemoteProcess>,
        dll_path: &Path,
        symbols: Box<dyn SymbolSource>,
        resolver: Box<dyn FileResolver>,
        flags: MappingFlags,
    ) -> Result<LibraryMapper> {
        let dll_bytes = std::fs::read(dll_path)?;
        let image = Image::from_mem(dll_bytes.clone())?;

        Self::build(process, image, dll_bytes, symbols, resolver, flags)
    }

    fn build(
        process: Arc<dyn RemoteProcess>,
        image: Image,
        dll_bytes: Vec<u8>,
        symbols: Box<dyn SymbolSource>,
        resolver: Box<dyn FileResolver>,
        flags: MappingFlags,
    ) -> Result<LibraryMapper> {
        if !process.is_running() {
            return Err(Error::InvalidInput("The process is not running".into()));
        }

        if image.architecture() != process.architecture() {
            return Err(Error::InvalidInput(
                "The image and process architectures differ".into(),
            ));
        }

        if process.architecture() == Architecture::X64 && cfg!(target_pointer_width = "32") {
            return Err(Error::InvalidInput(
                "Cannot map into a wider process than the host".into(),
            ));
        }

        Ok(LibraryMapper {
            context: ProcessContext::new(process, symbols),
            resolver,
            flags,
            image,
            dll_bytes,
            base_address: 0,
            dependencies: Vec::new(),
            tls_binding: None,
            exception_registered: false,
            mapped: false,
        })
    }

    /// The base address of the mapped image, or zero when unmapped.
    #[must_use]
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// The process context driving the foreign process.
    #[must_use]
    pub fn context(&self) -> &ProcessContext {
        &self.context
    }

    /// Maps the image into the foreign process.
    ///
    /// A no-op when already mapped. On failure every committed step is reversed
    /// and the mapper returns to the unmapped state with no foreign allocations
    /// left behind.
    ///
    /// # Errors
    ///
    /// Any resolution or foreign-process failure aborts the mapping; the original
    /// error is returned after rollback.
    pub fn map(&mut self) -> Result<()> {
        if self.mapped {
            return Ok(());
        }

        // Patches always start from the pristine bytes so a retried map never
        // relocates twice.
        let mut staged = self.dll_bytes.clone();
        let mut cleanup = Vec::new();

        match self.run_map_sequence(&mut staged, &mut cleanup) {
            Ok(()) => {
                self.mapped = true;
                log::info!("Mapped image at {:#x}", self.base_address);
                Ok(())
            }
            Err(error) => {
                log::warn!("Mapping failed, rolling back: {error}");
                self.rollback(cleanup);
                Err(error)
            }
        }
    }

    /// Unmaps the image, reversing every map step.
    ///
    /// A no-op when already unmapped. All teardown steps are attempted even when
    /// one fails; only the first failure is surfaced, and the mapper ends in the
    /// unmapped state regardless.
    ///
    /// # Errors
    ///
    /// Returns the first teardown failure encountered.
    pub fn unmap(&mut self) -> Result<()> {
        if !self.mapped {
            return Ok(());
        }

        let mut first_error: Option<Error> = None;

        if !self.flags.contains(MappingFlags::SKIP_INIT_ROUTINES) {
            if let Err(error) = self.call_initialisation_routines(DLL_PROCESS_DETACH) {
                first_error.get_or_insert(error);
            }
        }

        if let Some(binding) = self.tls_binding.take() {
            if let Err(error) = tls::remove_tls_entry(&self.context, &binding) {
                first_error.get_or_insert(error);
            }
        }

        if self.exception_registered {
            if let Err(error) =
                exceptions::remove_function_table_entry(&self.context, self.base_address)
            {
                first_error.get_or_insert(error);
            }
            self.exception_registered = false;
        }

        if let Err(error) = self.unload_dependencies() {
            first_error.get_or_insert(error);
        }

        if let Err(error) = self.context.process().free(self.base_address) {
            first_error.get_or_insert(error);
        }

        self.base_address = 0;
        self.mapped = false;

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn run_map_sequence(
        &mut self,
        staged: &mut Vec<u8>,
        cleanup: &mut Vec<CleanupAction>,
    ) -> Result<()> {
        self.allocate_image(cleanup)?;
        self.load_dependencies(cleanup)?;
        self.build_import_address_table(staged)?;
        self.relocate_image(staged)?;
        self.map_headers(staged)?;
        self.map_sections(staged)?;
        self.initialise_control_flow_guard()?;
        self.initialise_security_cookie()?;
        self.insert_exception_handlers(cleanup)?;
        self.initialise_tls_data(staged, cleanup)?;

        if !self.flags.contains(MappingFlags::SKIP_INIT_ROUTINES) {
            self.call_initialisation_routines(DLL_PROCESS_ATTACH)?;
        }

        Ok(())
    }

    fn rollback(&mut self, mut cleanup: Vec<CleanupAction>) {
        while let Some(action) = cleanup.pop() {
            let result = match action {
                CleanupAction::FreeImage => {
                    let result = self.context.process().free(self.base_address);
                    self.base_address = 0;
                    result
                }
                CleanupAction::UnloadDependencies => self.unload_dependencies(),
                CleanupAction::RemoveExceptionEntry => {
                    self.exception_registered = false;
                    exceptions::remove_function_table_entry(&self.context, self.base_address)
                }
                CleanupAction::RemoveTlsEntry => match self.tls_binding.take() {
                    Some(binding) => tls::remove_tls_entry(&self.context, &binding),
                    None => Ok(()),
                },
            };

            if let Err(error) = result {
                log::warn!("Rollback step failed: {error}");
            }
        }
    }

    /// Step 1: reserve the foreign block at the image's full virtual size.
    fn allocate_image(&mut self, cleanup: &mut Vec<CleanupAction>) -> Result<()> {
        self.base_address = self
            .context
            .process()
            .allocate(self.image.size_of_image() as usize, Protection::READ_ONLY)?;

        cleanup.push(CleanupAction::FreeImage);
        Ok(())
    }

    /// Step 2: load every dependency through the foreign loader itself.
    fn load_dependencies(&mut self, cleanup: &mut Vec<CleanupAction>) -> Result<()> {
        let descriptors = self.image.import_descriptors()?;

        if descriptors.is_empty() {
            return Ok(());
        }

        cleanup.push(CleanupAction::UnloadDependencies);

        let load_library = self
            .context
            .get_function_address("kernel32.dll", FunctionId::Name("LoadLibraryW"))?;

        for descriptor in &descriptors {
            let resolved_name = self.context.resolve_module_name(&descriptor.name)?;
            let Some(file_path) = self.resolver.resolve(&resolved_name) else {
                return Err(Error::Resolution(format!(
                    "Failed to resolve the dependency file path for {}",
                    descriptor.name
                )));
            };

            let base = self.load_remote_library(load_library, &file_path)?;

            self.dependencies.push(base);
            self.context.insert_module(Module::new(base, file_path));
        }

        Ok(())
    }

    /// Writes a path into the foreign process and calls `LoadLibraryW` on it.
    fn load_remote_library(&self, load_library: u64, file_path: &Path) -> Result<u64> {
        let wide = U16CString::from_os_str(file_path.as_os_str())
            .map_err(|_| Error::InvalidInput("Dependency path contains a NUL".into()))?;
        let path_bytes: Vec<u8> = wide
            .as_slice_with_nul()
            .iter()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();

        let path_address = self
            .context
            .process()
            .allocate(path_bytes.len(), Protection::READ_WRITE)?;

        let load = || -> Result<u64> {
            self.context.process().write(path_address, &path_bytes)?;

            self.context.call_routine_returning::<u64>(
                CallingConvention::StdCall,
                load_library,
                &[path_address],
            )
        };

        let result = load();
        // The path buffer is transient regardless of the call outcome.
        let _ = self.context.process().free(path_address);
        let base = result?;

        if base == 0 {
            return Err(Error::Resolution(format!(
                "The foreign loader failed to load {}",
                file_path.display()
            )));
        }

        Ok(base)
    }

    /// Step 3: resolve every import and patch the staged IAT slots.
    fn build_import_address_table(&self, staged: &mut [u8]) -> Result<()> {
        let descriptors = self.image.import_descriptors()?;
        let functions: Vec<(&str, &crate::image::ImportedFunction)> = descriptors
            .iter()
            .flat_map(|descriptor| {
                descriptor
                    .functions
                    .iter()
                    .map(move |function| (descriptor.name.as_str(), function))
            })
            .collect();

        // Resolution touches no shared mutable state, so it fans out; the patches
        // land on disjoint offsets and are applied serially afterwards.
        let patches: Vec<(usize, u64)> = functions
            .par_iter()
            .map(|(module_name, function)| {
                let function_id = match &function.name {
                    Some(name) => FunctionId::Name(name),
                    None => FunctionId::Ordinal(u32::from(function.ordinal)),
                };

                let address = self.context.get_function_address(module_name, function_id)?;

                Ok((function.iat_offset, address))
            })
            .collect::<Result<Vec<_>>>()?;

        for (offset, address) in patches {
            self.write_staged_pointer(staged, offset, address)?;
        }

        Ok(())
    }

    /// Step 4: apply the base relocation delta to the staged copy.
    fn relocate_image(&self, staged: &mut [u8]) -> Result<()> {
        let delta = self.base_address.wrapping_sub(self.image.preferred_base());

        if delta == 0 {
            return Ok(());
        }

        let relocation_kind = self.image.architecture().layout().relocation_kind;
        let relocations = self.image.relocations()?;
        let snapshot: &[u8] = staged;

        let patches: Vec<(usize, u64)> = relocations
            .par_iter()
            .filter(|relocation| relocation.kind == relocation_kind)
            .map(|relocation| {
                let slot = snapshot.get(relocation.offset..).ok_or_else(|| {
                    image_format_error!("Relocation at {:#x} is truncated", relocation.offset)
                })?;

                let value = match self.image.architecture() {
                    Architecture::X86 => u64::from(read_le::<u32>(slot)?),
                    Architecture::X64 => read_le::<u64>(slot)?,
                };

                Ok((relocation.offset, value.wrapping_add(delta)))
            })
            .collect::<Result<Vec<_>>>()?;

        for (offset, value) in patches {
            self.write_staged_pointer(staged, offset, value)?;
        }

        Ok(())
    }

    fn write_staged_pointer(&self, staged: &mut [u8], offset: usize, value: u64) -> Result<()> {
        match self.image.architecture() {
            Architecture::X86 => write_le_at::<u32>(staged, offset, value as u32),
            Architecture::X64 => write_le_at::<u64>(staged, offset, value),
        }
    }

    /// Step 5a: commit the header region, unless suppressed.
    fn map_headers(&self, staged: &[u8]) -> Result<()> {
        if self.flags.contains(MappingFlags::DISCARD_HEADERS) {
            return Ok(());
        }

        let header_size = self.image.size_of_headers() as usize;
        let headers = staged
            .get(..header_size)
            .ok_or_else(|| image_format_error!("Header region exceeds the file size"))?;

        self.write_foreign(self.base_address, headers)
    }

    /// Step 5b: commit each section's raw bytes and apply its declared protection.
    fn map_sections(&self, staged: &[u8]) -> Result<()> {
        let alignment = self.image.section_alignment() as usize;
        let sections: Vec<_> = self.image.sections().cloned().collect();

        for section in sections {
            if section.characteristics & section_table::IMAGE_SCN_MEM_DISCARDABLE != 0 {
                continue;
            }

            let virtual_address = self.base_address + u64::from(section.virtual_address);
            let raw_size = section.size_of_raw_data as usize;

            if raw_size > 0 {
                let raw_offset = section.pointer_to_raw_data as usize;
                let raw = staged.get(raw_offset..raw_offset + raw_size).ok_or_else(|| {
                    image_format_error!("Section data at {:#x} exceeds the file size", raw_offset)
                })?;
                self.write_foreign(virtual_address, raw)?;
            }

            let protected_size = align_up(
                raw_size.max(section.virtual_size as usize),
                alignment,
            );

            self.context.process().protect(
                virtual_address,
                protected_size,
                section_protection(section.characteristics),
            )?;
        }

        Ok(())
    }

    /// Step 6: point the image's CFG check/dispatch pointers at the foreign
    /// process's own validators.
    fn initialise_control_flow_guard(&self) -> Result<()> {
        let load_config = self.image.load_config()?;

        if !load_config
            .guard_flags
            .contains(crate::image::GuardFlags::CF_INSTRUMENTED)
        {
            return Ok(());
        }

        let policy = self.context.process().cfg_policy();

        if !policy.enabled {
            return Ok(());
        }

        let Some((directory_rva, _)) = self.image.data_directory(DataDirectoryType::LoadConfigTable)
        else {
            return Ok(());
        };

        // The stricter export-suppression validators only apply when both sides
        // carry the feature.
        let suppressed = policy.export_suppression
            && load_config
                .guard_flags
                .contains(crate::image::GuardFlags::EXPORT_SUPPRESSION_INFO_PRESENT);

        let check_symbol = if suppressed {
            "LdrpValidateUserCallTargetES"
        } else {
            "LdrpValidateUserCallTarget"
        };
        let check_address = self.context.get_ntdll_symbol_address(check_symbol)?;

        let layout = self.image.architecture().layout();
        let directory_address = self.base_address + u64::from(directory_rva);

        self.write_foreign_pointer(
            directory_address + layout.guard_check_offset as u64,
            check_address,
        )?;

        if let Some(dispatch_offset) = layout.guard_dispatch_offset {
            let dispatch_symbol = if suppressed {
                "LdrpDispatchUserCallTargetES"
            } else {
                "LdrpDispatchUserCallTarget"
            };
            let dispatch_address = self.context.get_ntdll_symbol_address(dispatch_symbol)?;

            self.write_foreign_pointer(
                directory_address + dispatch_offset as u64,
                dispatch_address,
            )?;
        }

        Ok(())
    }

    /// Step 7: install a freshly rolled security cookie.
    fn initialise_security_cookie(&self) -> Result<()> {
        let load_config = self.image.load_config()?;

        if load_config
            .guard_flags
            .contains(crate::image::GuardFlags::SECURITY_COOKIE_UNUSED)
        {
            return Ok(());
        }

        let Some(cookie_rva) = load_config.security_cookie_rva else {
            return Ok(());
        };

        let layout = self.image.architecture().layout();
        let mut bytes = vec![0_u8; layout.cookie_size];
        let mut rng = rand::thread_rng();

        // A cookie equal to the compiler default defeats the check entirely.
        loop {
            rng.fill_bytes(&mut bytes);

            if bytes != layout.default_cookie {
                break;
            }
        }

        let mut cookie = 0_u64;
        for (index, byte) in bytes.iter().enumerate() {
            cookie |= u64::from(*byte) << (index * 8);
        }

        self.write_foreign_pointer(self.base_address + u64::from(cookie_rva), cookie)
    }

    /// Step 8: register the exception directory with the inverted function table.
    fn insert_exception_handlers(&mut self, cleanup: &mut Vec<CleanupAction>) -> Result<()> {
        let data = match self.image.architecture() {
            Architecture::X86 => {
                let Some(seh_table) = self.image.load_config()?.seh_table else {
                    return Ok(());
                };

                ExceptionTableData {
                    directory_rva: seh_table.rva,
                    size_or_count: seh_table.handler_count,
                }
            }
            Architecture::X64 => {
                let Some((rva, size)) = self.image.data_directory(DataDirectoryType::ExceptionTable)
                else {
                    return Ok(());
                };

                ExceptionTableData {
                    directory_rva: rva,
                    size_or_count: size,
                }
            }
        };

        exceptions::insert_function_table_entry(
            &self.context,
            self.base_address,
            self.image.size_of_image(),
            &data,
        )?;

        self.exception_registered = true;
        cleanup.push(CleanupAction::RemoveExceptionEntry);

        Ok(())
    }

    /// Step 9: reserve a TLS index, splice the list entry, and publish the index
    /// into the mapped image.
    fn initialise_tls_data(
        &mut self,
        staged: &[u8],
        cleanup: &mut Vec<CleanupAction>,
    ) -> Result<()> {
        let Some(directory) = self.image.tls_directory()? else {
            return Ok(());
        };

        let layout = self.image.architecture().layout();
        // The staged copy holds the relocated directory the list entry must carry.
        let directory_bytes = staged
            .get(
                directory.directory_offset
                    ..directory.directory_offset + layout.tls_entry.directory_size,
            )
            .ok_or_else(|| image_format_error!("TLS directory exceeds the file size"))?;

        let binding = tls::insert_tls_entry(&self.context, directory_bytes)?;
        self.tls_binding = Some(binding);
        cleanup.push(CleanupAction::RemoveTlsEntry);

        let index_rva = self.image.va_to_rva(directory.index_va)?;
        self.write_foreign(
            self.base_address + u64::from(index_rva),
            &binding.index.to_le_bytes(),
        )
    }

    /// Step 10: run TLS callbacks and the entry point with the given reason.
    fn call_initialisation_routines(&self, reason: u64) -> Result<()> {
        let arguments = [self.base_address, reason, 0];

        if let Some(directory) = self.image.tls_directory()? {
            for callback_rva in directory.callbacks {
                self.context.call_routine(
                    CallingConvention::StdCall,
                    self.base_address + u64::from(callback_rva),
                    &arguments,
                )?;
            }
        }

        let entry_point = self.image.entry_point();

        if entry_point == 0 {
            return Ok(());
        }

        let succeeded: bool = self.context.call_routine_returning(
            CallingConvention::StdCall,
            self.base_address + u64::from(entry_point),
            &arguments,
        )?;

        // A detach refusal is not actionable; an attach refusal is fatal.
        if !succeeded && reason == DLL_PROCESS_ATTACH {
            return Err(Error::EntryPoint(
                "The entry point reported initialisation failure".into(),
            ));
        }

        Ok(())
    }

    /// Calls the foreign `FreeLibrary` for every dependency, then invalidates the
    /// module cache.
    fn unload_dependencies(&mut self) -> Result<()> {
        if self.dependencies.is_empty() {
            return Ok(());
        }

        let free_library = self
            .context
            .get_function_address("kernel32.dll", FunctionId::Name("FreeLibrary"))?;

        let mut first_error = None;

        for base in self.dependencies.drain(..) {
            let result = self.context.call_routine_returning::<bool>(
                CallingConvention::StdCall,
                free_library,
                &[base],
            );

            match result {
                Ok(true) => {}
                Ok(false) => {
                    first_error.get_or_insert(Error::remote("FreeLibrary", 0));
                }
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        self.context.clear_module_cache();

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Writes into the foreign image, lifting the page protection for the write
    /// and restoring it afterwards.
    fn write_foreign(&self, address: u64, data: &[u8]) -> Result<()> {
        let process = self.context.process();
        let previous = process.protect(address, data.len(), Protection::READ_WRITE)?;

        let result = process.write(address, data);
        let restore = process.protect(address, data.len(), previous);

        result?;
        restore?;

        Ok(())
    }

    fn write_foreign_pointer(&self, address: u64, value: u64) -> Result<()> {
        match self.image.architecture() {
            Architecture::X86 => self.write_foreign(address, &(value as u32).to_le_bytes()),
            Architecture::X64 => self.write_foreign(address, &value.to_le_bytes()),
        }
    }
}

/// Maps section characteristics onto a page protection.
fn section_protection(characteristics: u32) -> Protection {
    let executable = characteristics & section_table::IMAGE_SCN_MEM_EXECUTE != 0;
    let writable = characteristics & section_table::IMAGE_SCN_MEM_WRITE != 0;
    let readable = characteristics & section_table::IMAGE_SCN_MEM_READ != 0;

    // Writable sections without read access map to the write-copy protections.
    let mut protection = match (executable, writable, readable) {
        (true, true, true) => Protection::EXECUTE_READ_WRITE,
        (true, true, false) => Protection::EXECUTE_WRITE_COPY,
        (true, false, true) => Protection::EXECUTE_READ,
        (true, false, false) => Protection::EXECUTE,
        (false, true, true) => Protection::READ_WRITE,
        (false, true, false) => Protection::WRITE_COPY,
        (false, false, true) => Protection::READ_ONLY,
        (false, false, false) => Protection::NO_ACCESS,
    };

    if characteristics & section_table::IMAGE_SCN_MEM_NOT_CACHED != 0 {
        protection |= Protection::NO_CACHE;
    }

    protection
}

fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }

    value.div_ceil(alignment) * alignment
}
