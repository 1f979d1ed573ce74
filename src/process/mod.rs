//! The foreign-process interaction layer.
//!
//! [`ProcessContext`] wraps a [`RemoteProcess`] with everything the mapper needs to
//! talk to the target: a case-insensitive module cache fed from the foreign loader's
//! module list, export resolution including forwarder chains and API set contracts,
//! private `ntdll` symbol lookup, remote routine invocation through assembled call
//! stubs, and allocation from the foreign process heap.

pub mod native;

mod apiset;
mod module;
mod symbols;

#[cfg(windows)]
mod windows;

pub use module::Module;
pub use native::{CfgPolicy, ModuleEntry, Protection, RemoteProcess};
pub use symbols::{SymbolSource, SymbolTable};

#[cfg(windows)]
pub use windows::WindowsProcess;

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use crate::{
    arch::Architecture,
    stub::{self, CallDescriptor, CallingConvention},
    Error, Result,
};

/// `HEAP_ZERO_MEMORY`
const HEAP_ZERO_MEMORY: u64 = 0x8;

/// An exported function to resolve, by name or by biased ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionId<'a> {
    /// Resolve by export name.
    Name(&'a str),
    /// Resolve by export ordinal.
    Ordinal(u32),
}

/// Conversion of a captured return register into a typed result.
pub(crate) trait ReturnValue: Sized {
    /// Interprets the raw register value.
    fn from_register(raw: u64) -> Self;
}

impl ReturnValue for bool {
    fn from_register(raw: u64) -> bool {
        // BOOL and BOOLEAN results only define the low 32 bits.
        raw as u32 != 0
    }
}

impl ReturnValue for u32 {
    fn from_register(raw: u64) -> u32 {
        raw as u32
    }
}

impl ReturnValue for u64 {
    fn from_register(raw: u64) -> u64 {
        raw
    }
}

/// Cached, resolution-capable view of one foreign process.
pub struct ProcessContext {
    process: Arc<dyn RemoteProcess>,
    architecture: Architecture,
    modules: DashMap<String, Arc<Module>>,
    symbols: Box<dyn SymbolSource>,
    heap: OnceLock<u64>,
}

impl ProcessContext {
    /// Creates a context over a foreign process with the given symbol source.
    pub fn new(process: Arc<dyn RemoteProcess>, symbols: Box<dyn SymbolSource>) -> ProcessContext {
        let architecture = process.architecture();

        ProcessContext {
            process,
            architecture,
            modules: DashMap::new(),
            symbols,
            heap: OnceLock::new(),
        }
    }

    /// The pointer width of the foreign process.
    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// The underlying foreign process.
    #[must_use]
    pub fn process(&self) -> &dyn RemoteProcess {
        self.process.as_ref()
    }

    /// Rebuilds the module cache from the foreign loader's module list.
    ///
    /// # Errors
    ///
    /// Returns an error when the foreign loader structures cannot be read.
    pub fn refresh_modules(&self) -> Result<()> {
        self.modules.clear();

        for entry in module::enumerate_modules(self.process.as_ref())? {
            let module = Module::new(entry.base, entry.path);
            self.modules.insert(module.name(), Arc::new(module));
        }

        Ok(())
    }

    /// Inserts a module into the cache directly, bypassing enumeration.
    pub fn insert_module(&self, module: Module) {
        self.modules.insert(module.name(), Arc::new(module));
    }

    /// Drops every cached module so the next lookup re-enumerates.
    pub fn clear_module_cache(&self) {
        self.modules.clear();
    }

    /// Canonicalises a dependency name: API set contracts resolve to their host
    /// module, and the result is lowercased.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolution`] for a contract absent from the namespace.
    pub fn resolve_module_name(&self, module_name: &str) -> Result<String> {
        if apiset::is_api_set(module_name) {
            return apiset::resolve_api_set(self.process.as_ref(), module_name)?
                .map(|host| host.to_lowercase())
                .ok_or_else(|| {
                    Error::Resolution(format!("Failed to resolve API set {module_name}"))
                });
        }

        Ok(module_name.to_lowercase())
    }

    /// Looks up a module by name, refreshing the cache once on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolution`] when the module is not loaded in the foreign
    /// process.
    pub fn get_module(&self, module_name: &str) -> Result<Arc<Module>> {
        let name = self.resolve_module_name(module_name)?;

        if let Some(module) = self.modules.get(&name) {
            return Ok(module.clone());
        }

        self.refresh_modules()?;

        self.modules
            .get(&name)
            .map(|module| module.clone())
            .ok_or_else(|| Error::Resolution(format!("Failed to find module {module_name}")))
    }

    /// Resolves an export of a foreign module to its absolute address, following
    /// forwarder chains across modules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolution`] when the module or export does not exist.
    pub fn get_function_address(&self, module_name: &str, function: FunctionId) -> Result<u64> {
        let module = self.get_module(module_name)?;
        let export = match function {
            FunctionId::Name(name) => module.image()?.export_by_name(name)?,
            FunctionId::Ordinal(ordinal) => module.image()?.export_by_ordinal(ordinal)?,
        };

        let Some(export) = export else {
            return Err(Error::Resolution(format!(
                "Failed to find export {function:?} in {module_name}"
            )));
        };

        match export.forwarder {
            Some(forwarder) => self.resolve_forwarded_export(&forwarder),
            None => Ok(module.base() + u64::from(export.address)),
        }
    }

    /// Address of a private symbol inside the foreign `ntdll`.
    ///
    /// # Errors
    ///
    /// Returns an error when `ntdll` or the symbol cannot be resolved.
    pub fn get_ntdll_symbol_address(&self, symbol_name: &str) -> Result<u64> {
        let ntdll = self.get_module("ntdll.dll")?;
        let rva = self.symbols.resolve(self.architecture, symbol_name)?;

        Ok(ntdll.base() + u64::from(rva))
    }

    /// Follows a forwarder chain until it lands on a real export.
    ///
    /// A chain that loops back onto itself terminates at the entry that closed the
    /// loop: when the next forwarder string matches either the current hop or the
    /// one that produced it, resolution stops at the current entry's raw address.
    fn resolve_forwarded_export(&self, forwarder: &str) -> Result<u64> {
        let mut previous: Option<String> = None;
        let mut current = forwarder.to_owned();

        loop {
            let Some((module_part, function_part)) = current.split_once('.') else {
                return Err(Error::Resolution(format!(
                    "Malformed forwarder string {current}"
                )));
            };

            let module_name = format!("{module_part}.dll");
            let module = self.get_module(&module_name)?;

            let export = if let Some(ordinal) = function_part.strip_prefix('#') {
                let ordinal: u32 = ordinal.parse().map_err(|_| {
                    Error::Resolution(format!("Malformed forwarder ordinal in {current}"))
                })?;
                module.image()?.export_by_ordinal(ordinal)?
            } else {
                module.image()?.export_by_name(function_part)?
            };

            let Some(export) = export else {
                return Err(Error::Resolution(format!(
                    "Failed to resolve forwarder {current}"
                )));
            };

            match export.forwarder {
                Some(next) if next != current && previous.as_deref() != Some(next.as_str()) => {
                    previous = Some(std::mem::replace(&mut current, next));
                }
                // A real export, or a cycle closing back on this entry.
                _ => return Ok(module.base() + u64::from(export.address)),
            }
        }
    }

    /// Invokes a routine in the foreign process, discarding its result.
    ///
    /// # Errors
    ///
    /// Returns an error when the stub cannot be staged or the thread fails.
    pub(crate) fn call_routine(
        &self,
        convention: CallingConvention,
        address: u64,
        arguments: &[u64],
    ) -> Result<()> {
        self.execute_stub(&CallDescriptor {
            address,
            convention,
            arguments,
            return_address: None,
        })?;

        Ok(())
    }

    /// Invokes a routine in the foreign process and captures its return register.
    ///
    /// # Errors
    ///
    /// Returns an error when the stub cannot be staged or the thread fails.
    pub(crate) fn call_routine_returning<T: ReturnValue>(
        &self,
        convention: CallingConvention,
        address: u64,
        arguments: &[u64],
    ) -> Result<T> {
        let capture = self
            .process
            .allocate(self.architecture.pointer_size(), Protection::READ_WRITE)?;

        let result = self.execute_stub(&CallDescriptor {
            address,
            convention,
            arguments,
            return_address: Some(capture),
        });

        let raw = result.and_then(|()| self.process.read_ptr(capture));

        // The capture buffer is released regardless of the call outcome.
        let free_result = self.process.free(capture);
        let raw = raw?;
        free_result?;

        Ok(T::from_register(raw))
    }

    /// Stages a call stub in the foreign process and runs it to completion.
    fn execute_stub(&self, call: &CallDescriptor) -> Result<()> {
        let stub = stub::assemble(self.architecture, call);
        let stub_address = self.process.allocate(stub.len(), Protection::EXECUTE_READ)?;

        let run = self
            .process
            .write(stub_address, &stub)
            .and_then(|()| self.process.spawn_thread(stub_address));

        let free_result = self.process.free(stub_address);
        run?;
        free_result
    }

    /// Address of the foreign process's default heap, read from its PEB once.
    fn heap_address(&self) -> Result<u64> {
        if let Some(heap) = self.heap.get() {
            return Ok(*heap);
        }

        let layout = self.architecture.layout();
        let peb = self.process.peb_address()?;
        let heap = self.process.read_ptr(peb + layout.peb.process_heap)?;

        Ok(*self.heap.get_or_init(|| heap))
    }

    /// Allocates zeroed memory from the foreign process heap.
    ///
    /// # Errors
    ///
    /// Returns an error when the remote allocation fails.
    pub(crate) fn heap_alloc(&self, size: usize) -> Result<u64> {
        let routine = self.get_function_address("ntdll.dll", FunctionId::Name("RtlAllocateHeap"))?;
        let heap = self.heap_address()?;

        let address: u64 = self.call_routine_returning(
            CallingConvention::StdCall,
            routine,
            &[heap, HEAP_ZERO_MEMORY, size as u64],
        )?;

        if address == 0 {
            return Err(Error::remote("RtlAllocateHeap", 0));
        }

        Ok(address)
    }

    /// Returns memory to the foreign process heap.
    ///
    /// # Errors
    ///
    /// Returns an error when the remote free fails.
    pub(crate) fn heap_free(&self, address: u64) -> Result<()> {
        let routine = self.get_function_address("ntdll.dll", FunctionId::Name("RtlFreeHeap"))?;
        let heap = self.heap_address()?;

        let freed: bool =
            self.call_routine_returning(CallingConvention::StdCall, routine, &[heap, 0, address])?;

        if !freed {
            return Err(Error::remote("RtlFreeHeap", 0));
        }

        Ok(())
    }
}
