//! Shared test fixtures: a synthetic DLL builder, an in-memory foreign-process
//! double, and an emulated loader environment (`ntdll` state, PEB, heap).

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use mapldr::{
    process::{Module, ProcessContext, Protection, RemoteProcess, SymbolTable},
    resolve::FileResolver,
    Architecture, Error, Image, Result,
};

// ---------------------------------------------------------------------------
// Synthetic DLL builder (x64, PE32+)
// ---------------------------------------------------------------------------

/// Preferred base of every built test image.
pub const IMAGE_BASE: u64 = 0x1_8000_0000;
/// RVA of the `.text` section.
pub const TEXT_RVA: u32 = 0x1000;
/// RVA of the `.rdata` section holding every directory payload.
pub const RDATA_RVA: u32 = 0x2000;
/// RVA of the `.data` section.
pub const DATA_RVA: u32 = 0x3000;
/// Declared virtual size of every built test image.
pub const SIZE_OF_IMAGE: u32 = 0x4000;
/// RVA of the TLS index slot inside `.data`.
pub const TLS_INDEX_RVA: u32 = DATA_RVA;
/// File offset where the `.rdata` section content starts.
pub const RDATA_FILE_OFFSET: usize = 0x600;

const SIZE_OF_HEADERS: u32 = 0x400;
const TEXT_RAW: usize = 0x400;
const RDATA_RAW: usize = 0x600;
const RDATA_CAPACITY: usize = 0x800;
const DATA_RAW: usize = 0xE00;
const DATA_SIZE: usize = 0x200;
const FILE_SIZE: usize = 0x1000;

/// Where an export points.
pub enum ExportTarget {
    /// A regular export at the given RVA.
    Rva(u32),
    /// A forwarded export (`"TARGETDLL.Name"` or `"TARGETDLL.#ordinal"`).
    Forward(&'static str),
}

/// One imported function of a built image.
pub enum ImportFn {
    /// Import by name.
    Name(&'static str),
    /// Import by ordinal.
    Ordinal(u16),
}

/// Builds minimal but structurally valid PE32+ DLLs for tests.
pub struct PeBuilder {
    entry_rva: u32,
    dll: bool,
    rdata: Vec<u8>,
    data: Vec<u8>,
    dirs: [(u32, u32); 16],
    exports: Option<(String, Vec<(String, ExportTarget)>)>,
    imports: Vec<(String, Vec<ImportFn>)>,
    relocations: Vec<u32>,
    tls_callbacks: Option<Vec<u32>>,
    load_config: Option<(Option<u32>, u32)>,
    exception_entry: bool,
    clr_header: bool,
}

impl PeBuilder {
    pub fn new() -> PeBuilder {
        PeBuilder {
            entry_rva: 0,
            dll: true,
            rdata: Vec::new(),
            data: vec![0; DATA_SIZE],
            dirs: [(0, 0); 16],
            exports: None,
            imports: Vec::new(),
            relocations: Vec::new(),
            tls_callbacks: None,
            load_config: None,
            exception_entry: false,
            clr_header: false,
        }
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_rva = rva;
        self
    }

    pub fn not_dll(mut self) -> Self {
        self.dll = false;
        self
    }

    pub fn clr_header(mut self) -> Self {
        self.clr_header = true;
        self
    }

    pub fn exports(mut self, dll_name: &str, items: Vec<(&str, ExportTarget)>) -> Self {
        self.exports = Some((
            dll_name.to_owned(),
            items
                .into_iter()
                .map(|(name, target)| (name.to_owned(), target))
                .collect(),
        ));
        self
    }

    pub fn import(mut self, module: &str, functions: Vec<ImportFn>) -> Self {
        self.imports.push((module.to_owned(), functions));
        self
    }

    /// Registers a 64-bit relocation for the slot at `rva`.
    pub fn relocation(mut self, rva: u32) -> Self {
        self.relocations.push(rva);
        self
    }

    pub fn tls(mut self, callback_rvas: Vec<u32>) -> Self {
        self.tls_callbacks = Some(callback_rvas);
        self
    }

    pub fn load_config(mut self, cookie_rva: Option<u32>, guard_flags: u32) -> Self {
        self.load_config = Some((cookie_rva, guard_flags));
        self
    }

    pub fn exception_directory(mut self) -> Self {
        self.exception_entry = true;
        self
    }

    /// Presets a `u64` value inside `.data`.
    pub fn data_u64(mut self, rva: u32, value: u64) -> Self {
        let offset = (rva - DATA_RVA) as usize;
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self
    }

    fn reserve_rdata(&mut self, len: usize) -> u32 {
        while self.rdata.len() % 8 != 0 {
            self.rdata.push(0);
        }

        let rva = RDATA_RVA + self.rdata.len() as u32;
        self.rdata.resize(self.rdata.len() + len, 0);
        rva
    }

    fn rdata_mut(&mut self, rva: u32, len: usize) -> &mut [u8] {
        let offset = (rva - RDATA_RVA) as usize;
        &mut self.rdata[offset..offset + len]
    }

    fn alloc_string(&mut self, value: &str) -> u32 {
        let rva = self.reserve_rdata(value.len() + 1);
        self.rdata_mut(rva, value.len())
            .copy_from_slice(value.as_bytes());
        rva
    }

    fn build_exports(&mut self) {
        let Some((dll_name, mut items)) = self.exports.take() else {
            return;
        };

        // The name pointer table must be lexically sorted.
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let count = items.len();

        let functions_off = 0x28;
        let names_off = functions_off + 4 * count;
        let ordinals_off = names_off + 4 * count;
        let mut cursor = ordinals_off + 2 * count;

        let dll_name_off = cursor;
        cursor += dll_name.len() + 1;

        let mut name_offs = Vec::with_capacity(count);
        for (name, _) in &items {
            name_offs.push(cursor);
            cursor += name.len() + 1;
        }

        let mut forward_offs = Vec::with_capacity(count);
        for (_, target) in &items {
            match target {
                ExportTarget::Forward(text) => {
                    forward_offs.push(Some(cursor));
                    cursor += text.len() + 1;
                }
                ExportTarget::Rva(_) => forward_offs.push(None),
            }
        }

        let blob_len = cursor;
        let blob_rva = self.reserve_rdata(blob_len);
        let blob = self.rdata_mut(blob_rva, blob_len);

        put32(blob, 0x0C, blob_rva + dll_name_off as u32);
        put32(blob, 0x10, 1); // ordinal base
        put32(blob, 0x14, count as u32);
        put32(blob, 0x18, count as u32);
        put32(blob, 0x1C, blob_rva + functions_off as u32);
        put32(blob, 0x20, blob_rva + names_off as u32);
        put32(blob, 0x24, blob_rva + ordinals_off as u32);

        blob[dll_name_off..dll_name_off + dll_name.len()].copy_from_slice(dll_name.as_bytes());

        for (index, (name, target)) in items.iter().enumerate() {
            let address = match target {
                ExportTarget::Rva(rva) => *rva,
                ExportTarget::Forward(text) => {
                    let off = forward_offs[index].unwrap();
                    blob[off..off + text.len()].copy_from_slice(text.as_bytes());
                    blob_rva + off as u32
                }
            };

            put32(blob, functions_off + 4 * index, address);
            put32(blob, names_off + 4 * index, blob_rva + name_offs[index] as u32);
            put16(blob, ordinals_off + 2 * index, index as u16);

            let name_off = name_offs[index];
            blob[name_off..name_off + name.len()].copy_from_slice(name.as_bytes());
        }

        self.dirs[0] = (blob_rva, blob_len as u32);
    }

    fn build_imports(&mut self) {
        if self.imports.is_empty() {
            return;
        }

        struct BuiltModule {
            name_rva: u32,
            thunk_rva: u32,
            iat_rva: u32,
        }

        let modules = std::mem::take(&mut self.imports);
        let mut built = Vec::with_capacity(modules.len());

        for (module, functions) in &modules {
            let name_rva = self.alloc_string(module);

            let mut thunks = Vec::with_capacity(functions.len() + 1);
            for function in functions {
                let thunk = match function {
                    ImportFn::Name(name) => {
                        let entry_rva = self.reserve_rdata(2 + name.len() + 2);
                        let entry = self.rdata_mut(entry_rva, 2 + name.len());
                        entry[2..].copy_from_slice(name.as_bytes());
                        u64::from(entry_rva)
                    }
                    ImportFn::Ordinal(ordinal) => 1 << 63 | u64::from(*ordinal),
                };
                thunks.push(thunk);
            }
            thunks.push(0);

            let table_len = thunks.len() * 8;
            let thunk_rva = self.reserve_rdata(table_len);
            let iat_rva = self.reserve_rdata(table_len);

            for (index, thunk) in thunks.iter().enumerate() {
                put64(self.rdata_mut(thunk_rva, table_len), index * 8, *thunk);
                put64(self.rdata_mut(iat_rva, table_len), index * 8, *thunk);
            }

            built.push(BuiltModule {
                name_rva,
                thunk_rva,
                iat_rva,
            });
        }

        let descriptors_len = (built.len() + 1) * 20;
        let descriptors_rva = self.reserve_rdata(descriptors_len);
        let descriptors = self.rdata_mut(descriptors_rva, descriptors_len);

        for (index, module) in built.iter().enumerate() {
            let base = index * 20;
            put32(descriptors, base, module.thunk_rva);
            put32(descriptors, base + 0x0C, module.name_rva);
            put32(descriptors, base + 0x10, module.iat_rva);
        }

        self.dirs[1] = (descriptors_rva, descriptors_len as u32);
    }

    fn build_exception(&mut self) {
        if !self.exception_entry {
            return;
        }

        let rva = self.reserve_rdata(12);
        let entry = self.rdata_mut(rva, 12);
        put32(entry, 0, TEXT_RVA);
        put32(entry, 4, TEXT_RVA + 0x40);

        self.dirs[3] = (rva, 12);
    }

    fn build_relocations(&mut self) {
        if self.relocations.is_empty() {
            return;
        }

        let mut pages: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
        for rva in std::mem::take(&mut self.relocations) {
            pages
                .entry(rva & !0xFFF)
                .or_default()
                .push(10 << 12 | (rva & 0xFFF) as u16);
        }

        let mut blob = Vec::new();
        for (page, mut entries) in pages {
            if entries.len() % 2 != 0 {
                entries.push(0); // alignment padding entry
            }

            let block_size = 8 + entries.len() * 2;
            blob.extend_from_slice(&page.to_le_bytes());
            blob.extend_from_slice(&(block_size as u32).to_le_bytes());
            for entry in entries {
                blob.extend_from_slice(&entry.to_le_bytes());
            }
        }

        let rva = self.reserve_rdata(blob.len());
        let len = blob.len();
        self.rdata_mut(rva, len).copy_from_slice(&blob);
        self.dirs[5] = (rva, len as u32);
    }

    fn build_tls(&mut self) {
        let Some(callbacks) = self.tls_callbacks.take() else {
            return;
        };

        let array_len = (callbacks.len() + 1) * 8;
        let array_rva = self.reserve_rdata(array_len);
        for (index, callback_rva) in callbacks.iter().enumerate() {
            put64(
                self.rdata_mut(array_rva, array_len),
                index * 8,
                IMAGE_BASE + u64::from(*callback_rva),
            );
        }

        let dir_rva = self.reserve_rdata(40);
        let dir = self.rdata_mut(dir_rva, 40);
        put64(dir, 0x00, IMAGE_BASE + u64::from(DATA_RVA) + 0x40); // raw data start
        put64(dir, 0x08, IMAGE_BASE + u64::from(DATA_RVA) + 0x50); // raw data end
        put64(dir, 0x10, IMAGE_BASE + u64::from(TLS_INDEX_RVA)); // index slot
        put64(dir, 0x18, IMAGE_BASE + u64::from(array_rva)); // callback array

        self.dirs[9] = (dir_rva, 40);
    }

    fn build_load_config(&mut self) {
        let Some((cookie_rva, guard_flags)) = self.load_config.take() else {
            return;
        };

        let rva = self.reserve_rdata(0xA0);
        let dir = self.rdata_mut(rva, 0xA0);
        put32(dir, 0x00, 0xA0); // declared size
        if let Some(cookie) = cookie_rva {
            put64(dir, 0x58, IMAGE_BASE + u64::from(cookie));
        }
        put32(dir, 0x90, guard_flags);

        self.dirs[10] = (rva, 0xA0);
    }

    fn build_clr(&mut self) {
        if !self.clr_header {
            return;
        }

        let rva = self.reserve_rdata(0x48);
        put32(self.rdata_mut(rva, 0x48), 0, 0x48);
        self.dirs[14] = (rva, 0x48);
    }

    pub fn build(mut self) -> Vec<u8> {
        self.build_exports();
        self.build_imports();
        self.build_exception();
        self.build_relocations();
        self.build_tls();
        self.build_load_config();
        self.build_clr();

        assert!(self.rdata.len() <= RDATA_CAPACITY, "rdata payload overflow");

        let mut file = vec![0_u8; FILE_SIZE];

        // DOS header
        file[0] = b'M';
        file[1] = b'Z';
        put32(&mut file, 0x3C, 0x80); // e_lfanew

        // PE signature and COFF header
        file[0x80..0x84].copy_from_slice(b"PE\0\0");
        put16(&mut file, 0x84, 0x8664); // machine
        put16(&mut file, 0x86, 3); // section count
        put16(&mut file, 0x94, 0xF0); // optional header size
        let mut characteristics = 0x0022_u16; // executable image, large address aware
        if self.dll {
            characteristics |= 0x2000;
        }
        put16(&mut file, 0x96, characteristics);

        // Optional header (PE32+)
        let opt = 0x98;
        put16(&mut file, opt, 0x20B); // magic
        put32(&mut file, opt + 4, TEXT_RAW as u32); // size of code
        put32(&mut file, opt + 8, (RDATA_CAPACITY + DATA_SIZE) as u32);
        put32(&mut file, opt + 16, self.entry_rva);
        put32(&mut file, opt + 20, TEXT_RVA); // base of code
        put64(&mut file, opt + 24, IMAGE_BASE);
        put32(&mut file, opt + 32, 0x1000); // section alignment
        put32(&mut file, opt + 36, 0x200); // file alignment
        put16(&mut file, opt + 40, 6); // OS version
        put16(&mut file, opt + 48, 6); // subsystem version
        put32(&mut file, opt + 56, SIZE_OF_IMAGE);
        put32(&mut file, opt + 60, SIZE_OF_HEADERS);
        put16(&mut file, opt + 68, 2); // subsystem: GUI
        put16(&mut file, opt + 70, 0x160); // dynamic base, NX compatible
        put64(&mut file, opt + 72, 0x10_0000); // stack reserve
        put64(&mut file, opt + 80, 0x1000); // stack commit
        put64(&mut file, opt + 88, 0x10_0000); // heap reserve
        put64(&mut file, opt + 96, 0x1000); // heap commit
        put32(&mut file, opt + 108, 16); // directory count

        for (index, (rva, size)) in self.dirs.iter().enumerate() {
            put32(&mut file, opt + 112 + index * 8, *rva);
            put32(&mut file, opt + 116 + index * 8, *size);
        }

        // Section headers
        let sections = [
            (*b".text\0\0\0", 0x200_u32, TEXT_RVA, 0x200_u32, TEXT_RAW, 0x6000_0020_u32),
            (
                *b".rdata\0\0",
                RDATA_CAPACITY as u32,
                RDATA_RVA,
                RDATA_CAPACITY as u32,
                RDATA_RAW,
                0x4000_0040,
            ),
            (
                *b".data\0\0\0",
                DATA_SIZE as u32,
                DATA_RVA,
                DATA_SIZE as u32,
                DATA_RAW,
                0xC000_0040,
            ),
        ];

        for (index, (name, vsize, va, raw_size, raw_ptr, flags)) in sections.iter().enumerate() {
            let base = 0x188 + index * 40;
            file[base..base + 8].copy_from_slice(name);
            put32(&mut file, base + 8, *vsize);
            put32(&mut file, base + 12, *va);
            put32(&mut file, base + 16, *raw_size);
            put32(&mut file, base + 20, *raw_ptr as u32);
            put32(&mut file, base + 36, *flags);
        }

        // Section contents
        file[RDATA_RAW..RDATA_RAW + self.rdata.len()].copy_from_slice(&self.rdata);
        file[DATA_RAW..DATA_RAW + DATA_SIZE].copy_from_slice(&self.data);

        file
    }
}

fn put16(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put32(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put64(buffer: &mut [u8], offset: usize, value: u64) {
    buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

// ---------------------------------------------------------------------------
// In-memory foreign-process double
// ---------------------------------------------------------------------------

/// Address the double reports as its PEB.
pub const PEB_ADDRESS: u64 = 0x3_0000_0000;

/// One remote routine invocation observed by the double.
#[derive(Debug, Clone)]
pub struct RoutineCall {
    pub target: u64,
    pub arguments: Vec<u64>,
}

struct Region {
    data: Vec<u8>,
    protection: Protection,
}

type Handler = Arc<dyn Fn(&FakeProcess, &[u64]) -> u64 + Send + Sync>;

/// An in-memory [`RemoteProcess`] double.
///
/// Threads spawned into it decode the call stub they are pointed at, log the
/// call, dispatch it to a registered handler (or a configurable default return
/// value), and store the result through the stub's capture slot.
pub struct FakeProcess {
    architecture: Architecture,
    running: AtomicBool,
    next_allocation: AtomicU64,
    regions: Mutex<BTreeMap<u64, Region>>,
    handlers: Mutex<HashMap<u64, Handler>>,
    calls: Mutex<Vec<RoutineCall>>,
    protections: Mutex<Vec<(u64, usize, Protection)>>,
    default_return: AtomicU64,
}

impl FakeProcess {
    pub fn new() -> FakeProcess {
        Self::with_architecture(Architecture::X64)
    }

    pub fn with_architecture(architecture: Architecture) -> FakeProcess {
        FakeProcess {
            architecture,
            running: AtomicBool::new(true),
            next_allocation: AtomicU64::new(0x5_0000_0000),
            regions: Mutex::new(BTreeMap::new()),
            handlers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            protections: Mutex::new(Vec::new()),
            default_return: AtomicU64::new(1),
        }
    }

    pub fn add_region(&self, base: u64, size: usize) {
        self.regions.lock().unwrap().insert(
            base,
            Region {
                data: vec![0; size],
                protection: Protection::READ_WRITE,
            },
        );
    }

    pub fn set_handler<F>(&self, address: u64, handler: F)
    where
        F: Fn(&FakeProcess, &[u64]) -> u64 + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(address, Arc::new(handler));
    }

    pub fn set_default_return(&self, value: u64) {
        self.default_return.store(value, Ordering::SeqCst);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RoutineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, target: u64) -> Vec<Vec<u64>> {
        self.calls()
            .into_iter()
            .filter(|call| call.target == target)
            .map(|call| call.arguments)
            .collect()
    }

    pub fn protections(&self) -> Vec<(u64, usize, Protection)> {
        self.protections.lock().unwrap().clone()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    pub fn read_wide_string(&self, address: u64) -> String {
        let mut units = Vec::new();

        for index in 0..260 {
            let mut pair = [0_u8; 2];
            if self.read(address + index * 2, &mut pair).is_err() {
                break;
            }

            let unit = u16::from_le_bytes(pair);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }

        String::from_utf16_lossy(&units)
    }

    fn with_region<T>(
        &self,
        address: u64,
        len: usize,
        operation: &'static str,
        action: impl FnOnce(&mut Region, usize) -> T,
    ) -> Result<T> {
        let mut regions = self.regions.lock().unwrap();

        let Some((base, region)) = regions.range_mut(..=address).next_back() else {
            return Err(Error::remote(operation, 299));
        };

        let offset = (address - base) as usize;
        if offset + len > region.data.len() {
            return Err(Error::remote(operation, 299));
        }

        Ok(action(region, offset))
    }
}

impl RemoteProcess for FakeProcess {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("C:\\fake\\host.exe"))
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u64> {
        let size = size.max(1);
        let reserved = (size as u64).div_ceil(0x1000) * 0x1000 + 0x1000;
        let base = self.next_allocation.fetch_add(reserved, Ordering::SeqCst);

        self.regions.lock().unwrap().insert(
            base,
            Region {
                data: vec![0; size],
                protection,
            },
        );

        Ok(base)
    }

    fn free(&self, address: u64) -> Result<()> {
        match self.regions.lock().unwrap().remove(&address) {
            Some(_) => Ok(()),
            None => Err(Error::remote("VirtualFreeEx", 487)),
        }
    }

    fn protect(&self, address: u64, size: usize, protection: Protection) -> Result<Protection> {
        let previous = self.with_region(address, size, "VirtualProtectEx", |region, _| {
            std::mem::replace(&mut region.protection, protection)
        })?;

        self.protections
            .lock()
            .unwrap()
            .push((address, size, protection));

        Ok(previous)
    }

    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        self.with_region(address, buffer.len(), "ReadProcessMemory", |region, offset| {
            buffer.copy_from_slice(&region.data[offset..offset + buffer.len()]);
        })
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        self.with_region(address, data.len(), "WriteProcessMemory", |region, offset| {
            region.data[offset..offset + data.len()].copy_from_slice(data);
        })
    }

    fn spawn_thread(&self, start: u64) -> Result<()> {
        let stub = {
            let regions = self.regions.lock().unwrap();
            let Some((base, region)) = regions.range(..=start).next_back() else {
                return Err(Error::remote("CreateRemoteThread", 299));
            };

            region.data[(start - base) as usize..].to_vec()
        };

        let call = decode_stub(&stub).ok_or_else(|| Error::remote("CreateRemoteThread", 0))?;

        self.calls.lock().unwrap().push(RoutineCall {
            target: call.target,
            arguments: call.arguments.clone(),
        });

        let handler = self.handlers.lock().unwrap().get(&call.target).cloned();
        let result = match handler {
            Some(handler) => handler(self, &call.arguments),
            None => self.default_return.load(Ordering::SeqCst),
        };

        if let Some(capture) = call.return_address {
            self.write(capture, &result.to_le_bytes())?;
        }

        Ok(())
    }

    fn peb_address(&self) -> Result<u64> {
        Ok(PEB_ADDRESS)
    }
}

struct DecodedCall {
    target: u64,
    arguments: Vec<u64>,
    return_address: Option<u64>,
}

/// Decodes the x64 call stub shape the engine assembles.
fn decode_stub(bytes: &[u8]) -> Option<DecodedCall> {
    let mut cursor = 0_usize;

    // sub rsp, imm8
    if bytes.get(..3)? != [0x48, 0x83, 0xEC] {
        return None;
    }
    cursor += 4;

    let mut registers: Vec<u64> = Vec::new();
    let mut pushes: Vec<u64> = Vec::new();
    let target;

    loop {
        let rest = bytes.get(cursor..)?;

        if rest.is_empty() {
            return None;
        }

        if rest.starts_with(&[0x31, 0xC9]) || rest.starts_with(&[0x31, 0xD2]) {
            registers.push(0);
            cursor += 2;
        } else if rest.starts_with(&[0x4D, 0x31, 0xC0]) || rest.starts_with(&[0x4D, 0x31, 0xC9]) {
            registers.push(0);
            cursor += 3;
        } else if rest[0] == 0xB9 || rest[0] == 0xBA {
            registers.push(u64::from(u32::from_le_bytes(rest.get(1..5)?.try_into().ok()?)));
            cursor += 5;
        } else if rest.starts_with(&[0x41, 0xB8]) || rest.starts_with(&[0x41, 0xB9]) {
            registers.push(u64::from(u32::from_le_bytes(rest.get(2..6)?.try_into().ok()?)));
            cursor += 6;
        } else if (rest[0] == 0x48 && matches!(rest.get(1), Some(0xB9 | 0xBA)))
            || (rest[0] == 0x49 && matches!(rest.get(1), Some(0xB8 | 0xB9)))
        {
            registers.push(u64::from_le_bytes(rest.get(2..10)?.try_into().ok()?));
            cursor += 10;
        } else if rest[0] == 0x6A {
            pushes.push(u64::from(*rest.get(1)?));
            cursor += 2;
        } else if rest[0] == 0x68 {
            pushes.push(u64::from(u32::from_le_bytes(rest.get(1..5)?.try_into().ok()?)));
            cursor += 5;
        } else if rest.starts_with(&[0x48, 0xB8]) {
            let value = u64::from_le_bytes(rest.get(2..10)?.try_into().ok()?);

            match rest.get(10)? {
                0x50 => {
                    pushes.push(value);
                    cursor += 11;
                }
                0xFF if rest.get(11) == Some(&0xD0) => {
                    target = value;
                    cursor += 12;
                    break;
                }
                _ => return None,
            }
        } else {
            return None;
        }
    }

    // Stack arguments were pushed right to left.
    pushes.reverse();
    let mut arguments = registers;
    arguments.extend(pushes);

    let return_address = if bytes.get(cursor..cursor + 2) == Some(&[0x48, 0xA3]) {
        Some(u64::from_le_bytes(
            bytes.get(cursor + 2..cursor + 10)?.try_into().ok()?,
        ))
    } else {
        None
    };

    Some(DecodedCall {
        target,
        arguments,
        return_address,
    })
}

// ---------------------------------------------------------------------------
// Emulated loader environment
// ---------------------------------------------------------------------------

pub const NTDLL_BASE: u64 = 0x7FFB_0000_0000;
pub const KERNEL32_BASE: u64 = 0x7FFB_1000_0000;
pub const HEAP_HANDLE: u64 = 0x3_0002_0000;
pub const LDR_ADDRESS: u64 = 0x3_0001_0000;

pub const RTL_ALLOCATE_HEAP_RVA: u32 = 0x1000;
pub const RTL_FREE_HEAP_RVA: u32 = 0x1010;
pub const RTL_ACQUIRE_PEB_LOCK_RVA: u32 = 0x1020;
pub const RTL_RELEASE_PEB_LOCK_RVA: u32 = 0x1030;
pub const LOAD_LIBRARY_RVA: u32 = 0x1000;
pub const FREE_LIBRARY_RVA: u32 = 0x1010;

pub const CFG_CHECK_RVA: u32 = 0x2000;
pub const CFG_DISPATCH_RVA: u32 = 0x2010;
pub const TLS_BITMAP_RVA: u32 = 0x8000;
pub const TLS_STATIC_VECTOR_RVA: u32 = 0x8100;
pub const TLS_LIST_RVA: u32 = 0x8200;
pub const FUNCTION_TABLE_RVA: u32 = 0x9000;
pub const FUNCTION_TABLE_MAX: u32 = 0x200;

/// Installs the emulated `ntdll`/`kernel32` surface a mapping needs: loader
/// regions, the inverted function table with its sentinel, heap routines, and
/// `LoadLibraryW` backed by a registered dependency map.
pub struct LoaderFixture {
    ntdll_bytes: Vec<u8>,
    kernel32_bytes: Vec<u8>,
    dependencies: Arc<Mutex<HashMap<String, u64>>>,
    with_tls_symbols: bool,
}

impl LoaderFixture {
    pub fn install(process: &Arc<FakeProcess>) -> LoaderFixture {
        Self::install_with(process, true)
    }

    pub fn install_with(process: &Arc<FakeProcess>, with_tls_symbols: bool) -> LoaderFixture {
        process.add_region(NTDLL_BASE, 0x10000);
        process.add_region(PEB_ADDRESS, 0x200);
        process.add_region(LDR_ADDRESS, 0x400);

        process.write_u64(PEB_ADDRESS + 0x18, LDR_ADDRESS).unwrap();
        process.write_u64(PEB_ADDRESS + 0x30, HEAP_HANDLE).unwrap();

        // Inverted function table: the ntdll sentinel occupies index 0.
        let table = NTDLL_BASE + u64::from(FUNCTION_TABLE_RVA);
        process.write_u32(table, 1).unwrap();
        process.write_u32(table + 4, FUNCTION_TABLE_MAX).unwrap();
        process.write_u64(table + 16 + 8, NTDLL_BASE).unwrap();
        process.write_u32(table + 16 + 0x10, 0x10000).unwrap();

        process.set_handler(
            NTDLL_BASE + u64::from(RTL_ALLOCATE_HEAP_RVA),
            |process, arguments| {
                process
                    .allocate(arguments[2] as usize, Protection::READ_WRITE)
                    .unwrap_or(0)
            },
        );
        process.set_handler(
            NTDLL_BASE + u64::from(RTL_FREE_HEAP_RVA),
            |process, arguments| u64::from(process.free(arguments[2]).is_ok()),
        );

        let dependencies: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let loader_map = dependencies.clone();
        process.set_handler(
            KERNEL32_BASE + u64::from(LOAD_LIBRARY_RVA),
            move |process, arguments| {
                let path = process.read_wide_string(arguments[0]);
                let name = PathBuf::from(path)
                    .file_name()
                    .map(|name| name.to_string_lossy().to_lowercase())
                    .unwrap_or_default();

                loader_map.lock().unwrap().get(&name).copied().unwrap_or(0)
            },
        );

        let ntdll_bytes = PeBuilder::new()
            .exports(
                "ntdll.dll",
                vec![
                    ("RtlAcquirePebLock", ExportTarget::Rva(RTL_ACQUIRE_PEB_LOCK_RVA)),
                    ("RtlAllocateHeap", ExportTarget::Rva(RTL_ALLOCATE_HEAP_RVA)),
                    ("RtlFreeHeap", ExportTarget::Rva(RTL_FREE_HEAP_RVA)),
                    ("RtlReleasePebLock", ExportTarget::Rva(RTL_RELEASE_PEB_LOCK_RVA)),
                ],
            )
            .build();

        let kernel32_bytes = PeBuilder::new()
            .exports(
                "KERNEL32.dll",
                vec![
                    ("FreeLibrary", ExportTarget::Rva(FREE_LIBRARY_RVA)),
                    ("LoadLibraryW", ExportTarget::Rva(LOAD_LIBRARY_RVA)),
                ],
            )
            .build();

        LoaderFixture {
            ntdll_bytes,
            kernel32_bytes,
            dependencies,
            with_tls_symbols,
        }
    }

    /// Builds the symbol table matching the installed `ntdll` layout.
    pub fn symbols(&self) -> SymbolTable {
        let mut table = SymbolTable::new();

        table.insert(Architecture::X64, "KiUserInvertedFunctionTable", FUNCTION_TABLE_RVA);
        table.insert(Architecture::X64, "LdrpValidateUserCallTarget", CFG_CHECK_RVA);
        table.insert(Architecture::X64, "LdrpDispatchUserCallTarget", CFG_DISPATCH_RVA);

        if self.with_tls_symbols {
            table.insert(Architecture::X64, "LdrpTlsBitmap", TLS_BITMAP_RVA);
            table.insert(Architecture::X64, "LdrpStaticTlsBitmapVector", TLS_STATIC_VECTOR_RVA);
            table.insert(Architecture::X64, "LdrpTlsList", TLS_LIST_RVA);
        }

        table
    }

    /// Seeds the module cache with the emulated `ntdll` and `kernel32`.
    pub fn register_modules(&self, context: &ProcessContext) {
        context.insert_module(Module::with_image(
            NTDLL_BASE,
            PathBuf::from("C:/Windows/System32/ntdll.dll"),
            Image::from_mem(self.ntdll_bytes.clone()).unwrap(),
        ));
        context.insert_module(Module::with_image(
            KERNEL32_BASE,
            PathBuf::from("C:/Windows/System32/kernel32.dll"),
            Image::from_mem(self.kernel32_bytes.clone()).unwrap(),
        ));
    }

    /// Makes the emulated `LoadLibraryW` report `base` for the given file name.
    pub fn add_dependency(&self, name: &str, base: u64) {
        self.dependencies
            .lock()
            .unwrap()
            .insert(name.to_lowercase(), base);
    }
}

/// A resolver backed by an explicit name-to-path map.
pub struct MapResolver {
    entries: HashMap<String, PathBuf>,
}

impl MapResolver {
    pub fn new() -> MapResolver {
        MapResolver {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, path: PathBuf) {
        self.entries.insert(name.to_lowercase(), path);
    }
}

impl FileResolver for MapResolver {
    fn resolve(&self, module_name: &str) -> Option<PathBuf> {
        self.entries.get(&module_name.to_lowercase()).cloned()
    }
}
