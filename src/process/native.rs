//! The low-level foreign process surface.
//!
//! [`RemoteProcess`] is the seam between the mapping engine and the operating
//! system: memory allocation, protection, reads and writes, thread creation, and
//! PEB discovery. Production code talks to a live Windows process through this
//! trait; tests substitute an in-memory double.

use std::path::PathBuf;

use bitflags::bitflags;

use crate::{arch::Architecture, Result};

bitflags! {
    /// Page protection of a foreign memory region.
    ///
    /// The bit values match the Windows `PAGE_*` constants so implementations can
    /// pass them through unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// No access
        const NO_ACCESS = 0x01;
        /// Read only
        const READ_ONLY = 0x02;
        /// Read and write
        const READ_WRITE = 0x04;
        /// Copy on write
        const WRITE_COPY = 0x08;
        /// Execute only
        const EXECUTE = 0x10;
        /// Execute and read
        const EXECUTE_READ = 0x20;
        /// Execute, read and write
        const EXECUTE_READ_WRITE = 0x40;
        /// Execute with copy on write
        const EXECUTE_WRITE_COPY = 0x80;
        /// Non-cacheable
        const NO_CACHE = 0x200;
    }
}

/// Control-flow-guard enforcement state of a foreign process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfgPolicy {
    /// Whether the process enforces control flow guard at all.
    pub enabled: bool,
    /// Whether the process additionally enforces export suppression.
    pub export_suppression: bool,
}

/// A loaded module of a foreign process, as seen by its loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Base address of the module in the foreign process.
    pub base: u64,
    /// Full path of the module's backing file.
    pub path: PathBuf,
}

/// Low-level operations on a foreign process.
///
/// All addresses are foreign-process virtual addresses carried as `u64` regardless
/// of the target's pointer width. Implementations must be safe to share across
/// threads.
pub trait RemoteProcess: Send + Sync {
    /// The pointer width of the foreign process.
    fn architecture(&self) -> Architecture;

    /// Whether the foreign process is still alive.
    fn is_running(&self) -> bool;

    /// Full path of the foreign process's main executable.
    ///
    /// # Errors
    ///
    /// Returns an error when the path cannot be queried.
    fn path(&self) -> Result<PathBuf>;

    /// Allocates a region of the given size and protection, returning its base.
    ///
    /// # Errors
    ///
    /// Returns an error when the allocation fails.
    fn allocate(&self, size: usize, protection: Protection) -> Result<u64>;

    /// Releases a region previously returned by [`RemoteProcess::allocate`].
    ///
    /// # Errors
    ///
    /// Returns an error when the release fails.
    fn free(&self, address: u64) -> Result<()>;

    /// Changes the protection of a region, returning the previous protection.
    ///
    /// # Errors
    ///
    /// Returns an error when the protection change fails.
    fn protect(&self, address: u64, size: usize, protection: Protection) -> Result<Protection>;

    /// Reads `buffer.len()` bytes starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when any part of the range is unreadable.
    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes `data` starting at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when any part of the range is unwritable.
    fn write(&self, address: u64, data: &[u8]) -> Result<()>;

    /// Runs a thread at `start` in the foreign process and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error when the thread cannot be created or waited on.
    fn spawn_thread(&self, start: u64) -> Result<()>;

    /// The control-flow-guard enforcement state of the foreign process.
    ///
    /// The default assumes enforcement without export suppression, which is the
    /// safe direction: wiring up CFG pointers in a process that does not enforce
    /// them is harmless.
    fn cfg_policy(&self) -> CfgPolicy {
        CfgPolicy {
            enabled: true,
            export_suppression: false,
        }
    }

    /// Address of the process environment block matching
    /// [`RemoteProcess::architecture`].
    ///
    /// # Errors
    ///
    /// Returns an error when the PEB cannot be located.
    fn peb_address(&self) -> Result<u64>;

    /// Reads a `u32` at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is unreadable.
    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut buffer = [0_u8; 4];
        self.read(address, &mut buffer)?;

        Ok(u32::from_le_bytes(buffer))
    }

    /// Reads a `u64` at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is unreadable.
    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut buffer = [0_u8; 8];
        self.read(address, &mut buffer)?;

        Ok(u64::from_le_bytes(buffer))
    }

    /// Reads a pointer of the foreign process's width at `address`, widened to `u64`.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is unreadable.
    fn read_ptr(&self, address: u64) -> Result<u64> {
        match self.architecture() {
            Architecture::X86 => Ok(u64::from(self.read_u32(address)?)),
            Architecture::X64 => self.read_u64(address),
        }
    }

    /// Writes a `u32` at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is unwritable.
    fn write_u32(&self, address: u64, value: u32) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a `u64` at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is unwritable.
    fn write_u64(&self, address: u64, value: u64) -> Result<()> {
        self.write(address, &value.to_le_bytes())
    }

    /// Writes a pointer of the foreign process's width at `address`.
    ///
    /// # Errors
    ///
    /// Returns an error when the address is unwritable, or the value does not fit
    /// the foreign pointer width.
    fn write_ptr(&self, address: u64, value: u64) -> Result<()> {
        match self.architecture() {
            Architecture::X86 => {
                let narrow = u32::try_from(value)
                    .map_err(|_| crate::Error::InvalidInput("pointer exceeds 32 bits".into()))?;
                self.write_u32(address, narrow)
            }
            Architecture::X64 => self.write_u64(address, value),
        }
    }
}
