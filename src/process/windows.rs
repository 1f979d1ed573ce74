//! Live Windows process backend for [`RemoteProcess`].

use std::{ffi::c_void, path::PathBuf};

use windows::{
    Wdk::System::Threading::{NtQueryInformationProcess, PROCESSINFOCLASS},
    Win32::{
        Foundation::{CloseHandle, HANDLE, STILL_ACTIVE, WAIT_OBJECT_0},
        System::{
            Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory},
            Memory::{
                VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, MEM_COMMIT, MEM_RELEASE,
                MEM_RESERVE, PAGE_PROTECTION_FLAGS,
            },
            SystemInformation::IMAGE_FILE_MACHINE_UNKNOWN,
            Threading::{
                CreateRemoteThread, GetExitCodeProcess, GetProcessMitigationPolicy,
                IsWow64Process2, OpenProcess, ProcessControlFlowGuardPolicy,
                QueryFullProcessImageNameW, WaitForSingleObject, INFINITE,
                PROCESS_NAME_WIN32, PROCESS_ALL_ACCESS,
            },
        },
    },
};

use super::native::{CfgPolicy, Protection, RemoteProcess};
use crate::{arch::Architecture, Error, Result};

/// `ProcessBasicInformation`
const PROCESS_BASIC_INFORMATION_CLASS: PROCESSINFOCLASS = PROCESSINFOCLASS(0);
/// `ProcessWow64Information`
const PROCESS_WOW64_INFORMATION_CLASS: PROCESSINFOCLASS = PROCESSINFOCLASS(26);

fn remote_error(operation: &'static str, error: &windows::core::Error) -> Error {
    Error::remote(operation, error.code().0 as u32)
}

/// A foreign process opened through the Win32 API.
pub struct WindowsProcess {
    handle: HANDLE,
    architecture: Architecture,
}

// The handle is only used through APIs that are safe to call concurrently.
unsafe impl Send for WindowsProcess {}
unsafe impl Sync for WindowsProcess {}

impl WindowsProcess {
    /// Opens the process with the given identifier for mapping.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be opened or its architecture
    /// cannot be determined.
    pub fn open(process_id: u32) -> Result<WindowsProcess> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, process_id) }
            .map_err(|error| remote_error("OpenProcess", &error))?;

        let mut process_machine = IMAGE_FILE_MACHINE_UNKNOWN;
        let mut native_machine = IMAGE_FILE_MACHINE_UNKNOWN;

        if let Err(error) =
            unsafe { IsWow64Process2(handle, &mut process_machine, Some(&mut native_machine)) }
        {
            unsafe { CloseHandle(handle).ok() };
            return Err(remote_error("IsWow64Process2", &error));
        }

        // A WOW64 process reports its emulated machine; a native one reports none.
        let machine = if process_machine == IMAGE_FILE_MACHINE_UNKNOWN {
            native_machine
        } else {
            process_machine
        };

        let Some(architecture) = Architecture::from_machine(machine.0) else {
            unsafe { CloseHandle(handle).ok() };
            return Err(Error::InvalidInput(format!(
                "Unsupported process machine {:#06x}",
                machine.0
            )));
        };

        Ok(WindowsProcess {
            handle,
            architecture,
        })
    }

    fn query_pointer(&self, class: PROCESSINFOCLASS, offset: usize) -> Result<u64> {
        // Large enough for PROCESS_BASIC_INFORMATION on x64.
        let mut buffer = [0_u8; 64];
        let mut return_length = 0_u32;

        let status = unsafe {
            NtQueryInformationProcess(
                self.handle,
                class,
                buffer.as_mut_ptr().cast::<c_void>(),
                buffer.len() as u32,
                &mut return_length,
            )
        };

        if status.is_err() {
            return Err(Error::remote("NtQueryInformationProcess", status.0 as u32));
        }

        // The queried structures store host-sized pointers.
        let pointer_size = std::mem::size_of::<usize>();
        let mut pointer = [0_u8; 8];
        pointer[..pointer_size].copy_from_slice(&buffer[offset..offset + pointer_size]);

        Ok(u64::from_le_bytes(pointer))
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle).ok() };
    }
}

impl RemoteProcess for WindowsProcess {
    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn is_running(&self) -> bool {
        let mut exit_code = 0_u32;

        unsafe { GetExitCodeProcess(self.handle, &mut exit_code) }.is_ok()
            && exit_code == STILL_ACTIVE.0 as u32
    }

    fn path(&self) -> Result<PathBuf> {
        let mut buffer = [0_u16; 1024];
        let mut length = buffer.len() as u32;

        unsafe {
            QueryFullProcessImageNameW(
                self.handle,
                PROCESS_NAME_WIN32,
                windows::core::PWSTR(buffer.as_mut_ptr()),
                &mut length,
            )
        }
        .map_err(|error| remote_error("QueryFullProcessImageNameW", &error))?;

        Ok(PathBuf::from(String::from_utf16_lossy(
            &buffer[..length as usize],
        )))
    }

    fn allocate(&self, size: usize, protection: Protection) -> Result<u64> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle,
                None,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_PROTECTION_FLAGS(protection.bits()),
            )
        };

        if address.is_null() {
            return Err(Error::remote(
                "VirtualAllocEx",
                windows::core::Error::from_win32().code().0 as u32,
            ));
        }

        Ok(address as u64)
    }

    fn free(&self, address: u64) -> Result<()> {
        unsafe { VirtualFreeEx(self.handle, address as usize as *mut c_void, 0, MEM_RELEASE) }
            .map_err(|error| remote_error("VirtualFreeEx", &error))
    }

    fn protect(&self, address: u64, size: usize, protection: Protection) -> Result<Protection> {
        let mut previous = PAGE_PROTECTION_FLAGS(0);

        unsafe {
            VirtualProtectEx(
                self.handle,
                address as usize as *const c_void,
                size,
                PAGE_PROTECTION_FLAGS(protection.bits()),
                &mut previous,
            )
        }
        .map_err(|error| remote_error("VirtualProtectEx", &error))?;

        Ok(Protection::from_bits_truncate(previous.0))
    }

    fn read(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        unsafe {
            ReadProcessMemory(
                self.handle,
                address as usize as *const c_void,
                buffer.as_mut_ptr().cast::<c_void>(),
                buffer.len(),
                None,
            )
        }
        .map_err(|error| remote_error("ReadProcessMemory", &error))
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        unsafe {
            WriteProcessMemory(
                self.handle,
                address as usize as *const c_void,
                data.as_ptr().cast::<c_void>(),
                data.len(),
                None,
            )
        }
        .map_err(|error| remote_error("WriteProcessMemory", &error))
    }

    fn spawn_thread(&self, start: u64) -> Result<()> {
        let thread = unsafe {
            CreateRemoteThread(
                self.handle,
                None,
                0,
                Some(std::mem::transmute::<
                    usize,
                    unsafe extern "system" fn(*mut c_void) -> u32,
                >(start as usize)),
                None,
                0,
                None,
            )
        }
        .map_err(|error| remote_error("CreateRemoteThread", &error))?;

        let wait = unsafe { WaitForSingleObject(thread, INFINITE) };
        unsafe { CloseHandle(thread).ok() };

        if wait != WAIT_OBJECT_0 {
            return Err(Error::remote("WaitForSingleObject", wait.0));
        }

        Ok(())
    }

    fn cfg_policy(&self) -> CfgPolicy {
        let mut flags = 0_u32;

        let queried = unsafe {
            GetProcessMitigationPolicy(
                self.handle,
                ProcessControlFlowGuardPolicy,
                std::ptr::addr_of_mut!(flags).cast::<c_void>(),
                std::mem::size_of::<u32>(),
            )
        }
        .is_ok();

        CfgPolicy {
            enabled: queried && flags & 0x1 != 0,
            export_suppression: queried && flags & 0x2 != 0,
        }
    }

    fn peb_address(&self) -> Result<u64> {
        match self.architecture {
            // A 32-bit target on a 64-bit host exposes its WOW64 PEB separately.
            Architecture::X86 if cfg!(target_pointer_width = "64") => {
                self.query_pointer(PROCESS_WOW64_INFORMATION_CLASS, 0)
            }
            // PROCESS_BASIC_INFORMATION.PebBaseAddress sits one host pointer in.
            _ => self.query_pointer(
                PROCESS_BASIC_INFORMATION_CLASS,
                std::mem::size_of::<usize>(),
            ),
        }
    }
}
