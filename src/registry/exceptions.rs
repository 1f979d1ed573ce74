//! Insertion and removal of inverted function table entries.
//!
//! The inverted function table is a fixed-capacity array sorted ascending by image
//! base that exception dispatch consults to find a module's unwind data without
//! walking the loader's module list. Index 0 belongs to `ntdll` itself and never
//! moves. On x86 the exception directory address is stored encoded with the
//! process-wide rotation cookie from `KUSER_SHARED_DATA`.

use super::peb_lock::PebLockGuard;
use crate::{
    arch::Architecture,
    image::io::{read_le, write_le_at},
    process::ProcessContext,
    Result,
};

/// Size of the table header preceding the entry array.
const TABLE_HEADER_SIZE: u64 = 16;
/// Fixed address of `KUSER_SHARED_DATA` in every process.
const SHARED_USER_DATA_ADDRESS: u64 = 0x7FFE_0000;
/// Offset of the rotation cookie within `KUSER_SHARED_DATA`.
const SHARED_DATA_COOKIE_OFFSET: u64 = 0x330;

/// The exception metadata of the image being registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExceptionTableData {
    /// RVA of the exception directory (x64) or SEH handler table (x86).
    pub directory_rva: u32,
    /// Directory size in bytes (x64) or handler count (x86).
    pub size_or_count: u32,
}

fn table_address(context: &ProcessContext) -> Result<u64> {
    let symbol = match context.architecture() {
        Architecture::X86 => "LdrpInvertedFunctionTable",
        Architecture::X64 => "KiUserInvertedFunctionTable",
    };

    context.get_ntdll_symbol_address(symbol)
}

/// Inserts an entry for the image at `base_address`, keeping the array sorted.
///
/// A full table is marked overflowed instead of failing; exception dispatch then
/// degrades to its slower fallback path for every module.
///
/// # Errors
///
/// Returns an error when the table cannot be located or a foreign operation fails.
pub(crate) fn insert_function_table_entry(
    context: &ProcessContext,
    base_address: u64,
    image_size: u32,
    data: &ExceptionTableData,
) -> Result<()> {
    let layout = context.architecture().layout();
    let entry_layout = &layout.function_table_entry;
    let table = table_address(context)?;

    let _guard = PebLockGuard::acquire(context)?;
    let process = context.process();

    let count = process.read_u32(table)?;
    let max_count = process.read_u32(table + 4)?;
    let overflow = process.read_u32(table + 0xC)?;

    if overflow != 0 {
        return Ok(());
    }

    if count == max_count {
        log::warn!("Inverted function table is full, marking it overflowed");
        return process.write_u32(table + 0xC, 1);
    }

    // Read the occupied entries to find the sorted insertion slot; index 0 is the
    // unmovable sentinel.
    let entries_address = table + TABLE_HEADER_SIZE;
    let mut entries = vec![0_u8; entry_layout.size * count as usize];
    process.read(entries_address, &mut entries)?;

    let mut insertion_index = 1_usize;

    while insertion_index < count as usize {
        let entry_base = read_entry_base(context, &entries, insertion_index)?;

        if base_address < entry_base {
            break;
        }

        insertion_index += 1;
    }

    if insertion_index < count as usize {
        let tail = entries[insertion_index * entry_layout.size..].to_vec();
        process.write(
            entries_address + ((insertion_index + 1) * entry_layout.size) as u64,
            &tail,
        )?;
    }

    let directory_address = base_address + u64::from(data.directory_rva);
    let stored_directory = match context.architecture() {
        Architecture::X86 => {
            let cookie =
                process.read_u32(SHARED_USER_DATA_ADDRESS + SHARED_DATA_COOKIE_OFFSET)?;
            u64::from((directory_address as u32 ^ cookie).rotate_right(cookie & 0x1F))
        }
        Architecture::X64 => directory_address,
    };

    let mut entry = vec![0_u8; entry_layout.size];
    write_pointer(context, &mut entry, entry_layout.exception_directory, stored_directory)?;
    write_pointer(context, &mut entry, entry_layout.image_base, base_address)?;
    write_le_at::<u32>(&mut entry, entry_layout.image_size, image_size)?;
    write_le_at::<u32>(&mut entry, entry_layout.table_size, data.size_or_count)?;

    process.write(
        entries_address + (insertion_index * entry_layout.size) as u64,
        &entry,
    )?;
    process.write_u32(table, count + 1)
}

/// Removes the entry whose image base matches `base_address` exactly.
///
/// Removal always creates room, so the overflow flag is cleared.
///
/// # Errors
///
/// Returns an error when the table cannot be located or a foreign operation fails.
pub(crate) fn remove_function_table_entry(
    context: &ProcessContext,
    base_address: u64,
) -> Result<()> {
    let entry_layout = &context.architecture().layout().function_table_entry;
    let table = table_address(context)?;

    let _guard = PebLockGuard::acquire(context)?;
    let process = context.process();

    let count = process.read_u32(table)?;
    let entries_address = table + TABLE_HEADER_SIZE;
    let mut entries = vec![0_u8; entry_layout.size * count as usize];
    process.read(entries_address, &mut entries)?;

    for index in 1..count as usize {
        if read_entry_base(context, &entries, index)? != base_address {
            continue;
        }

        if index + 1 < count as usize {
            let tail = entries[(index + 1) * entry_layout.size..].to_vec();
            process.write(entries_address + (index * entry_layout.size) as u64, &tail)?;
        }

        // The previously last slot is vacated either way.
        let cleared = vec![0_u8; entry_layout.size];
        process.write(
            entries_address + ((count as usize - 1) * entry_layout.size) as u64,
            &cleared,
        )?;

        process.write_u32(table, count - 1)?;
        return process.write_u32(table + 0xC, 0);
    }

    Ok(())
}

fn read_entry_base(context: &ProcessContext, entries: &[u8], index: usize) -> Result<u64> {
    let entry_layout = &context.architecture().layout().function_table_entry;
    let offset = index * entry_layout.size + entry_layout.image_base;

    match context.architecture() {
        Architecture::X86 => Ok(u64::from(read_le::<u32>(&entries[offset..])?)),
        Architecture::X64 => read_le::<u64>(&entries[offset..]),
    }
}

fn write_pointer(
    context: &ProcessContext,
    entry: &mut [u8],
    offset: usize,
    value: u64,
) -> Result<()> {
    match context.architecture() {
        Architecture::X86 => write_le_at::<u32>(entry, offset, value as u32),
        Architecture::X64 => write_le_at::<u64>(entry, offset, value),
    }
}
