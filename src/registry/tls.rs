//! Reservation of a loader TLS slot and list entry for the mapped image.
//!
//! Implicit TLS support requires two pieces of foreign loader state: a bit in the
//! loader's TLS index bitmap and a node in its global TLS entry list carrying a
//! copy of the image's TLS directory. Both live behind unexported `ntdll` symbols
//! and are mutated under the foreign PEB lock.

use super::{bitmap, peb_lock::PebLockGuard};
use crate::{process::ProcessContext, Error, Result};

/// Symbol of the loader's `RTL_BITMAP` of allocated TLS indices.
const TLS_BITMAP_SYMBOL: &str = "LdrpTlsBitmap";
/// Symbol of the static buffer backing the bitmap before its first growth.
const TLS_STATIC_VECTOR_SYMBOL: &str = "LdrpStaticTlsBitmapVector";
/// Symbol of the loader's doubly linked list of per-module TLS entries.
const TLS_LIST_SYMBOL: &str = "LdrpTlsList";

/// Logical bitmap size installed when the loader has never initialised it.
const INITIAL_BITMAP_BITS: u32 = 64;

/// The foreign TLS state reserved for one mapped image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsBinding {
    /// The reserved TLS index.
    pub index: u32,
    /// Address of the list entry allocated from the foreign process heap.
    pub entry_address: u64,
}

/// Reserves a TLS index and splices a list entry holding `directory`, the image's
/// relocated TLS directory bytes.
///
/// # Errors
///
/// Returns an error when the loader symbols cannot be resolved or any foreign
/// operation fails; a partially built entry is released before returning.
pub(crate) fn insert_tls_entry(
    context: &ProcessContext,
    directory: &[u8],
) -> Result<TlsBinding> {
    let layout = context.architecture().layout();

    if directory.len() != layout.tls_entry.directory_size {
        return Err(Error::InvalidInput(format!(
            "TLS directory must be {} bytes, got {}",
            layout.tls_entry.directory_size,
            directory.len()
        )));
    }

    let _guard = PebLockGuard::acquire(context)?;

    let index = reserve_bitmap_index(context)?;
    let entry_address = context.heap_alloc(layout.tls_entry.size)?;

    let populate = || -> Result<()> {
        let process = context.process();

        process.write(entry_address + layout.tls_entry.directory as u64, directory)?;
        process.write_u32(entry_address + layout.tls_entry.index as u64, index)?;

        splice_list_entry(context, entry_address)
    };

    if let Err(error) = populate() {
        let _ = context.heap_free(entry_address);
        let _ = release_bitmap_index(context, index);
        return Err(error);
    }

    log::debug!("Reserved TLS index {index} with list entry at {entry_address:#x}");

    Ok(TlsBinding {
        index,
        entry_address,
    })
}

/// Unlinks the list entry, frees it, and releases the bitmap index.
///
/// # Errors
///
/// Returns the first failure; later steps are still attempted.
pub(crate) fn remove_tls_entry(context: &ProcessContext, binding: &TlsBinding) -> Result<()> {
    let pointer_size = context.architecture().pointer_size() as u64;
    let _guard = PebLockGuard::acquire(context)?;
    let process = context.process();

    let mut first_error = None;

    let unlink = || -> Result<()> {
        let flink = process.read_ptr(binding.entry_address)?;
        let blink = process.read_ptr(binding.entry_address + pointer_size)?;

        if flink != 0 {
            process.write_ptr(flink + pointer_size, blink)?;
        }
        if blink != 0 {
            process.write_ptr(blink, flink)?;
        }

        Ok(())
    };

    if let Err(error) = unlink() {
        first_error.get_or_insert(error);
    }

    if let Err(error) = context.heap_free(binding.entry_address) {
        first_error.get_or_insert(error);
    }

    if let Err(error) = release_bitmap_index(context, binding.index) {
        first_error.get_or_insert(error);
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Scans the loader bitmap for a clear bit, growing the bitmap when full.
fn reserve_bitmap_index(context: &ProcessContext) -> Result<u32> {
    let layout = context.architecture().layout();
    let pointer_size = context.architecture().pointer_size() as u64;
    let process = context.process();

    let bitmap = context.get_ntdll_symbol_address(TLS_BITMAP_SYMBOL)?;
    let mut size = process.read_u32(bitmap)?;
    let mut buffer = process.read_ptr(bitmap + pointer_size)?;

    if size == 0 || buffer == 0 {
        // Never initialised: point it at the loader's static vector.
        buffer = context.get_ntdll_symbol_address(TLS_STATIC_VECTOR_SYMBOL)?;
        size = INITIAL_BITMAP_BITS;

        process.write_u32(bitmap, size)?;
        process.write_ptr(bitmap + pointer_size, buffer)?;
    }

    let mut bits = vec![0_u8; size.div_ceil(8) as usize];
    process.read(buffer, &mut bits)?;

    if let Some(index) = bitmap::find_clear_bit_and_set(&mut bits, size as usize) {
        process.write(buffer, &bits)?;
        return Ok(index as u32);
    }

    // Bitmap exhausted: widen the logical size. Heap-backed buffers are always
    // allocated one whole granule past the logical size, so the capacity of the
    // current backing allocation is the next granule boundary above it; the
    // static vector holds exactly the initial bits. Only a size crossing that
    // boundary reallocates, copying forward and freeing the replaced buffer.
    let growth = layout.tls_bitmap_growth;
    let granule = growth * 2;
    let new_size = size + growth;

    let static_vector = context.get_ntdll_symbol_address(TLS_STATIC_VECTOR_SYMBOL)?;
    let capacity = if buffer == static_vector {
        INITIAL_BITMAP_BITS
    } else {
        (size / granule + 1) * granule
    };

    let index = size;
    let mut grown = vec![0_u8; new_size.div_ceil(8) as usize];
    grown[..bits.len()].copy_from_slice(&bits);
    bitmap::set_bit(&mut grown, index as usize);

    if new_size >= capacity {
        let new_capacity = (new_size / granule + 1) * granule;
        let new_buffer = context.heap_alloc((new_capacity / 8) as usize)?;

        process.write(new_buffer, &grown)?;
        process.write_ptr(bitmap + pointer_size, new_buffer)?;

        if buffer != static_vector {
            if let Err(error) = context.heap_free(buffer) {
                log::warn!("Failed to free the replaced TLS bitmap buffer: {error}");
            }
        }
    } else {
        process.write(buffer, &grown)?;
    }

    process.write_u32(bitmap, new_size)?;

    Ok(index)
}

/// Clears one index in the loader bitmap.
fn release_bitmap_index(context: &ProcessContext, index: u32) -> Result<()> {
    let pointer_size = context.architecture().pointer_size() as u64;
    let process = context.process();

    let bitmap = context.get_ntdll_symbol_address(TLS_BITMAP_SYMBOL)?;
    let size = process.read_u32(bitmap)?;
    let buffer = process.read_ptr(bitmap + pointer_size)?;

    if size == 0 || buffer == 0 || index >= size {
        return Ok(());
    }

    let mut bits = vec![0_u8; size.div_ceil(8) as usize];
    process.read(buffer, &mut bits)?;
    bitmap::clear_bit(&mut bits, index as usize);
    process.write(buffer, &bits)
}

/// Splices the entry in front of the list head, distinguishing the empty list
/// from insertion into a populated one.
fn splice_list_entry(context: &ProcessContext, entry_address: u64) -> Result<()> {
    let pointer_size = context.architecture().pointer_size() as u64;
    let process = context.process();

    let list_head = context.get_ntdll_symbol_address(TLS_LIST_SYMBOL)?;
    let first = process.read_ptr(list_head)?;

    if first == 0 || first == list_head {
        // Empty list: the entry becomes both neighbours of the head.
        process.write_ptr(entry_address, list_head)?;
        process.write_ptr(entry_address + pointer_size, list_head)?;
        process.write_ptr(list_head, entry_address)?;
        process.write_ptr(list_head + pointer_size, entry_address)?;
    } else {
        let last = process.read_ptr(list_head + pointer_size)?;

        process.write_ptr(entry_address, list_head)?;
        process.write_ptr(entry_address + pointer_size, last)?;
        process.write_ptr(last, entry_address)?;
        process.write_ptr(list_head + pointer_size, entry_address)?;
    }

    Ok(())
}
