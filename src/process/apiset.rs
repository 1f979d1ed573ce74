//! API set contract resolution against the foreign process's namespace.
//!
//! Modern Windows DLL import names are frequently virtual contracts such as
//! `api-ms-win-core-memory-l1-1-0.dll`. The loader resolves them through the
//! API set namespace mapped into every process and referenced from its PEB; the
//! resolution here reads that structure directly from the foreign process so the
//! result matches what the foreign loader would pick.

use super::native::RemoteProcess;
use crate::Result;

/// Size of one `API_SET_HASH_ENTRY`.
const HASH_ENTRY_SIZE: u64 = 8;
/// Size of one `API_SET_NAMESPACE_ENTRY`.
const NAMESPACE_ENTRY_SIZE: u64 = 24;

/// Whether `module_name` is a virtual API set contract rather than a real DLL.
pub(crate) fn is_api_set(module_name: &str) -> bool {
    let lowered = module_name.to_lowercase();

    lowered.starts_with("api-ms") || lowered.starts_with("ext-ms")
}

/// Resolves an API set contract to its host module name, or `None` when the
/// namespace has no entry for it.
///
/// The namespace hash covers the contract name up to (not including) its last
/// hyphen, folding each lowercased character with the namespace's hash factor.
pub(crate) fn resolve_api_set(
    process: &(impl RemoteProcess + ?Sized),
    api_set_name: &str,
) -> Result<Option<String>> {
    let layout = process.architecture().layout();
    let peb = process.peb_address()?;
    let namespace = process.read_ptr(peb + layout.peb.api_set_map)?;

    let count = process.read_u32(namespace + 0xC)?;
    let entry_offset = u64::from(process.read_u32(namespace + 0x10)?);
    let hash_offset = u64::from(process.read_u32(namespace + 0x14)?);
    let hash_factor = process.read_u32(namespace + 0x18)?;

    let Some(hyphen) = api_set_name.rfind('-') else {
        return Ok(None);
    };

    let name_hash = api_set_name[..hyphen].chars().fold(0_u32, |hash, ch| {
        hash.wrapping_mul(hash_factor)
            .wrapping_add(ch.to_ascii_lowercase() as u32)
    });

    let mut low = 0_i64;
    let mut high = i64::from(count) - 1;

    while low <= high {
        let middle = (low + high) / 2;
        let hash_entry = namespace + hash_offset + HASH_ENTRY_SIZE * middle as u64;
        let entry_hash = process.read_u32(hash_entry)?;

        if name_hash == entry_hash {
            let entry_index = u64::from(process.read_u32(hash_entry + 4)?);
            let namespace_entry = namespace + entry_offset + NAMESPACE_ENTRY_SIZE * entry_index;

            // The first value entry of the namespace entry carries the default host.
            let value_entry = namespace + u64::from(process.read_u32(namespace_entry + 0x10)?);
            let value_offset = u64::from(process.read_u32(value_entry + 0xC)?);
            let value_count = process.read_u32(value_entry + 0x10)? as usize;

            let mut raw_value = vec![0_u8; value_count];
            process.read(namespace + value_offset, &mut raw_value)?;

            let wide: Vec<u16> = raw_value
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();

            return Ok(Some(
                widestring::U16String::from_vec(wide).to_string_lossy(),
            ));
        }

        if name_hash < entry_hash {
            high = middle - 1;
        } else {
            low = middle + 1;
        }
    }

    Ok(None)
}
