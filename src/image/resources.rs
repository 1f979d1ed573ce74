//! Resource directory reader for the embedded SxS manifest.

use goblin::pe::data_directories::DataDirectoryType;

use super::{io::read_le, Image};
use crate::Result;

/// Size of `IMAGE_RESOURCE_DIRECTORY`.
const RESOURCE_DIRECTORY_SIZE: usize = 16;
/// Size of `IMAGE_RESOURCE_DIRECTORY_ENTRY`.
const RESOURCE_ENTRY_SIZE: usize = 8;
/// Resource type identifier of manifests (`RT_MANIFEST`).
const MANIFEST_RESOURCE_ID: u32 = 24;
/// Manifest identifier used by isolation-aware DLLs.
const DLL_MANIFEST_ID: u32 = 2;

impl Image {
    /// Extracts the embedded activation-context manifest, when the image has one.
    ///
    /// The manifest is returned as sanitised XML text: doubled quotes are collapsed
    /// and the unresolved `SXS_*` placeholder tokens some system DLLs ship are
    /// blanked so the document parses.
    ///
    /// # Errors
    ///
    /// Returns an error when the resource directory is malformed or truncated.
    pub fn manifest(&self) -> Result<Option<String>> {
        let Some((directory_rva, _)) = self.data_directory(DataDirectoryType::ResourceTable)
        else {
            return Ok(None);
        };

        let directory_offset = self.rva_to_offset(directory_rva as usize)?;
        let header = self.data_slice(directory_offset, RESOURCE_DIRECTORY_SIZE)?;
        let name_entries = read_le::<u16>(&header[0xC..])?;
        let id_entries = read_le::<u16>(&header[0xE..])?;
        let entry_count = usize::from(name_entries) + usize::from(id_entries);

        for index in 0..entry_count {
            let first_offset =
                directory_offset + RESOURCE_DIRECTORY_SIZE + RESOURCE_ENTRY_SIZE * index;
            let first = self.data_slice(first_offset, RESOURCE_ENTRY_SIZE)?;

            if read_le::<u32>(first)? != MANIFEST_RESOURCE_ID {
                continue;
            }

            // High bit set marks a subdirectory; the remainder is its offset.
            let second_offset = directory_offset
                + RESOURCE_DIRECTORY_SIZE
                + (read_le::<u32>(&first[4..])? & 0x7FFF_FFFF) as usize;
            let second = self.data_slice(second_offset, RESOURCE_ENTRY_SIZE)?;

            if read_le::<u32>(second)? != DLL_MANIFEST_ID {
                continue;
            }

            let third_offset = directory_offset
                + RESOURCE_DIRECTORY_SIZE
                + (read_le::<u32>(&second[4..])? & 0x7FFF_FFFF) as usize;
            let third = self.data_slice(third_offset, RESOURCE_ENTRY_SIZE)?;

            let data_entry_offset = directory_offset + read_le::<u32>(&third[4..])? as usize;
            let data_entry = self.data_slice(data_entry_offset, 8)?;
            let manifest_rva = read_le::<u32>(data_entry)?;
            let manifest_size = read_le::<u32>(&data_entry[4..])? as usize;

            let manifest_offset = self.rva_to_offset(manifest_rva as usize)?;
            let manifest_bytes = self.data_slice(manifest_offset, manifest_size)?;
            let manifest = String::from_utf8_lossy(manifest_bytes).into_owned();

            return Ok(Some(sanitise_manifest(&manifest)));
        }

        Ok(None)
    }
}

/// Collapses doubled quoting and blanks unresolved `SXS_*` placeholder tokens.
fn sanitise_manifest(manifest: &str) -> String {
    let mut manifest = collapse_doubled_quotes(manifest);

    for token in [
        "SXS_ASSEMBLY_NAME",
        "SXS_ASSEMBLY_VERSION",
        "SXS_PROCESSOR_ARCHITECTURE",
    ] {
        manifest = manifest.replace(token, "\"\"");
    }

    manifest
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rewrites `""value""` into `"value"` when `value` is a plain version-style token.
fn collapse_doubled_quotes(manifest: &str) -> String {
    let bytes = manifest.as_bytes();
    let mut output = String::with_capacity(manifest.len());
    let mut position = 0_usize;

    while position < bytes.len() {
        if bytes[position..].starts_with(b"\"\"") {
            let interior_start = position + 2;

            if let Some(interior_len) = bytes[interior_start..]
                .windows(2)
                .position(|window| window == b"\"\"")
            {
                let interior = &manifest[interior_start..interior_start + interior_len];

                if interior
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.')
                {
                    output.push('"');
                    output.push_str(interior);
                    output.push('"');
                    position = interior_start + interior_len + 2;
                    continue;
                }
            }
        }

        // Not a doubled-quote token; copy one char through.
        let ch = manifest[position..].chars().next().unwrap_or('\u{FFFD}');
        output.push(ch);
        position += ch.len_utf8();
    }

    output
}
