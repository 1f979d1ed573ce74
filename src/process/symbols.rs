//! Resolution of private loader symbols.
//!
//! The registration steps need the addresses of a handful of unexported `ntdll`
//! variables (the TLS bitmap and list, the inverted function table). Those are
//! debug symbols, not exports, so their RVAs come from a [`SymbolSource`] supplied
//! by the embedding application, typically fed from the module's PDB.

use std::collections::HashMap;

use crate::{arch::Architecture, Error, Result};

/// Provides RVAs of private symbols within the foreign loader module.
pub trait SymbolSource: Send + Sync {
    /// Resolves `name` to its RVA for the given architecture.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resolution`] when the symbol is unknown.
    fn resolve(&self, architecture: Architecture, name: &str) -> Result<u32>;
}

/// A static symbol table backed by a map.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: HashMap<(Architecture, String), u32>,
}

impl SymbolTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Records the RVA of `name` for one architecture.
    pub fn insert(&mut self, architecture: Architecture, name: &str, rva: u32) {
        self.entries.insert((architecture, name.to_owned()), rva);
    }
}

impl SymbolSource for SymbolTable {
    fn resolve(&self, architecture: Architecture, name: &str) -> Result<u32> {
        self.entries
            .get(&(architecture, name.to_owned()))
            .copied()
            .ok_or_else(|| Error::Resolution(format!("Failed to resolve symbol {name}")))
    }
}
