//! # mapldr Prelude
//!
//! Convenient re-exports of the types most embeddings need: the mapper, its
//! flags, the process and resolver seams, and the error types.

/// The error type for all mapping operations
pub use crate::Error;

/// The result type used throughout the crate
pub use crate::Result;

/// The mapping engine and its behaviour flags
pub use crate::mapper::{LibraryMapper, MappingFlags};

/// The pointer-width tag of images and processes
pub use crate::Architecture;

/// The parsed image model
pub use crate::image::Image;

/// The foreign-process seam and its page protections
pub use crate::process::{Protection, RemoteProcess};

/// Module cache entries and the symbol-resolution seam
pub use crate::process::{Module, ProcessContext, SymbolSource, SymbolTable};

/// Dependency file resolution
pub use crate::resolve::{FileResolver, SearchOrderResolver};

/// The live Windows process backend
#[cfg(windows)]
pub use crate::process::WindowsProcess;
