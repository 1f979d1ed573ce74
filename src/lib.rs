#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # mapldr
//!
//! A remote manual-mapping engine for Windows dynamic libraries. `mapldr` loads a
//! DLL into an already-running foreign process without handing the target file to
//! that process's loader API, performing every step the OS loader would: image
//! parsing, dependency loading, import resolution, base relocation, section
//! mapping with correct page protections, control-flow-guard and security-cookie
//! initialisation, exception-directory and TLS registration, and entry-point
//! invocation, followed by a full reversal on unmap.
//!
//! ## Features
//!
//! - **Two architectures, one implementation** - x86 and x64 targets share every
//!   algorithm; width- and layout-dependent constants come from a per-architecture
//!   descriptor table selected at runtime
//! - **Local staging** - IAT and relocation patches are applied data-parallel to a
//!   local copy of the image before anything is written to the foreign process
//! - **Full reversal** - every mapping step records its undo action; failures roll
//!   back LIFO and `unmap` mirrors the whole sequence
//! - **Loader-faithful registration** - TLS bitmap/list and inverted function
//!   table mutations run under the foreign PEB lock, exactly as the OS loader
//!   serialises its own
//! - **Testable off-target** - all foreign-process effects flow through the
//!   [`RemoteProcess`] trait, so the engine runs against an in-memory double on
//!   any platform
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mapldr::prelude::*;
//!
//! # #[cfg(windows)]
//! # fn main() -> mapldr::Result<()> {
//! let process = Arc::new(WindowsProcess::open(1234)?);
//! let resolver = SearchOrderResolver::new(process.path()?, None, process.architecture());
//! let symbols = SymbolTable::new();
//!
//! let mut mapper = LibraryMapper::from_file(
//!     process,
//!     "payload.dll".as_ref(),
//!     Box::new(symbols),
//!     Box::new(resolver),
//!     MappingFlags::empty(),
//! )?;
//!
//! mapper.map()?;
//! println!("Mapped at {:#x}", mapper.base_address());
//! mapper.unmap()?;
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```
//!
//! ## Architecture
//!
//! - [`image`] - the immutable parsed PE view: sections, imports, exports,
//!   relocations, TLS, load-config, resources
//! - [`process`] - the foreign-process layer: the [`RemoteProcess`] seam, the
//!   module cache, export/forwarder/API-set resolution, remote routine calls
//! - [`registry`] - foreign loader state: TLS bitmap/list and the inverted
//!   function table
//! - [`mapper`] - the map/unmap state machine
//! - [`resolve`] - dependency file resolution
//!
//! ## Limitations
//!
//! Managed (CLR) images are rejected at parse time. Remote calls are synchronous
//! with no timeout: a hung routine in the foreign process blocks the engine.
//! Mapping across pointer widths (a 64-bit image from a 32-bit host) is not
//! supported.

#[macro_use]
pub(crate) mod error;

pub(crate) mod arch;
pub(crate) mod stub;

/// The parsed, immutable view of the DLL being mapped.
pub mod image;

/// The map/unmap state machine.
pub mod mapper;

/// Foreign-process primitives, module cache, and symbol resolution.
pub mod process;

/// Foreign loader registries: TLS bitmap/list and the inverted function table.
pub mod registry;

/// Dependency file resolution.
pub mod resolve;

/// Convenient re-exports of the most commonly used types.
pub mod prelude;

pub use arch::Architecture;
pub use error::Error;
pub use image::Image;
pub use mapper::{LibraryMapper, MappingFlags};

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
