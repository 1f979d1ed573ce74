//! Registration of the mapped image with the foreign loader's private state.
//!
//! A manually mapped image is invisible to the system loader, so the runtime
//! services that consult loader state need to be wired up by hand: exception
//! dispatch walks the inverted function table, and implicit TLS needs a slot in
//! the loader's TLS bitmap and an entry in its TLS list. Every mutation of those
//! structures happens under the foreign PEB lock and is reversed on unmap.

pub(crate) mod bitmap;
pub(crate) mod exceptions;
pub(crate) mod peb_lock;
pub(crate) mod tls;

pub use tls::TlsBinding;
