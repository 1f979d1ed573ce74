//! Behaviour flags for a mapping session.

use bitflags::bitflags;

bitflags! {
    /// Options altering what a [`crate::LibraryMapper`] maps and runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MappingFlags: u32 {
        /// Leave the PE header region out of the foreign image.
        const DISCARD_HEADERS = 0x1;
        /// Skip TLS callbacks and the entry point on both map and unmap.
        const SKIP_INIT_ROUTINES = 0x2;
    }
}
