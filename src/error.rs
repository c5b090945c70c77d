//! Error types reachable from ordinary (non-hook) call sites.
//!
//! Nothing in this module is used from inside an allocator hook: those
//! paths cannot unwind across the `extern "C"` boundary and instead abort
//! the process directly (see `platform::fatal`).

/// Errors surfaced by the public, non-hook API.
#[derive(Debug, thiserror::Error)]
pub enum MemoryToolsError {
    /// Returned by [`crate::initialize`] when the current platform has no
    /// interposition backend (currently: any target other than Linux-like
    /// ELF platforms and Apple platforms).
    #[error("memory-tools has no interposition backend for this platform")]
    PlatformUnsupported,
}
