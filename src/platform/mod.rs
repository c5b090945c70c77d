//! Platform-specific installation of replacement allocator symbols.
//!
//! Three variants, selected at compile time:
//! - `linux` (any ELF/`dlsym`-capable Unix): the real `malloc`/`realloc`/
//!   `calloc`/`free` symbols are exported directly; the original is found
//!   with `dlsym(RTLD_NEXT, ..)`.
//! - `macos`: a static interposition table redirects callers to our
//!   replacements; the "original" is simply the standard library symbol,
//!   no runtime lookup needed.
//! - `windows`: no interposition is installed. The public API stays
//!   callable but no hook ever runs.

use crate::bootstrap::BootstrapArena;
use std::sync::atomic::AtomicBool;

/// Shared by every non-Windows backend: satisfies allocations issued
/// before the original allocator symbols are resolved.
pub(crate) static BOOTSTRAP: BootstrapArena = BootstrapArena::new();

/// True from process start until the platform backend finishes resolving
/// the original allocator. Backed by static initialization (not a runtime
/// store), so it is `true` for any call -- including ones from the
/// dynamic linker itself -- that happens before our load-time constructor
/// has had a chance to run.
pub(crate) static INITIALIZING: AtomicBool = AtomicBool::new(true);

#[cfg(all(unix, not(target_os = "macos")))]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
// Windows, and any other platform without a backend above, gets the
// no-op stub: the public API stays callable but no hook ever runs.
#[cfg(not(any(unix)))]
mod windows;

#[cfg(all(unix, not(target_os = "macos")))]
pub use linux::is_supported;
#[cfg(target_os = "macos")]
pub use macos::is_supported;
#[cfg(not(any(unix)))]
pub use windows::is_supported;
