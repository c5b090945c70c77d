//! The bootstrap arena: a bump-pointer byte region that satisfies
//! allocations issued before the original allocator symbols are resolved.
//!
//! Sized at 8 MiB, the figure the original C++ implementation found
//! sufficient experimentally for the allocations the dynamic linker's own
//! error-reporting path performs while resolving symbols.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bytes reserved for the bootstrap arena.
const ARENA_SIZE: usize = 8 * 1024 * 1024;

/// Every allocation is preceded by a `usize` length header so that
/// `realloc` against an arena-owned pointer knows how many bytes to carry
/// over to the new allocation (the arena itself never reclaims space, so
/// the header costs nothing beyond the bump it already pays for).
const HEADER_SIZE: usize = std::mem::size_of::<usize>();

/// Alignment good enough for any allocator request this arena ever serves;
/// bootstrap allocations are small and short-lived metadata, not
/// user-facing buffers with strict alignment requirements.
const ALIGN: usize = std::mem::align_of::<usize>();

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A single-shot, bump-pointer byte arena.
///
/// `allocate` never reuses space; `release` never frees anything, it only
/// reports whether the pointer was ever handed out by this arena. Leaking
/// within the arena is intentional: it is small, bounded, and consumed only
/// during the single-shot bootstrap window.
pub struct BootstrapArena {
    storage: UnsafeCell<[u8; ARENA_SIZE]>,
    offset: AtomicUsize,
}

// SAFETY: all mutation of `storage` happens through the atomic bump
// counter in `offset`, which serializes the byte ranges handed out to
// distinct callers; no two `allocate` calls ever return overlapping ranges.
unsafe impl Sync for BootstrapArena {}

impl BootstrapArena {
    pub const fn new() -> Self {
        BootstrapArena {
            storage: UnsafeCell::new([0u8; ARENA_SIZE]),
            offset: AtomicUsize::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.storage.get().cast::<u8>()
    }

    /// Returns a pointer to `size` contiguous, zeroed bytes, or null if the
    /// arena's remaining capacity is insufficient.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let payload = align_up(size, ALIGN);
        let total = HEADER_SIZE + payload;
        loop {
            let current = self.offset.load(Ordering::Acquire);
            let next = match current.checked_add(total) {
                Some(next) if next <= ARENA_SIZE => next,
                _ => {
                    // SAFETY: writing directly to stderr; this runs on the
                    // single-shot bootstrap path and must not allocate.
                    eprintln!(
                        "memory-tools: bootstrap arena exhausted (requested {size} bytes)"
                    );
                    return std::ptr::null_mut();
                }
            };
            if self
                .offset
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: [current, next) was exclusively reserved by the
                // compare_exchange above and lies within `storage`.
                unsafe {
                    let header = self.base().add(current);
                    header.cast::<usize>().write(size);
                    let data = header.add(HEADER_SIZE);
                    std::ptr::write_bytes(data, 0, payload);
                    return data;
                }
            }
        }
    }

    /// True iff `ptr` is a live payload pointer previously returned by
    /// [`BootstrapArena::allocate`].
    pub fn owns(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let base = self.base() as usize;
        let p = ptr as usize;
        let high_water = self.offset.load(Ordering::Acquire);
        p >= base + HEADER_SIZE && p < base + high_water.max(HEADER_SIZE)
    }

    /// Frees nothing; returns whether `ptr` belongs to this arena.
    pub fn release(&self, ptr: *mut u8) -> bool {
        self.owns(ptr)
    }

    /// The length originally requested for an arena-owned `ptr`.
    ///
    /// # Safety
    /// `ptr` must satisfy `self.owns(ptr)`.
    pub unsafe fn requested_len(&self, ptr: *const u8) -> usize {
        unsafe { *ptr.sub(HEADER_SIZE).cast::<usize>() }
    }
}

impl Default for BootstrapArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_owns() {
        let arena = BootstrapArena::new();
        let p = arena.allocate(16);
        assert!(!p.is_null());
        assert!(arena.owns(p));
        assert!(!arena.owns(std::ptr::null()));
    }

    #[test]
    fn allocated_memory_is_zeroed() {
        let arena = BootstrapArena::new();
        let p = arena.allocate(32);
        let slice = unsafe { std::slice::from_raw_parts(p, 32) };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn requested_len_round_trips() {
        let arena = BootstrapArena::new();
        let p = arena.allocate(100);
        assert_eq!(unsafe { arena.requested_len(p) }, 100);
    }

    #[test]
    fn release_is_just_ownership_query() {
        let arena = BootstrapArena::new();
        let p = arena.allocate(8);
        assert!(arena.release(p));
        // "releasing" twice is still fine -- nothing is actually freed.
        assert!(arena.release(p));
    }

    #[test]
    fn unrelated_pointer_is_not_owned() {
        let arena = BootstrapArena::new();
        let local = 0u8;
        assert!(!arena.owns(&local as *const u8));
    }

    #[test]
    fn exhaustion_returns_null() {
        let arena = BootstrapArena::new();
        assert!(arena.allocate(ARENA_SIZE + 1).is_null());
    }
}
