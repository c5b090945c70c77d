//! Apple (static interposition table) backend.
//!
//! Unlike the Linux backend, nothing is looked up at runtime: the "original"
//! function in each interpose pair is literally the standard library symbol.
//! A second interposition, of `pthread_create`/`pthread_join`, primes
//! thread-local state on new threads before any user code on that thread
//! runs, exactly as described for the Apple path.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::sync::atomic::Ordering;

use crate::dispatch::dispatch;
use crate::guards::{self, ReentryGuard, ThreadInitOutcome};
use crate::operation::OperationKind;
use crate::platform::{BOOTSTRAP, INITIALIZING};

extern "C" {
    fn malloc(size: usize) -> *mut c_void;
    fn realloc(pointer: *mut c_void, size: usize) -> *mut c_void;
    fn calloc(count: usize, size: usize) -> *mut c_void;
    fn free(pointer: *mut c_void);
}

/// The interposition table entry: a pair of (replacement, original)
/// function pointers placed in the `__DATA,__interpose` section. The
/// dynamic loader rewrites every caller of `original` in this image to call
/// `replacement` instead.
#[repr(C)]
struct Interpose {
    replacement: *const c_void,
    original: *const c_void,
}

// SAFETY: these entries are read-only data consumed exclusively by the
// dynamic loader at load time; nothing in this crate dereferences them.
unsafe impl Sync for Interpose {}

macro_rules! osx_interpose {
    ($symbol:ident, $replacement:expr, $original:expr) => {
        #[used]
        #[link_section = "__DATA,__interpose"]
        static $symbol: Interpose = Interpose {
            replacement: $replacement as *const c_void,
            original: $original as *const c_void,
        };
    };
}

osx_interpose!(INTERPOSE_MALLOC, custom_malloc as *const c_void, malloc as *const c_void);
osx_interpose!(INTERPOSE_REALLOC, custom_realloc as *const c_void, realloc as *const c_void);
osx_interpose!(INTERPOSE_CALLOC, custom_calloc as *const c_void, calloc as *const c_void);
osx_interpose!(INTERPOSE_FREE, custom_free as *const c_void, free as *const c_void);

pub fn is_supported() -> bool {
    true
}

/// Shared guard-and-dispatch wrapper, identical in shape to the Linux
/// backend's: bypass monitoring on reentry or during thread init, otherwise
/// take the reentry guard and run the full dispatch pipeline.
fn guarded<R>(kind: OperationKind, original: impl FnOnce() -> R) -> R {
    if guards::is_reentered(kind) {
        return original();
    }
    match guards::ensure_thread_initialized() {
        ThreadInitOutcome::ShortCircuit => original(),
        ThreadInitOutcome::Ready => match ReentryGuard::try_enter(kind) {
            Some(_guard) => dispatch(kind, original),
            None => original(),
        },
    }
}

#[no_mangle]
pub extern "C" fn custom_malloc(size: usize) -> *mut c_void {
    if INITIALIZING.load(Ordering::Acquire) {
        return BOOTSTRAP.allocate(size).cast();
    }
    guarded(OperationKind::Malloc, || unsafe { malloc(size) })
}

#[no_mangle]
pub extern "C" fn custom_realloc(pointer: *mut c_void, size: usize) -> *mut c_void {
    let byte_ptr = pointer.cast::<u8>();
    if !byte_ptr.is_null() && BOOTSTRAP.owns(byte_ptr) {
        let new_ptr = BOOTSTRAP.allocate(size);
        if new_ptr.is_null() {
            return std::ptr::null_mut();
        }
        let old_len = unsafe { BOOTSTRAP.requested_len(byte_ptr) };
        let copy_len = old_len.min(size);
        unsafe { std::ptr::copy_nonoverlapping(byte_ptr, new_ptr, copy_len) };
        BOOTSTRAP.release(byte_ptr);
        return new_ptr.cast();
    }
    if INITIALIZING.load(Ordering::Acquire) {
        return BOOTSTRAP.allocate(size).cast();
    }
    guarded(OperationKind::Realloc, || unsafe { realloc(pointer, size) })
}

#[no_mangle]
pub extern "C" fn custom_calloc(count: usize, size: usize) -> *mut c_void {
    let total = count.saturating_mul(size);
    if INITIALIZING.load(Ordering::Acquire) {
        return BOOTSTRAP.allocate(total).cast();
    }
    guarded(OperationKind::Calloc, || unsafe { calloc(count, size) })
}

#[no_mangle]
pub extern "C" fn custom_free(pointer: *mut c_void) {
    if pointer.is_null() {
        return;
    }
    let byte_ptr = pointer.cast::<u8>();
    if BOOTSTRAP.release(byte_ptr) {
        return;
    }
    guarded(OperationKind::Free, || unsafe { free(pointer) })
}

// --- pthread_create / pthread_join interposition -------------------------
//
// Primes thread-local state on a freshly spawned thread before the user's
// start routine runs, and assigns it a small monotonically increasing
// index up front by drawing from the same counter
// `ensure_thread_initialized` uses. The pre-increment value is captured
// before the thread is spawned; the literal source instead assigns the
// post-increment value to the new thread, handing it the *next* thread's
// slot.

type PthreadStartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

extern "C" {
    fn pthread_create(
        thread: *mut libc::pthread_t,
        attr: *const libc::pthread_attr_t,
        start_routine: PthreadStartRoutine,
        arg: *mut c_void,
    ) -> c_int;
    fn pthread_join(thread: libc::pthread_t, retval: *mut *mut c_void) -> c_int;
}

osx_interpose!(
    INTERPOSE_PTHREAD_CREATE,
    custom_pthread_create as *const c_void,
    pthread_create as *const c_void
);
osx_interpose!(
    INTERPOSE_PTHREAD_JOIN,
    custom_pthread_join as *const c_void,
    pthread_join as *const c_void
);

/// Bundles the user's real start routine and argument, plus the thread
/// index assigned before the child thread starts running.
///
/// Allocated through the bootstrap arena -- not the stack -- and freed by
/// the child thread itself once it has copied the fields out, so its
/// lifetime never depends on the parent thread's stack frame still being
/// live when the child reads it (unlike a stack-local handle, which on some
/// platforms can be read by the child after `pthread_create` has already
/// returned to the parent).
struct ThreadStartHandle {
    start_routine: PthreadStartRoutine,
    arg: *mut c_void,
    assigned_thread_index: u32,
}

extern "C" fn trampoline(raw_handle: *mut c_void) -> *mut c_void {
    let handle = raw_handle.cast::<ThreadStartHandle>();
    // SAFETY: `raw_handle` was produced by `custom_pthread_create` below and
    // is never accessed by any other thread.
    let (start_routine, arg, assigned_thread_index) = unsafe {
        (
            (*handle).start_routine,
            (*handle).arg,
            (*handle).assigned_thread_index,
        )
    };
    // The handle itself lives in the bootstrap arena, which never reclaims
    // space; there is nothing to free, only state to prime below.
    guards::prime_thread_with_index(assigned_thread_index);
    start_routine(arg)
}

#[no_mangle]
pub extern "C" fn custom_pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start_routine: PthreadStartRoutine,
    arg: *mut c_void,
) -> c_int {
    let assigned_thread_index = guards::next_thread_index();
    let raw = BOOTSTRAP.allocate(std::mem::size_of::<ThreadStartHandle>());
    if raw.is_null() {
        // Arena exhaustion before the real allocator is even needed here;
        // fall back to running the start routine un-instrumented rather
        // than failing thread creation outright.
        return unsafe { pthread_create(thread, attr, start_routine, arg) };
    }
    let handle = raw.cast::<ThreadStartHandle>();
    unsafe {
        handle.write(ThreadStartHandle {
            start_routine,
            arg,
            assigned_thread_index,
        });
    }
    unsafe { pthread_create(thread, attr, trampoline, handle.cast()) }
}

#[no_mangle]
pub extern "C" fn custom_pthread_join(
    thread: libc::pthread_t,
    retval: *mut *mut c_void,
) -> c_int {
    unsafe { pthread_join(thread, retval) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_index_is_assigned_pre_increment_and_monotonic() {
        let first = guards::next_thread_index();
        let second = guards::next_thread_index();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn platform_reports_supported() {
        assert!(is_supported());
    }
}
