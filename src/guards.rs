//! Per-thread recursion guards, expectation-scope counters, and the
//! thread-initialization dance that keeps the first allocation on a new
//! thread from deadlocking inside thread-local-storage setup.
//!
//! Guard state is split across two thread-locals. [`CORE`] holds only
//! `Cell`s of `Copy` types and has no `Drop` glue, so the very first access
//! to it on a new thread can never itself register a thread-exit
//! destructor. [`DEFERRED`] holds the `HashSet`-backed dedup state and does
//! have a `Drop` impl (it deregisters the thread from [`THREAD_REGISTRY`]
//! on exit); it is only ever first touched once `CORE.initializing` is
//! already `true`, so if registering *its* destructor itself allocates and
//! re-enters a hook, that reentrant call sees `CORE.initializing` set and
//! short-circuits before going anywhere near `DEFERRED` again.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::operation::OperationKind;
use crate::spinlock::SpinLock;

static THREAD_INIT_LOCK: SpinLock = SpinLock::new();
static NEXT_THREAD_INDEX: AtomicU32 = AtomicU32::new(0);

struct ThreadRegistry(UnsafeCell<HashSet<u32>>);

// SAFETY: every access to the inner HashSet happens inside
// `THREAD_INIT_LOCK.lock(..)`, which serializes all readers and writers.
unsafe impl Sync for ThreadRegistry {}

static THREAD_REGISTRY: ThreadRegistry = ThreadRegistry(UnsafeCell::new(HashSet::new()));

/// Number of distinct threads the process has ever seen touch a hook.
pub fn initialized_thread_count() -> usize {
    THREAD_INIT_LOCK.lock(|| unsafe { (*THREAD_REGISTRY.0.get()).len() })
}

/// Drop-glue-free thread-local state: reentry flags, forbidden-nesting
/// counters, and the thread-init flags themselves.
///
/// Every field is a `Cell` of a `Copy` type. Nothing here can allocate or
/// register a destructor when first materialized, which is what makes it
/// safe to touch from `is_reentered` on the very first hook call a new
/// thread ever makes.
struct CoreGuards {
    reentry: [Cell<bool>; 4],
    forbidden_counts: [Cell<u32>; 4],
    initialized: Cell<bool>,
    initializing: Cell<bool>,
    index: Cell<u32>,
}

impl CoreGuards {
    fn new() -> Self {
        CoreGuards {
            reentry: [
                Cell::new(false),
                Cell::new(false),
                Cell::new(false),
                Cell::new(false),
            ],
            forbidden_counts: [
                Cell::new(0),
                Cell::new(0),
                Cell::new(0),
                Cell::new(0),
            ],
            initialized: Cell::new(false),
            initializing: Cell::new(false),
            index: Cell::new(u32::MAX),
        }
    }
}

thread_local! {
    static CORE: CoreGuards = CoreGuards::new();
}

/// Drop-bearing thread-local state: per-kind sets of calling-function names
/// already reported within the current forbidden window, and the index this
/// thread is registered under in [`THREAD_REGISTRY`] (so it can deregister
/// itself on exit).
///
/// Deliberately kept separate from [`CoreGuards`] -- see the module-level
/// doc comment.
struct DeferredGuards {
    reported_callers: [RefCell<HashSet<String>>; 4],
    registered_index: Cell<Option<u32>>,
}

impl DeferredGuards {
    fn new() -> Self {
        DeferredGuards {
            reported_callers: [
                RefCell::new(HashSet::new()),
                RefCell::new(HashSet::new()),
                RefCell::new(HashSet::new()),
                RefCell::new(HashSet::new()),
            ],
            registered_index: Cell::new(None),
        }
    }
}

impl Drop for DeferredGuards {
    fn drop(&mut self) {
        if let Some(index) = self.registered_index.get() {
            THREAD_INIT_LOCK.lock(|| unsafe {
                (*THREAD_REGISTRY.0.get()).remove(&index);
            });
        }
    }
}

thread_local! {
    static DEFERRED: DeferredGuards = DeferredGuards::new();
}

/// Outcome of asking the hook to make sure this thread is past its
/// one-time initialization dance.
pub enum ThreadInitOutcome {
    /// The thread is initialized (possibly just now); proceed normally.
    Ready,
    /// This call is itself a recursive re-entry into the init procedure
    /// (e.g. registering a thread-exit destructor allocated). Serve this
    /// call from the original allocator directly and do not recurse
    /// further.
    ShortCircuit,
}

/// Runs the thread-initialization procedure described in the design: the
/// first time any hook runs on a new thread, mark initialization in
/// progress on the drop-glue-free [`CORE`] thread-local *before* touching
/// anything that might allocate, then register the thread's assigned index
/// in [`THREAD_REGISTRY`] and in the deferred, `Drop`-bearing thread-local.
pub fn ensure_thread_initialized() -> ThreadInitOutcome {
    let index = CORE.with(|core| {
        if core.initializing.get() {
            return None;
        }
        if core.initialized.get() {
            return None;
        }
        core.initializing.set(true);
        Some(NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed))
    });

    match index {
        None if CORE.with(|core| core.initialized.get()) => ThreadInitOutcome::Ready,
        None => ThreadInitOutcome::ShortCircuit,
        Some(index) => {
            finish_initializing(index);
            ThreadInitOutcome::Ready
        }
    }
}

/// Completes initialization for `index`: records it on [`CORE`], registers
/// it in [`THREAD_REGISTRY`], and only then touches [`DEFERRED`] -- by this
/// point `CORE.initializing` is already `true`, so if registering
/// `DEFERRED`'s destructor allocates and re-enters a hook, that reentrant
/// call finds `CORE.initializing` set and short-circuits.
fn finish_initializing(index: u32) {
    CORE.with(|core| core.index.set(index));
    THREAD_INIT_LOCK.lock(|| unsafe {
        (*THREAD_REGISTRY.0.get()).insert(index);
    });
    DEFERRED.with(|deferred| deferred.registered_index.set(Some(index)));
    CORE.with(|core| {
        core.initialized.set(true);
        core.initializing.set(false);
    });
}

/// Draw the next thread index from the same counter
/// [`ensure_thread_initialized`] uses, without assigning it to any thread
/// yet. Used by platform backends that must assign a thread its index
/// before the thread body starts running.
pub fn next_thread_index() -> u32 {
    NEXT_THREAD_INDEX.fetch_add(1, Ordering::Relaxed)
}

/// Prime this thread's guard state with an index assigned ahead of time by
/// the platform's thread-create interposition, instead of drawing a fresh
/// one from [`NEXT_THREAD_INDEX`]. Used on Apple, where the replacement
/// `pthread_create` assigns the new thread's index before the thread body
/// runs at all.
pub fn prime_thread_with_index(index: u32) {
    let should_finish = CORE.with(|core| {
        if core.initialized.get() || core.initializing.get() {
            false
        } else {
            core.initializing.set(true);
            true
        }
    });
    if should_finish {
        finish_initializing(index);
    }
}

/// RAII guard that marks `kind`'s reentry flag true for this thread for the
/// guard's lifetime, clearing it on every exit path (normal or panicking).
pub struct ReentryGuard {
    kind: OperationKind,
}

impl ReentryGuard {
    /// Returns `None` if the guard for `kind` is already held on this
    /// thread -- the base case that prevents the dispatcher from
    /// recursively invoking itself.
    pub fn try_enter(kind: OperationKind) -> Option<ReentryGuard> {
        CORE.with(|core| {
            let cell = &core.reentry[kind.index()];
            if cell.get() {
                None
            } else {
                cell.set(true);
                Some(ReentryGuard { kind })
            }
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        CORE.with(|core| core.reentry[self.kind.index()].set(false));
    }
}

/// Whether `kind` is currently re-entered on this thread, without taking
/// the guard (used by hooks that need to check before deciding to dispatch
/// at all).
pub fn is_reentered(kind: OperationKind) -> bool {
    CORE.with(|core| core.reentry[kind.index()].get())
}

/// Increments `kind`'s forbidden-nesting counter for this thread.
pub fn expect_no_begin(kind: OperationKind) {
    CORE.with(|core| {
        let cell = &core.forbidden_counts[kind.index()];
        cell.set(cell.get() + 1);
    });
}

/// Decrements `kind`'s forbidden-nesting counter for this thread. When the
/// counter returns to zero, clears the set of calling functions already
/// reported for `kind` -- a fresh expectation window starts with a clean
/// dedup slate, the way a later, separate scope in the ground-truth test
/// produces a fresh report for the same call site.
///
/// # Panics
/// Panics if the counter is already zero: an unbalanced `_end` denotes a
/// test-authoring bug, not a runtime condition the library can recover
/// from quietly.
pub fn expect_no_end(kind: OperationKind) {
    let now_zero = CORE.with(|core| {
        let cell = &core.forbidden_counts[kind.index()];
        let current = cell.get();
        if current == 0 {
            panic!(
                "memory-tools: expect_no_{}_end() called without a matching _begin()",
                kind.name()
            );
        }
        cell.set(current - 1);
        current - 1 == 0
    });
    if now_zero {
        DEFERRED.with(|deferred| deferred.reported_callers[kind.index()].borrow_mut().clear());
    }
}

/// True iff an event of `kind` on this thread, right now, is unexpected.
pub fn is_forbidden(kind: OperationKind) -> bool {
    CORE.with(|core| core.forbidden_counts[kind.index()].get() > 0)
}

/// Whether an unexpected event of `kind`, attributed to `calling_function`,
/// should produce a report -- `true` only the first time this calling
/// function is seen for `kind` within the current expectation window.
///
/// This is the reconstruction of the original's
/// `count_function_occurrences_in_backtrace`-based dedup: its header was
/// not present in the retrieved source pack, so this mirrors its
/// *observable* behavior instead of its algorithm -- see `DESIGN.md`. A
/// window that releases the same pointer-adjacent allocation twice from the
/// same call site (e.g. two `free()` calls in one test helper) collapses to
/// a single callback invocation; a distinct calling function, or a later
/// window opened after the previous one fully closed, reports again.
pub fn should_report(kind: OperationKind, calling_function: &str) -> bool {
    DEFERRED.with(|deferred| {
        deferred.reported_callers[kind.index()]
            .borrow_mut()
            .insert(calling_function.to_string())
    })
}
