//! End-to-end scenarios against the real exported `malloc`/`realloc`/
//! `calloc`/`free` symbols, driven through `libc` so that these calls go
//! through the same interposition the crate installs for any other
//! caller in the process.
//!
//! Every test is `#[serial]`: `MemoryToolsService`'s monitoring state and
//! the per-kind callbacks are process-wide.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serial_test::serial;

struct Counters {
    malloc: AtomicU32,
    realloc: AtomicU32,
    calloc: AtomicU32,
    free: AtomicU32,
}

impl Counters {
    fn new() -> Arc<Counters> {
        Arc::new(Counters {
            malloc: AtomicU32::new(0),
            realloc: AtomicU32::new(0),
            calloc: AtomicU32::new(0),
            free: AtomicU32::new(0),
        })
    }
}

fn install(counters: &Arc<Counters>) {
    let c = Arc::clone(counters);
    memory_tools::on_unexpected_malloc(move |_| {
        c.malloc.fetch_add(1, Ordering::SeqCst);
    });
    let c = Arc::clone(counters);
    memory_tools::on_unexpected_realloc(move |_| {
        c.realloc.fetch_add(1, Ordering::SeqCst);
    });
    let c = Arc::clone(counters);
    memory_tools::on_unexpected_calloc(move |_| {
        c.calloc.fetch_add(1, Ordering::SeqCst);
    });
    let c = Arc::clone(counters);
    memory_tools::on_unexpected_free(move |_| {
        c.free.fetch_add(1, Ordering::SeqCst);
    });
}

fn uninstall() {
    memory_tools::clear_unexpected_malloc();
    memory_tools::clear_unexpected_realloc();
    memory_tools::clear_unexpected_calloc();
    memory_tools::clear_unexpected_free();
    memory_tools::disable_monitoring();
}

/// allocate(1024), reallocate to 2048, release, zero-allocate(1024 *
/// sizeof-pointer), release.
unsafe fn run_sequence() {
    let p = libc::malloc(1024);
    let p = libc::realloc(p, 2048);
    libc::free(p);
    let q = libc::calloc(1024, std::mem::size_of::<*mut c_void>());
    libc::free(q);
}

#[test]
#[serial]
fn no_monitoring_counters_stay_zero() {
    let _ = memory_tools::initialize();
    memory_tools::disable_monitoring();
    let counters = Counters::new();
    install(&counters);

    unsafe { run_sequence() };

    assert_eq!(counters.malloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.realloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.calloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.free.load(Ordering::SeqCst), 0);
    uninstall();
}

#[test]
#[serial]
fn monitoring_on_but_no_scope_open_counters_stay_zero() {
    let _ = memory_tools::initialize();
    memory_tools::enable_monitoring();
    let counters = Counters::new();
    install(&counters);

    unsafe { run_sequence() };

    assert_eq!(counters.malloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.realloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.calloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.free.load(Ordering::SeqCst), 0);
    uninstall();
}

#[test]
#[serial]
fn all_four_scopes_open_simultaneously() {
    let _ = memory_tools::initialize();
    memory_tools::enable_monitoring();
    let counters = Counters::new();
    install(&counters);

    memory_tools::expect_no_malloc_begin();
    memory_tools::expect_no_realloc_begin();
    memory_tools::expect_no_calloc_begin();
    memory_tools::expect_no_free_begin();

    unsafe { run_sequence() };

    memory_tools::expect_no_free_end();
    memory_tools::expect_no_calloc_end();
    memory_tools::expect_no_realloc_end();
    memory_tools::expect_no_malloc_end();

    assert_eq!(counters.malloc.load(Ordering::SeqCst), 1);
    assert_eq!(counters.realloc.load(Ordering::SeqCst), 1);
    assert_eq!(counters.calloc.load(Ordering::SeqCst), 1);
    // Two release calls happen inside the run, both attributed to the same
    // calling function (`run_sequence`), so they collapse to one callback
    // invocation -- not two -- the same way the ground-truth sequence this
    // scenario is drawn from reports exactly one unexpected free per run.
    assert_eq!(counters.free.load(Ordering::SeqCst), 1);
    uninstall();
}

#[test]
#[serial]
fn malloc_only_scope() {
    let _ = memory_tools::initialize();
    memory_tools::enable_monitoring();
    let counters = Counters::new();
    install(&counters);

    memory_tools::expect_no_malloc_begin();
    unsafe { run_sequence() };
    memory_tools::expect_no_malloc_end();

    assert_eq!(counters.malloc.load(Ordering::SeqCst), 1);
    assert_eq!(counters.realloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.calloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.free.load(Ordering::SeqCst), 0);
    uninstall();
}

#[test]
#[serial]
fn realloc_only_scope() {
    let _ = memory_tools::initialize();
    memory_tools::enable_monitoring();
    let counters = Counters::new();
    install(&counters);

    memory_tools::expect_no_realloc_begin();
    unsafe { run_sequence() };
    memory_tools::expect_no_realloc_end();

    assert_eq!(counters.realloc.load(Ordering::SeqCst), 1);
    assert_eq!(counters.malloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.calloc.load(Ordering::SeqCst), 0);
    assert_eq!(counters.free.load(Ordering::SeqCst), 0);
    uninstall();
}

#[test]
#[serial]
fn calloc_only_then_free_only_scopes_successively() {
    let _ = memory_tools::initialize();
    memory_tools::enable_monitoring();
    let counters = Counters::new();
    install(&counters);

    memory_tools::expect_no_calloc_begin();
    unsafe { run_sequence() };
    memory_tools::expect_no_calloc_end();
    assert_eq!(counters.calloc.load(Ordering::SeqCst), 1);
    assert_eq!(counters.free.load(Ordering::SeqCst), 0);

    memory_tools::expect_no_free_begin();
    unsafe { run_sequence() };
    memory_tools::expect_no_free_end();

    // Two release calls execute inside this open free scope, both from
    // `run_sequence`, so they collapse to a single callback invocation: +1
    // on top of the zero contributed by the calloc-only scope above.
    assert_eq!(counters.free.load(Ordering::SeqCst), 1);
    assert_eq!(counters.calloc.load(Ordering::SeqCst), 1);
    uninstall();
}

#[test]
#[serial]
fn nested_scope_collapses_to_one_callback_invocation() {
    let _ = memory_tools::initialize();
    memory_tools::enable_monitoring();
    let counters = Counters::new();
    install(&counters);

    memory_tools::expect_no_malloc_begin();
    memory_tools::expect_no_malloc_begin();
    let p = unsafe { libc::malloc(64) };
    memory_tools::expect_no_malloc_end();
    assert_eq!(
        counters.malloc.load(Ordering::SeqCst),
        1,
        "still nested after only one end"
    );
    memory_tools::expect_no_malloc_end();

    assert_eq!(counters.malloc.load(Ordering::SeqCst), 1);
    unsafe { libc::free(p) };
    uninstall();
}

#[test]
#[serial]
fn disabled_monitoring_ignores_open_scopes() {
    let _ = memory_tools::initialize();
    memory_tools::disable_monitoring();
    let counters = Counters::new();
    install(&counters);

    memory_tools::expect_no_malloc_begin();
    unsafe { run_sequence() };
    memory_tools::expect_no_malloc_end();

    assert_eq!(counters.malloc.load(Ordering::SeqCst), 0);
    uninstall();
}
