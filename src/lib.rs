//! Allocator interposition for test instrumentation.
//!
//! Replaces the process-wide `malloc`/`realloc`/`calloc`/`free` symbols so
//! that tests can assert an instrumented code path performs no dynamic
//! memory operations over a bounded scope, or observe and report the ones
//! it does perform. See the crate's design notes for the platform-specific
//! interposition strategy and the concurrency model the hooks run under.
//!
//! This is not a production allocator: it performs no leak detection, no
//! size tracking, and does not match allocations against their eventual
//! release. It exists to make allocation behavior assertable from tests.

mod bootstrap;
mod dispatch;
mod error;
mod guards;
mod operation;
mod platform;
mod service;
mod spinlock;
mod stacktrace;
mod verbosity;

pub use error::MemoryToolsError;
pub use operation::OperationKind;
pub use service::MemoryToolsService;
pub use stacktrace::{CapturedStack, ResolvedFrame, SourceLocation};

use service::MONITORING;

/// Prepare this crate for use. Idempotent and safe to call any number of
/// times, including zero: the platform backend's original-allocator
/// resolution already ran at library load, before this function or any
/// other user code had a chance to run, so this call is a query over
/// whether that resolution succeeded rather than the resolution itself.
///
/// Returns [`MemoryToolsError::PlatformUnsupported`] on a platform with no
/// interposition backend (currently Windows, and any non-Apple, non-ELF
/// target). The public API remains callable on such a platform; monitoring
/// is simply never triggered, because no allocator symbol is ever
/// intercepted.
pub fn initialize() -> Result<(), MemoryToolsError> {
    if platform::is_supported() {
        Ok(())
    } else {
        Err(MemoryToolsError::PlatformUnsupported)
    }
}

/// Disable monitoring and clear every registered callback. Safe to call
/// whether or not [`initialize`] ever succeeded.
pub fn uninitialize() {
    disable_monitoring();
    for kind in OperationKind::ALL {
        MONITORING.clear_callback(kind);
    }
}

/// Turn monitoring on: from this point, every intercepted allocator call
/// runs through the Event Dispatcher. Has no effect on a platform with no
/// interposition backend.
pub fn enable_monitoring() {
    MONITORING.enable();
}

/// Turn monitoring off. Intercepted allocator calls are forwarded to the
/// original allocator without being dispatched.
pub fn disable_monitoring() {
    MONITORING.disable();
}

/// Register `callback` to run whenever a `malloc` call happens while a
/// `expect_no_malloc_begin()` scope is open on the calling thread. Replaces
/// any previously registered callback for this kind; the caller is
/// responsible for not replacing a callback while another thread may be
/// invoking it.
pub fn on_unexpected_malloc<F>(callback: F)
where
    F: Fn(&mut MemoryToolsService) + Send + Sync + 'static,
{
    MONITORING.set_callback(OperationKind::Malloc, callback);
}

/// See [`on_unexpected_malloc`].
pub fn on_unexpected_realloc<F>(callback: F)
where
    F: Fn(&mut MemoryToolsService) + Send + Sync + 'static,
{
    MONITORING.set_callback(OperationKind::Realloc, callback);
}

/// See [`on_unexpected_malloc`].
pub fn on_unexpected_calloc<F>(callback: F)
where
    F: Fn(&mut MemoryToolsService) + Send + Sync + 'static,
{
    MONITORING.set_callback(OperationKind::Calloc, callback);
}

/// See [`on_unexpected_malloc`].
pub fn on_unexpected_free<F>(callback: F)
where
    F: Fn(&mut MemoryToolsService) + Send + Sync + 'static,
{
    MONITORING.set_callback(OperationKind::Free, callback);
}

/// Clear the callback registered with [`on_unexpected_malloc`], if any.
pub fn clear_unexpected_malloc() {
    MONITORING.clear_callback(OperationKind::Malloc);
}

/// Clear the callback registered with [`on_unexpected_realloc`], if any.
pub fn clear_unexpected_realloc() {
    MONITORING.clear_callback(OperationKind::Realloc);
}

/// Clear the callback registered with [`on_unexpected_calloc`], if any.
pub fn clear_unexpected_calloc() {
    MONITORING.clear_callback(OperationKind::Calloc);
}

/// Clear the callback registered with [`on_unexpected_free`], if any.
pub fn clear_unexpected_free() {
    MONITORING.clear_callback(OperationKind::Free);
}

/// Open a scope, on the calling thread, in which a `malloc` call is
/// unexpected. Nests: a thread may call this any number of times, and must
/// balance each with [`expect_no_malloc_end`].
pub fn expect_no_malloc_begin() {
    guards::expect_no_begin(OperationKind::Malloc);
}

/// Close the innermost scope opened by [`expect_no_malloc_begin`] on the
/// calling thread.
///
/// # Panics
/// Panics if no such scope is open on this thread.
pub fn expect_no_malloc_end() {
    guards::expect_no_end(OperationKind::Malloc);
}

/// See [`expect_no_malloc_begin`].
pub fn expect_no_realloc_begin() {
    guards::expect_no_begin(OperationKind::Realloc);
}

/// See [`expect_no_malloc_end`].
///
/// # Panics
/// Panics if no matching scope is open on this thread.
pub fn expect_no_realloc_end() {
    guards::expect_no_end(OperationKind::Realloc);
}

/// See [`expect_no_malloc_begin`].
pub fn expect_no_calloc_begin() {
    guards::expect_no_begin(OperationKind::Calloc);
}

/// See [`expect_no_malloc_end`].
///
/// # Panics
/// Panics if no matching scope is open on this thread.
pub fn expect_no_calloc_end() {
    guards::expect_no_end(OperationKind::Calloc);
}

/// See [`expect_no_malloc_begin`].
pub fn expect_no_free_begin() {
    guards::expect_no_begin(OperationKind::Free);
}

/// See [`expect_no_malloc_end`].
///
/// # Panics
/// Panics if no matching scope is open on this thread.
pub fn expect_no_free_end() {
    guards::expect_no_end(OperationKind::Free);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn initialize_reports_platform_support() {
        let result = initialize();
        if platform::is_supported() {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(MemoryToolsError::PlatformUnsupported)));
        }
    }

    #[test]
    #[serial]
    fn uninitialize_disables_monitoring_and_clears_callbacks() {
        enable_monitoring();
        on_unexpected_malloc(|_| {});
        uninitialize();
        assert!(!MONITORING.is_enabled());
        disable_monitoring();
    }

    #[test]
    fn expectation_scopes_balance() {
        expect_no_realloc_begin();
        expect_no_realloc_begin();
        expect_no_realloc_end();
        expect_no_realloc_end();
    }

    #[test]
    #[should_panic(expected = "without a matching _begin")]
    fn unbalanced_expectation_scope_panics() {
        expect_no_calloc_end();
    }
}
