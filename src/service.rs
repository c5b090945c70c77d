//! The per-event `MemoryToolsService` value and the process-wide
//! `MonitoringState` singleton that holds callbacks and the master switch.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::operation::OperationKind;
use crate::verbosity::{self, Verbosity};

/// A short-lived record, constructed fresh for each observed event,
/// describing how that one event should be reported.
///
/// A user callback receives `&mut MemoryToolsService` and may call
/// [`MemoryToolsService::ignore`], [`MemoryToolsService::unignore`], or
/// [`MemoryToolsService::print_backtrace`] to steer reporting for this
/// event only; mutations never persist across events.
pub struct MemoryToolsService {
    ignored: bool,
    should_print_backtrace: bool,
}

impl MemoryToolsService {
    pub(crate) fn from_verbosity(verbosity: Verbosity) -> Self {
        let (ignored, should_print_backtrace) = verbosity.defaults();
        MemoryToolsService {
            ignored,
            should_print_backtrace,
        }
    }

    /// Suppress the report for this event.
    pub fn ignore(&mut self) {
        self.ignored = true;
    }

    /// Un-suppress the report for this event.
    pub fn unignore(&mut self) {
        self.ignored = false;
    }

    /// Request that a backtrace be captured and printed for this event,
    /// regardless of whether it is otherwise ignored -- `ignored`
    /// suppresses only the plain report, never an explicitly requested
    /// trace.
    pub fn print_backtrace(&mut self) {
        self.should_print_backtrace = true;
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    pub fn should_print_backtrace(&self) -> bool {
        self.should_print_backtrace
    }

    /// Whether the dispatcher should suppress the default, non-backtrace
    /// report for this event: true when `ignored` is set and no explicit
    /// backtrace was requested. An explicit [`print_backtrace`] request
    /// always wins over `ignored`, matching the original's
    /// `MemoryToolsServiceFactory::should_ignore()`.
    ///
    /// [`print_backtrace`]: MemoryToolsService::print_backtrace
    pub(crate) fn should_ignore(&self) -> bool {
        !self.should_print_backtrace && self.ignored
    }
}

type Callback = Box<dyn Fn(&mut MemoryToolsService) + Send + Sync + 'static>;

/// Process-wide mutable state describing whether monitoring is enabled and
/// which callback fires for each [`OperationKind`].
pub struct MonitoringState {
    enabled: AtomicBool,
    callbacks: [AtomicPtr<Callback>; 4],
}

impl MonitoringState {
    const fn new() -> Self {
        MonitoringState {
            enabled: AtomicBool::new(false),
            callbacks: [
                AtomicPtr::new(std::ptr::null_mut()),
                AtomicPtr::new(std::ptr::null_mut()),
                AtomicPtr::new(std::ptr::null_mut()),
                AtomicPtr::new(std::ptr::null_mut()),
            ],
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Replace the callback for `kind`. Per the concurrency contract,
    /// callbacks are expected to be set during test setup, not while
    /// another thread may be invoking the previous one; the old callback
    /// is reclaimed immediately under that contract.
    pub fn set_callback<F>(&self, kind: OperationKind, callback: F)
    where
        F: Fn(&mut MemoryToolsService) + Send + Sync + 'static,
    {
        let boxed: Callback = Box::new(callback);
        let raw = Box::into_raw(Box::new(boxed));
        let old = self.callbacks[kind.index()].swap(raw, Ordering::AcqRel);
        if !old.is_null() {
            // SAFETY: every non-null pointer ever stored here was produced
            // by `Box::into_raw(Box::new(..))` above and is never read
            // again once swapped out.
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    /// Clear the callback for `kind`, if any.
    pub fn clear_callback(&self, kind: OperationKind) {
        let old = self.callbacks[kind.index()].swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            unsafe { drop(Box::from_raw(old)) };
        }
    }

    /// Invoke the callback registered for `kind`, if any, with `service`.
    pub fn invoke_callback(&self, kind: OperationKind, service: &mut MemoryToolsService) {
        let raw = self.callbacks[kind.index()].load(Ordering::Acquire);
        if raw.is_null() {
            return;
        }
        // SAFETY: `raw` was produced by `Box::into_raw(Box::new(..))` and
        // is kept alive at least until the next `swap` above; the caller's
        // own reentry guard prevents this same slot from being replaced
        // from inside the callback it's currently running.
        let callback: &Callback = unsafe { &*raw };
        callback(service);
    }

    pub fn current_verbosity(&self) -> Verbosity {
        verbosity::current()
    }
}

impl Drop for MonitoringState {
    fn drop(&mut self) {
        for kind in OperationKind::ALL {
            self.clear_callback(kind);
        }
    }
}

/// The single process-wide [`MonitoringState`], created at first use.
pub static MONITORING: MonitoringState = MonitoringState::new();

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn disabled_by_default() {
        let state = MonitoringState::new();
        assert!(!state.is_enabled());
    }

    #[test]
    fn callback_replace_and_invoke() {
        let state = MonitoringState::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        state.set_callback(OperationKind::Malloc, move |_svc| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        let mut svc = MemoryToolsService::from_verbosity(Verbosity::Debug);
        state.invoke_callback(OperationKind::Malloc, &mut svc);
        state.invoke_callback(OperationKind::Malloc, &mut svc);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        state.clear_callback(OperationKind::Malloc);
        state.invoke_callback(OperationKind::Malloc, &mut svc);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn quiet_service_is_ignored_by_default() {
        let svc = MemoryToolsService::from_verbosity(Verbosity::Quiet);
        assert!(svc.is_ignored());
        assert!(!svc.should_print_backtrace());
    }

    #[test]
    fn trace_service_prints_backtrace_by_default() {
        let svc = MemoryToolsService::from_verbosity(Verbosity::Trace);
        assert!(!svc.is_ignored());
        assert!(svc.should_print_backtrace());
    }

    #[test]
    fn should_ignore_respects_explicit_backtrace_request() {
        let mut svc = MemoryToolsService::from_verbosity(Verbosity::Quiet);
        assert!(svc.should_ignore());
        svc.print_backtrace();
        assert!(!svc.should_ignore(), "an explicit trace request overrides ignored");
    }

    #[test]
    fn callback_can_mutate_service() {
        let state = MonitoringState::new();
        state.set_callback(OperationKind::Free, |svc| svc.print_backtrace());
        let mut svc = MemoryToolsService::from_verbosity(Verbosity::Quiet);
        state.invoke_callback(OperationKind::Free, &mut svc);
        assert!(svc.should_print_backtrace());
    }
}
