//! The event dispatcher: turns a raw allocator event into a monitoring
//! decision, invokes the user callback, optionally captures a backtrace,
//! then forwards to the original allocator.

use crate::operation::OperationKind;
use crate::service::{MemoryToolsService, MONITORING};
use crate::stacktrace::{self, CapturedStack};

/// Run `original` through the monitoring pipeline for `kind`.
///
/// A `MemoryToolsService` is constructed, and a backtrace is ever captured,
/// only for events that are currently unexpected (`is_forbidden`); permitted
/// events always pass straight through to `original` regardless of
/// verbosity, matching the original, which only reaches its reporting path
/// for unexpected operations.
///
/// Steps 3-5 of the dispatch algorithm run strictly sequentially on the
/// calling thread with no user code in between the report and the call to
/// `original`: a callback sees the allocator call that is about to happen,
/// not one that already happened.
pub fn dispatch<R>(kind: OperationKind, original: impl FnOnce() -> R) -> R {
    if !MONITORING.is_enabled() || !crate::guards::is_forbidden(kind) {
        return original();
    }

    let stack: CapturedStack = CapturedStack::capture();
    let calling_function = stack
        .frames()
        .first()
        .map(|frame| frame.object_function())
        .unwrap_or("");

    if crate::guards::should_report(kind, calling_function) {
        let mut service = MemoryToolsService::from_verbosity(MONITORING.current_verbosity());
        MONITORING.invoke_callback(kind, &mut service);

        if !service.should_ignore() {
            eprintln!("memory-tools: unexpected {} ({})", kind.name(), calling_function);
        }

        if service.should_print_backtrace() {
            stacktrace::print_backtrace(&stack);
        }
    }

    original()
}
