//! Stack-trace capture facade: opaque, immutable value objects wrapping the
//! `backtrace` crate, used by the dispatcher when a callback asks for a
//! trace.

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// A single point in a resolved call stack.
#[derive(Debug, Clone)]
pub struct SourceLocation {
    function: String,
    filename: String,
    line: u32,
    column: u32,
}

impl SourceLocation {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }
}

/// One resolved physical frame, plus whatever logical frames were inlined
/// into it.
#[derive(Debug, Clone)]
pub struct ResolvedFrame {
    address: usize,
    index_in_stack: usize,
    object_filename: String,
    object_function: String,
    primary_source_location: Option<SourceLocation>,
    inlined_source_locations: Vec<SourceLocation>,
}

impl ResolvedFrame {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn index_in_stack(&self) -> usize {
        self.index_in_stack
    }

    pub fn object_filename(&self) -> &str {
        &self.object_filename
    }

    pub fn object_function(&self) -> &str {
        &self.object_function
    }

    pub fn primary_source_location(&self) -> Option<&SourceLocation> {
        self.primary_source_location.as_ref()
    }

    pub fn inlined_source_locations(&self) -> &[SourceLocation] {
        &self.inlined_source_locations
    }
}

/// An immutable snapshot of one thread's call stack at a point in time.
///
/// Exclusively owned by the event that produced it; there is no global
/// registry of captured stacks.
#[derive(Debug, Clone)]
pub struct CapturedStack {
    thread_id: std::thread::ThreadId,
    frames: Vec<ResolvedFrame>,
}

/// Caches resolved frame data keyed by instruction-pointer address, since
/// test loops commonly re-capture the same call site many times over.
static FRAME_CACHE: Lazy<DashMap<usize, ResolvedFrame>> = Lazy::new(DashMap::new);

fn resolve_frame(frame: &backtrace::BacktraceFrame, index: usize) -> ResolvedFrame {
    let address = frame.ip() as usize;
    if let Some(cached) = FRAME_CACHE.get(&address) {
        let mut resolved = cached.clone();
        resolved.index_in_stack = index;
        return resolved;
    }

    let symbols = frame.symbols();
    let mut locations: Vec<SourceLocation> = symbols
        .iter()
        .map(|symbol| SourceLocation {
            function: symbol
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            filename: symbol
                .filename()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            line: symbol.lineno().unwrap_or(0),
            column: symbol.colno().unwrap_or(0),
        })
        .collect();

    let primary = if locations.is_empty() {
        None
    } else {
        Some(locations.remove(0))
    };

    let resolved = ResolvedFrame {
        address,
        index_in_stack: index,
        object_filename: String::new(),
        object_function: primary
            .as_ref()
            .map(|s| s.function.clone())
            .unwrap_or_default(),
        primary_source_location: primary,
        inlined_source_locations: locations,
    };

    FRAME_CACHE.insert(address, resolved.clone());
    resolved
}

/// Function-name prefix used to trim this library's own frames from the
/// top of a captured stack.
const LIBRARY_FRAME_PREFIX: &str = "memory_tools::";

impl CapturedStack {
    /// Capture the current thread's stack, excluding the topmost frames
    /// that belong to this library itself.
    pub fn capture() -> CapturedStack {
        let raw = backtrace::Backtrace::new();
        let mut frames: Vec<ResolvedFrame> = raw
            .frames()
            .iter()
            .enumerate()
            .map(|(idx, frame)| resolve_frame(frame, idx))
            .collect();

        if let Some(first_foreign) = frames
            .iter()
            .position(|f| !f.object_function.starts_with(LIBRARY_FRAME_PREFIX))
        {
            frames.drain(..first_foreign);
            for (idx, frame) in frames.iter_mut().enumerate() {
                frame.index_in_stack = idx;
            }
        }

        CapturedStack {
            thread_id: std::thread::current().id(),
            frames,
        }
    }

    pub fn thread_id(&self) -> std::thread::ThreadId {
        self.thread_id
    }

    pub fn frames(&self) -> &[ResolvedFrame] {
        &self.frames
    }

    /// The sub-sequence of frames starting at the first frame whose
    /// function name has the given prefix, used to trim unrelated leading
    /// frames from a reported trace.
    pub fn frames_from_function_name(&self, prefix: &str) -> &[ResolvedFrame] {
        match self
            .frames
            .iter()
            .position(|f| f.object_function.starts_with(prefix))
        {
            Some(start) => &self.frames[start..],
            None => &[],
        }
    }
}

/// Render `stack` to stderr the way a developer reading test output would
/// expect. Demangling comes for free from `backtrace`'s `Symbol::name`.
pub fn print_backtrace(stack: &CapturedStack) {
    eprintln!("memory-tools: stack trace (thread {:?}):", stack.thread_id());
    for frame in stack.frames() {
        match frame.primary_source_location() {
            Some(loc) if !loc.filename().is_empty() => {
                eprintln!(
                    "  #{} {:#x} {} at {}:{}:{}",
                    frame.index_in_stack(),
                    frame.address(),
                    loc.function(),
                    loc.filename(),
                    loc.line(),
                    loc.column(),
                );
            }
            Some(loc) => {
                eprintln!(
                    "  #{} {:#x} {}",
                    frame.index_in_stack(),
                    frame.address(),
                    loc.function(),
                );
            }
            None => {
                eprintln!("  #{} {:#x} <unresolved>", frame.index_in_stack(), frame.address());
            }
        }
        for inlined in frame.inlined_source_locations() {
            eprintln!("      inlined: {}", inlined.function());
        }
    }
}
