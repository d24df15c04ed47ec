//! # Stack Walking
//!
//! A [`Traceback`] is the list of raw frames an exception was raised through,
//! innermost first. [`StackWalker`] resolves every frame through the
//! [`FrameExtractor`], reorders them outermost caller first and fingerprints
//! the result with a [`StackSignature`].
use crate::cache::StackCache;
use crate::frame::{FrameExtractor, RawFrame, StackFrame};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Number of frames kept when capturing the live stack.
pub(crate) const DEFAULT_LIVE_STACK_DEPTH: usize = 5;

/// Leading frames that belong to the capture machinery rather than to the
/// code that raised the exception.
const CAPTURE_MACHINERY: &[&str] = &[
    "backtrace::",
    "<backtrace::",
    "opentelemetry_exception::walker::",
    "<opentelemetry_exception::walker::",
    "opentelemetry_exception::exception::",
    "opentelemetry_exception::enricher::",
    "opentelemetry_exception::span::",
    "<opentelemetry_exception::span::",
    "<opentelemetry_exception::processor::",
    "<opentelemetry_exception::profile::",
    "<opentelemetry_exception::surround::",
    "opentelemetry_middleware::install::",
    "<opentelemetry_middleware::install::",
    "opentelemetry_sdk::",
    "<opentelemetry_sdk::",
    "opentelemetry::",
    "<opentelemetry::",
    "std::panicking::",
    "std::panic::",
    "std::sys::backtrace::",
    "std::sys_common::backtrace::",
    "core::panicking::",
    "core::result::unwrap_failed",
    "core::option::unwrap_failed",
    "core::option::expect_failed",
    "core::ops::function::",
    "<alloc::boxed::Box",
    "rust_begin_unwind",
    "__rustc::",
];

/// Frames below this one belong to the runtime's startup code.
const SHORT_BACKTRACE_MARKER: &str = "__rust_begin_short_backtrace";

/// Raw frames an exception was raised through, innermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Traceback {
    frames: Vec<RawFrame>,
}

impl Traceback {
    /// Use frames supplied by the host, innermost first.
    pub fn from_frames(frames: Vec<RawFrame>) -> Self {
        Traceback { frames }
    }

    /// Capture the current thread's stack.
    ///
    /// Leading frames belonging to the capture machinery (this crate's entry
    /// points, the telemetry SDK and the panic runtime) are dropped, as are the
    /// runtime startup frames below the program's entry point. Inlined calls
    /// appear as frames of their own.
    #[inline(never)]
    pub fn capture() -> Self {
        let mut frames = Vec::new();
        let mut leading = true;
        let mut reached_entry = false;

        backtrace::trace(|frame| {
            backtrace::resolve_frame(frame, |symbol| {
                if reached_entry {
                    return;
                }
                let function = symbol.name().map(|name| format!("{name:#}"));
                if let Some(name) = function.as_deref() {
                    if name.contains(SHORT_BACKTRACE_MARKER) {
                        reached_entry = true;
                        return;
                    }
                    if leading && is_capture_machinery(name) {
                        return;
                    }
                }
                leading = false;
                frames.push(RawFrame {
                    file: symbol
                        .filename()
                        .map(|path| path.to_string_lossy().into_owned()),
                    line: symbol.lineno(),
                    function,
                    function_span: None,
                });
            });
            !reached_entry
        });

        Traceback { frames }
    }

    /// Frames, innermost first.
    pub fn frames(&self) -> &[RawFrame] {
        &self.frames
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` if no frame was captured.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn is_capture_machinery(function: &str) -> bool {
    CAPTURE_MACHINERY
        .iter()
        .any(|prefix| function.starts_with(prefix))
}

/// Fingerprint of an ordered list of frames.
///
/// The first 16 bytes of a SHA-256 digest over each frame's file, function
/// and line, in emitted order. Equal inputs give equal signatures in any
/// process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StackSignature([u8; 16]);

impl StackSignature {
    /// Signature used when no stack is available.
    pub const EMPTY: StackSignature = StackSignature([0; 16]);

    /// Fingerprint `frames` in the given order.
    pub fn from_frames<'a, I>(frames: I) -> Self
    where
        I: IntoIterator<Item = &'a StackFrame>,
    {
        let mut hasher = Sha256::new();
        let mut any = false;
        for frame in frames {
            any = true;
            hasher.update(frame.file_path().as_bytes());
            hasher.update([0]);
            hasher.update(frame.function_name().as_bytes());
            hasher.update([0]);
            hasher.update(frame.line_number().to_be_bytes());
            hasher.update([0x1e]);
        }
        if !any {
            return StackSignature::EMPTY;
        }

        let digest = hasher.finalize();
        let mut bytes = [0; 16];
        bytes.copy_from_slice(&digest[..16]);
        StackSignature(bytes)
    }

    /// Construct a signature from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        StackSignature(bytes)
    }

    /// Raw bytes.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }

    /// Returns `true` for [`StackSignature::EMPTY`].
    pub fn is_empty(&self) -> bool {
        *self == StackSignature::EMPTY
    }
}

impl fmt::Display for StackSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&const_hex::encode(self.0))
    }
}

impl fmt::Debug for StackSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackSignature({self})")
    }
}

/// Result of walking a stack: frames outermost caller first and their
/// signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkedStack {
    /// Fingerprint of `frames`.
    pub signature: StackSignature,
    /// Resolved frames, outermost caller first.
    pub frames: Vec<Arc<StackFrame>>,
}

impl WalkedStack {
    /// A walk over no frames.
    pub fn empty() -> Self {
        WalkedStack {
            signature: StackSignature::EMPTY,
            frames: Vec::new(),
        }
    }
}

/// Resolves tracebacks into ordered, fingerprinted frame lists.
#[derive(Clone, Debug, Default)]
pub struct StackWalker {
    extractor: FrameExtractor,
    max_depth: Option<usize>,
}

impl StackWalker {
    /// A walker that keeps every frame.
    pub fn new(extractor: FrameExtractor) -> Self {
        StackWalker {
            extractor,
            max_depth: None,
        }
    }

    /// A walker for live stacks, keeping the innermost few frames.
    pub fn live(extractor: FrameExtractor) -> Self {
        StackWalker::new(extractor).with_max_depth(Some(DEFAULT_LIVE_STACK_DEPTH))
    }

    /// Keep at most `max_depth` of the innermost frames, or all of them.
    pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Configured depth limit.
    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    /// The extractor used to resolve frames.
    pub fn extractor(&self) -> &FrameExtractor {
        &self.extractor
    }

    /// Resolve `traceback`. An absent or empty traceback gives
    /// [`WalkedStack::empty`].
    pub fn walk(&self, traceback: Option<&Traceback>, cache: &StackCache) -> WalkedStack {
        let Some(traceback) = traceback.filter(|tb| !tb.is_empty()) else {
            return WalkedStack::empty();
        };

        let depth = self.max_depth.unwrap_or(usize::MAX);
        let mut frames: Vec<Arc<StackFrame>> = traceback
            .frames()
            .iter()
            .take(depth)
            .map(|raw| self.extractor.extract(raw, cache))
            .collect();
        frames.reverse();

        WalkedStack {
            signature: StackSignature::from_frames(frames.iter().map(Arc::as_ref)),
            frames,
        }
    }

    /// Capture and resolve the calling thread's stack.
    #[inline(never)]
    pub fn walk_current(&self, cache: &StackCache) -> WalkedStack {
        let traceback = Traceback::capture();
        self.walk(Some(&traceback), cache)
    }
}
