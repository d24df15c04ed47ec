use crate::walker::Traceback;
use std::any::Any;
use std::error::Error;
use std::fmt::{self, Write as _};
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of a recorded [`Exception`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExceptionId(u64);

impl ExceptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ExceptionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ExceptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An error or panic to be recorded on a span.
///
/// Cloning keeps the [`ExceptionId`], so a clone is the same exception.
#[derive(Clone, Debug)]
pub struct Exception {
    id: ExceptionId,
    type_name: String,
    message: String,
    sources: Vec<String>,
    traceback: Option<Traceback>,
}

impl Exception {
    /// An exception without a traceback.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Exception {
            id: ExceptionId::next(),
            type_name: type_name.into(),
            message: message.into(),
            sources: Vec::new(),
            traceback: None,
        }
    }

    /// Attach the frames the exception was raised through.
    pub fn with_traceback(mut self, traceback: Traceback) -> Self {
        self.traceback = Some(traceback);
        self
    }

    /// Append a message to the cause chain.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Capture `err` together with its cause chain and the current stack.
    ///
    /// The type is the full path of `E`.
    #[inline(never)]
    pub fn capture<E>(err: &E) -> Self
    where
        E: Error,
    {
        Exception {
            sources: source_chain(err),
            ..Exception::new(std::any::type_name::<E>(), err.to_string())
        }
        .with_traceback(Traceback::capture())
    }

    /// Like [`Exception::capture`] for a type-erased error. The type is taken
    /// from the error's `Debug` representation.
    #[inline(never)]
    pub fn capture_dyn(err: &dyn Error) -> Self {
        Exception {
            sources: source_chain(err),
            ..Exception::new(debug_type_name(err), err.to_string())
        }
        .with_traceback(Traceback::capture())
    }

    /// Capture a panic from inside a panic hook.
    #[inline(never)]
    pub fn from_panic(info: &PanicHookInfo<'_>) -> Self {
        Exception::new("panic", payload_message(info.payload()))
            .with_traceback(Traceback::capture())
    }

    /// A panic payload returned by [`std::panic::catch_unwind`]. The stack has
    /// already unwound, so there is no traceback.
    pub fn from_panic_payload(payload: &(dyn Any + Send)) -> Self {
        Exception::new("panic", payload_message(payload))
    }

    /// Identity of this exception.
    pub fn id(&self) -> ExceptionId {
        self.id
    }

    /// Type of the exception.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Message of the exception.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Messages of the cause chain, closest cause first.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Frames the exception was raised through, if known.
    pub fn traceback(&self) -> Option<&Traceback> {
        self.traceback.as_ref()
    }

    /// Human readable rendering of the exception, its stack (innermost frame
    /// first) and its causes.
    pub fn stacktrace(&self) -> String {
        let mut out = format!("{}: {}", self.type_name, self.message);
        if let Some(traceback) = &self.traceback {
            out.push_str("\nStack backtrace:");
            for (index, frame) in traceback.frames().iter().enumerate() {
                let function = frame
                    .function
                    .as_deref()
                    .unwrap_or(crate::frame::UNKNOWN_FUNCTION);
                let _ = write!(out, "\n{index:>4}: {function}");
                if let Some(file) = &frame.file {
                    let _ = write!(out, "\n             at {file}");
                    if let Some(line) = frame.line {
                        let _ = write!(out, ":{line}");
                    }
                }
            }
        }
        if !self.sources.is_empty() {
            out.push_str("\n\nCaused by:");
            for (index, source) in self.sources.iter().enumerate() {
                let _ = write!(out, "\n{index:>4}: {source}");
            }
        }
        out
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

fn source_chain(err: &dyn Error) -> Vec<String> {
    let mut sources = Vec::new();
    let mut next = err.source();
    while let Some(source) = next {
        sources.push(source.to_string());
        next = source.source();
    }
    sources
}

/// Leading identifier of the `Debug` output, e.g. `ParseIntError` for
/// `ParseIntError { kind: InvalidDigit }`.
fn debug_type_name(err: &dyn Error) -> String {
    let debug = format!("{err:?}");
    let name: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() {
        "Error".to_string()
    } else {
        name
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RawFrame;

    #[derive(Debug)]
    struct Outer(std::io::Error);

    impl fmt::Display for Outer {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("could not load config")
        }
    }

    impl Error for Outer {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = Exception::new("A", "a");
        let b = Exception::new("A", "a");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn capture_records_type_and_sources() {
        let err = Outer(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "config.toml missing",
        ));
        let exception = Exception::capture(&err);

        assert!(exception.type_name().ends_with("Outer"));
        assert_eq!(exception.message(), "could not load config");
        assert_eq!(exception.sources(), ["config.toml missing"]);
        assert!(exception.traceback().is_some());
    }

    #[test]
    fn capture_dyn_uses_debug_name() {
        let err = "x".parse::<u32>().unwrap_err();
        let exception = Exception::capture_dyn(&err);
        assert_eq!(exception.type_name(), "ParseIntError");
        assert_eq!(exception.message(), "invalid digit found in string");
    }

    #[test]
    fn panic_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        let exception = Exception::from_panic_payload(payload.as_ref());
        assert_eq!(exception.type_name(), "panic");
        assert_eq!(exception.message(), "boom 7");
        assert!(exception.traceback().is_none());

        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(Exception::from_panic_payload(payload.as_ref()).message(), "static");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(
            Exception::from_panic_payload(payload.as_ref()).message(),
            "Box<dyn Any>"
        );
    }

    #[test]
    fn stacktrace_rendering() {
        let exception = Exception::new("ValueError", "bad input")
            .with_source("root cause")
            .with_traceback(Traceback::from_frames(vec![
                RawFrame::new("src/lib.rs", 42, "app::parse"),
                RawFrame::default(),
            ]));

        assert_eq!(
            exception.stacktrace(),
            "ValueError: bad input\n\
             Stack backtrace:\n\
             \x20  0: app::parse\n\
             \x20            at src/lib.rs:42\n\
             \x20  1: <unknown>\n\
             \n\
             Caused by:\n\
             \x20  0: root cause"
        );
        assert_eq!(exception.to_string(), "ValueError: bad input");
    }
}
