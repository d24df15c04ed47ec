//! # Exception Enricher
//!
//! Builds the `"exception"` span event for an [`Exception`]:
//!
//! 1. Without a traceback only the type, message, stacktrace and escaped
//!    attributes are set.
//! 2. Otherwise the traceback is walked and every frame resolved.
//! 3. `exception.escaped` is set if the exception is the one currently
//!    propagating on this thread.
//! 4. The frames are serialized into one JSON attribute next to the scalar
//!    attributes and version control details.
//!
//! Any fault along the way degrades the event to the attributes of step 1.
use crate::ambient::{AmbientException, ThreadLocalAmbient};
use crate::cache::StackCache;
use crate::config::ExceptionConfig;
use crate::error::EnrichmentError;
use crate::exception::Exception;
use crate::frame::{FrameExtractor, StackFrame};
use crate::semconv;
use crate::walker::{StackSignature, StackWalker, Traceback};
use opentelemetry::trace::{Span, Status, TraceContextExt, Tracer};
use opentelemetry::{global, otel_debug, otel_warn, Context, KeyValue};
use serde::Serialize;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

/// Name of the global tracer used for spans created to hold an exception
/// recorded outside of any span.
pub(crate) const FALLBACK_TRACER_NAME: &str = "mw-tracer";

thread_local! {
    static ENRICHING: Cell<bool> = const { Cell::new(false) };
}

struct EnrichingGuard {
    previous: bool,
}

impl EnrichingGuard {
    fn enter() -> Self {
        EnrichingGuard {
            previous: ENRICHING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for EnrichingGuard {
    fn drop(&mut self) {
        ENRICHING.with(|flag| flag.set(self.previous));
    }
}

/// Version control details attached to exception events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VcsInfo {
    /// Commit the running binary was built from.
    pub commit_sha: Option<String>,
    /// Repository the running binary was built from.
    pub repository_url: Option<String>,
}

/// An exception with its stack resolved, ready to be attached to a span.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedException {
    /// Type of the exception.
    pub exception_type: String,
    /// Message of the exception.
    pub message: String,
    /// Human readable stack trace.
    pub raw_stacktrace: String,
    /// Resolved frames, outermost caller first.
    pub frames: Vec<Arc<StackFrame>>,
    /// Fingerprint of `frames`.
    pub stack_signature: StackSignature,
    /// Whether the exception was propagating when it was recorded.
    pub escaped: bool,
    /// Commit the running binary was built from.
    pub vcs_commit_sha: Option<String>,
    /// Repository the running binary was built from.
    pub vcs_repository_url: Option<String>,
}

#[derive(Serialize)]
struct FrameDetails<'a> {
    #[serde(rename = "exception.file")]
    file: &'a str,
    #[serde(rename = "exception.line")]
    line: u32,
    #[serde(rename = "exception.function_name")]
    function_name: &'a str,
    #[serde(rename = "exception.function_body")]
    function_body: String,
    #[serde(rename = "exception.start_line")]
    start_line: Option<u32>,
    #[serde(rename = "exception.end_line")]
    end_line: Option<u32>,
    #[serde(rename = "exception.is_file_external")]
    is_file_external: bool,
}

impl<'a> From<&'a StackFrame> for FrameDetails<'a> {
    fn from(frame: &'a StackFrame) -> Self {
        FrameDetails {
            file: frame.file_path(),
            line: frame.line_number(),
            function_name: frame.function_name(),
            function_body: frame.function_body(),
            start_line: frame.start_line(),
            end_line: frame.end_line(),
            is_file_external: frame.is_external(),
        }
    }
}

/// Serialize frames into the JSON array carried by
/// `exception.stack_details` and `profiling.frames`.
pub(crate) fn frames_to_json(frames: &[Arc<StackFrame>]) -> Result<String, EnrichmentError> {
    let details: Vec<FrameDetails<'_>> = frames
        .iter()
        .map(|frame| FrameDetails::from(frame.as_ref()))
        .collect();
    Ok(serde_json::to_string(&details)?)
}

impl CapturedException {
    /// Event attributes for this exception.
    pub fn to_attributes(&self) -> Vec<KeyValue> {
        let mut attributes = vec![
            KeyValue::new(semconv::EXCEPTION_TYPE, self.exception_type.clone()),
            KeyValue::new(semconv::EXCEPTION_MESSAGE, self.message.clone()),
            KeyValue::new(semconv::EXCEPTION_STACKTRACE, self.raw_stacktrace.clone()),
            KeyValue::new(semconv::EXCEPTION_ESCAPED, self.escaped),
        ];

        match frames_to_json(&self.frames) {
            Ok(details) => {
                attributes.push(KeyValue::new(semconv::EXCEPTION_STACK_DETAILS, details))
            }
            Err(err) => {
                otel_debug!(
                    name: "ExceptionEnricher.SerializeFailed",
                    reason = err.to_string()
                );
            }
        }
        // without frames there is nothing to tell two exceptions apart by
        if !self.stack_signature.is_empty() {
            attributes.push(KeyValue::new(
                semconv::EXCEPTION_STACK_SIGNATURE,
                self.stack_signature.to_string(),
            ));
        }

        if let Some(sha) = &self.vcs_commit_sha {
            attributes.push(KeyValue::new(semconv::EXCEPTION_VCS_COMMIT_SHA, sha.clone()));
        }
        if let Some(url) = &self.vcs_repository_url {
            attributes.push(KeyValue::new(
                semconv::EXCEPTION_VCS_REPOSITORY_URL,
                url.clone(),
            ));
        }
        attributes
    }
}

/// Turns exceptions into enriched `"exception"` span events.
///
/// Clones share the same [`StackCache`].
#[derive(Clone, Debug)]
pub struct ExceptionEnricher {
    cache: Arc<StackCache>,
    walker: StackWalker,
    ambient: Arc<dyn AmbientException>,
    vcs: VcsInfo,
    live_stack_depth: usize,
}

impl Default for ExceptionEnricher {
    fn default() -> Self {
        ExceptionEnricher::new(&ExceptionConfig::default())
    }
}

impl ExceptionEnricher {
    /// Create an enricher from `config`, tracking the propagating exception
    /// per thread.
    pub fn new(config: &ExceptionConfig) -> Self {
        let extractor = match &config.working_directory {
            Some(dir) => FrameExtractor::new(dir.clone()),
            None => FrameExtractor::default(),
        }
        .with_max_window(config.max_window)
        .with_max_source_bytes(config.max_source_bytes);

        ExceptionEnricher {
            cache: Arc::new(StackCache::new(config.cache_capacity)),
            walker: StackWalker::new(extractor),
            ambient: Arc::new(ThreadLocalAmbient),
            vcs: config.vcs.clone(),
            live_stack_depth: config.live_stack_depth,
        }
    }

    /// Process-wide enricher configured from the environment, used where no
    /// enricher was supplied.
    pub fn shared() -> &'static ExceptionEnricher {
        static SHARED: OnceLock<ExceptionEnricher> = OnceLock::new();
        SHARED.get_or_init(ExceptionEnricher::default)
    }

    /// Share `cache` instead of the enricher's own.
    pub fn with_cache(mut self, cache: Arc<StackCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Resolve frames with `extractor`.
    pub fn with_extractor(mut self, extractor: FrameExtractor) -> Self {
        self.walker = StackWalker::new(extractor).with_max_depth(self.walker.max_depth());
        self
    }

    /// Use `ambient` to decide whether an exception escaped.
    pub fn with_ambient<A>(mut self, ambient: A) -> Self
    where
        A: AmbientException + 'static,
    {
        self.ambient = Arc::new(ambient);
        self
    }

    /// Attach `vcs` to every event.
    pub fn with_vcs(mut self, vcs: VcsInfo) -> Self {
        self.vcs = vcs;
        self
    }

    /// The frame cache.
    pub fn cache(&self) -> &Arc<StackCache> {
        &self.cache
    }

    /// Frames kept when sampling the live stack of a starting span.
    pub fn live_stack_depth(&self) -> usize {
        self.live_stack_depth
    }

    /// The frame extractor.
    pub fn extractor(&self) -> &FrameExtractor {
        self.walker.extractor()
    }

    /// Resolve the exception's stack.
    pub fn capture(&self, exception: &Exception) -> CapturedException {
        let walked = self.walker.walk(exception.traceback(), &self.cache);
        CapturedException {
            exception_type: exception.type_name().to_string(),
            message: exception.message().to_string(),
            raw_stacktrace: exception.stacktrace(),
            frames: walked.frames,
            stack_signature: walked.signature,
            escaped: self.is_escaping(exception),
            vcs_commit_sha: self.vcs.commit_sha.clone(),
            vcs_repository_url: self.vcs.repository_url.clone(),
        }
    }

    /// Attributes of the `"exception"` event for `exception`. Never panics.
    ///
    /// An exception without frames gets the minimal attributes and no
    /// `exception.stack_signature`.
    pub fn exception_attributes(&self, exception: &Exception) -> Vec<KeyValue> {
        if exception.traceback().map_or(true, Traceback::is_empty) {
            return self.minimal_attributes(exception);
        }

        let captured = {
            let _enriching = EnrichingGuard::enter();
            panic::catch_unwind(AssertUnwindSafe(|| self.capture(exception).to_attributes()))
        };
        match captured {
            Ok(attributes) => attributes,
            Err(_) => {
                otel_warn!(
                    name: "ExceptionEnricher.Fallback",
                    exception_type = exception.type_name()
                );
                self.minimal_attributes(exception)
            }
        }
    }

    /// Add an enriched `"exception"` event to `span`. Does nothing if the span
    /// is not recording.
    pub fn enrich<S>(&self, span: &mut S, exception: &Exception)
    where
        S: Span,
    {
        if !span.is_recording() {
            return;
        }
        span.add_event(
            semconv::EXCEPTION_EVENT_NAME,
            self.exception_attributes(exception),
        );
    }

    /// Record `exception` on the active span. Without a recording active span,
    /// a span named `span_name` (or the exception's type) is started on the
    /// global `"mw-tracer"` tracer, marked as failed and ended.
    pub fn record_exception(&self, exception: &Exception, span_name: Option<&str>) {
        let cx = Context::current();
        let active = cx.span();
        if active.is_recording() {
            active.add_event(
                semconv::EXCEPTION_EVENT_NAME,
                self.exception_attributes(exception),
            );
            return;
        }

        let name = span_name.unwrap_or_else(|| exception.type_name()).to_string();
        let mut span = global::tracer(FALLBACK_TRACER_NAME).start(name);
        self.enrich(&mut span, exception);
        span.set_status(Status::error(exception.message().to_string()));
        span.end();
    }

    /// Returns `true` while this thread is building exception attributes.
    ///
    /// A panic hook should ignore panics raised meanwhile: they are caught
    /// and the event falls back to the minimal attributes.
    pub fn is_enriching() -> bool {
        ENRICHING.with(Cell::get)
    }

    fn is_escaping(&self, exception: &Exception) -> bool {
        self.ambient.current() == Some(exception.id())
    }

    fn minimal_attributes(&self, exception: &Exception) -> Vec<KeyValue> {
        vec![
            KeyValue::new(semconv::EXCEPTION_TYPE, exception.type_name().to_string()),
            KeyValue::new(semconv::EXCEPTION_MESSAGE, exception.message().to_string()),
            KeyValue::new(semconv::EXCEPTION_STACKTRACE, exception.stacktrace()),
            KeyValue::new(semconv::EXCEPTION_ESCAPED, self.is_escaping(exception)),
        ]
    }
}
