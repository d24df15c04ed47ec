//! Span and tracer wrappers that enrich errors recorded through the standard
//! [`Span::record_error`] API.
//!
//! A span moved into a [`Context`] is type-erased, and its `record_error`
//! falls back to the plain OpenTelemetry event. Record through
//! [`ExceptionContextExt`] on the context instead:
//!
//! ```no_run
//! use opentelemetry_exception::{EnrichedTracer, ExceptionContextExt, ExceptionEnricher};
//!
//! let tracer = EnrichedTracer::new(
//!     opentelemetry::global::tracer("checkout"),
//!     ExceptionEnricher::default(),
//! );
//! tracer.in_enriched_span("charge", |cx| {
//!     if let Err(err) = "12x".parse::<u32>() {
//!         cx.record_enriched_error(&err);
//!     }
//! });
//! ```
use crate::enricher::ExceptionEnricher;
use crate::exception::Exception;
use crate::semconv;
use opentelemetry::trace::{Span, SpanBuilder, SpanContext, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use std::borrow::Cow;
use std::error::Error;
use std::time::SystemTime;

/// A span whose [`record_error`](Span::record_error) attaches an enriched
/// exception event.
///
/// Only while the span is owned: once it is moved into a [`Context`], use
/// [`ExceptionContextExt::record_enriched_error`].
#[derive(Debug)]
pub struct EnrichedSpan<S> {
    inner: S,
    enricher: ExceptionEnricher,
    // set while an error is being enriched
    enriching: bool,
}

impl<S: Span> EnrichedSpan<S> {
    /// Wrap `inner`.
    pub fn new(inner: S, enricher: ExceptionEnricher) -> Self {
        EnrichedSpan {
            inner,
            enricher,
            enriching: false,
        }
    }

    /// Record an already captured exception.
    pub fn record_exception(&mut self, exception: &Exception) {
        self.enricher.enrich(&mut self.inner, exception);
    }

    /// The wrapped span.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Unwrap the span.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Span> Span for EnrichedSpan<S> {
    fn add_event_with_timestamp<T>(
        &mut self,
        name: T,
        timestamp: SystemTime,
        attributes: Vec<KeyValue>,
    ) where
        T: Into<Cow<'static, str>>,
    {
        self.inner
            .add_event_with_timestamp(name, timestamp, attributes)
    }

    fn record_error(&mut self, err: &dyn Error) {
        if self.enriching {
            self.inner.record_error(err);
            return;
        }
        self.enriching = true;
        let exception = Exception::capture_dyn(err);
        self.enricher.enrich(&mut self.inner, &exception);
        self.enriching = false;
    }

    fn span_context(&self) -> &SpanContext {
        self.inner.span_context()
    }

    fn is_recording(&self) -> bool {
        self.inner.is_recording()
    }

    fn set_attribute(&mut self, attribute: KeyValue) {
        self.inner.set_attribute(attribute)
    }

    fn set_status(&mut self, status: Status) {
        self.inner.set_status(status)
    }

    fn update_name<T>(&mut self, new_name: T)
    where
        T: Into<Cow<'static, str>>,
    {
        self.inner.update_name(new_name)
    }

    fn add_link(&mut self, span_context: SpanContext, attributes: Vec<KeyValue>) {
        self.inner.add_link(span_context, attributes)
    }

    fn end_with_timestamp(&mut self, timestamp: SystemTime) {
        self.inner.end_with_timestamp(timestamp)
    }
}

/// A tracer producing [`EnrichedSpan`]s.
#[derive(Clone, Debug)]
pub struct EnrichedTracer<T> {
    tracer: T,
    enricher: ExceptionEnricher,
}

impl<T: Tracer> EnrichedTracer<T> {
    /// Wrap `tracer`.
    pub fn new(tracer: T, enricher: ExceptionEnricher) -> Self {
        EnrichedTracer { tracer, enricher }
    }

    /// The enricher attached to every span.
    pub fn enricher(&self) -> &ExceptionEnricher {
        &self.enricher
    }

    /// Like [`Tracer::in_span`], with this tracer's enricher carried by the
    /// context passed to `f` and made current.
    pub fn in_enriched_span<R, F, N>(&self, name: N, f: F) -> R
    where
        F: FnOnce(Context) -> R,
        N: Into<Cow<'static, str>>,
        T::Span: Send + Sync + 'static,
    {
        let span = self.start(name);
        let cx = Context::current_with_span(span).with_enricher(self.enricher.clone());
        let _guard = cx.clone().attach();
        f(cx)
    }
}

/// Records enriched exceptions on the span of a [`Context`].
///
/// The enricher is the one carried by the context, see
/// [`with_enricher`](ExceptionContextExt::with_enricher), or a process-wide
/// default enricher.
pub trait ExceptionContextExt {
    /// A copy of this context carrying `enricher`.
    fn with_enricher(&self, enricher: ExceptionEnricher) -> Self;

    /// The enricher carried by this context, if any.
    fn enricher(&self) -> Option<&ExceptionEnricher>;

    /// Capture `err` with the current stack and add it to the context's span.
    fn record_enriched_error(&self, err: &dyn Error);

    /// Add an already captured exception to the context's span.
    fn record_enriched_exception(&self, exception: &Exception);
}

impl ExceptionContextExt for Context {
    fn with_enricher(&self, enricher: ExceptionEnricher) -> Self {
        self.with_value(enricher)
    }

    fn enricher(&self) -> Option<&ExceptionEnricher> {
        self.get::<ExceptionEnricher>()
    }

    #[inline(never)]
    fn record_enriched_error(&self, err: &dyn Error) {
        if !self.span().is_recording() {
            return;
        }
        self.record_enriched_exception(&Exception::capture_dyn(err));
    }

    fn record_enriched_exception(&self, exception: &Exception) {
        let span = self.span();
        if !span.is_recording() {
            return;
        }
        let enricher = ExceptionContextExt::enricher(self).unwrap_or_else(|| ExceptionEnricher::shared());
        span.add_event(
            semconv::EXCEPTION_EVENT_NAME,
            enricher.exception_attributes(exception),
        );
    }
}

impl<T: Tracer> Tracer for EnrichedTracer<T> {
    type Span = EnrichedSpan<T::Span>;

    fn build_with_context(&self, builder: SpanBuilder, parent_cx: &Context) -> Self::Span {
        EnrichedSpan::new(
            self.tracer.build_with_context(builder, parent_cx),
            self.enricher.clone(),
        )
    }
}
