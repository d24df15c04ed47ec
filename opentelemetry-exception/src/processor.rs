//! # Exception Dedup Processor
//!
//! A retried operation that fails the same way every time records one
//! exception event per attempt, all with the same stack. At span end
//! [`ExceptionDedupProcessor`] keeps the first event for each
//! `exception.stack_signature` and drops the rest before handing the span to
//! the next processor.
use crate::semconv;
use opentelemetry::trace::Event;
use opentelemetry::{otel_debug, Context, Value};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use opentelemetry_sdk::Resource;
use std::collections::HashSet;
use std::time::Duration;

/// Remove exception events whose stack signature was already seen earlier in
/// `events`. Other events, and exception events without a signature, are kept.
/// Relative order is preserved.
///
/// Returns the number of events removed.
pub fn dedup_exception_events(events: &mut Vec<Event>) -> usize {
    let before = events.len();
    let mut seen: HashSet<String> = HashSet::new();
    events.retain(|event| match exception_signature(event) {
        Some(signature) => seen.insert(signature.as_str().into_owned()),
        None => true,
    });
    before - events.len()
}

fn exception_signature(event: &Event) -> Option<&Value> {
    if event.name != semconv::EXCEPTION_EVENT_NAME {
        return None;
    }
    event
        .attributes
        .iter()
        .find(|kv| kv.key.as_str() == semconv::EXCEPTION_STACK_SIGNATURE)
        .map(|kv| &kv.value)
}

/// Collapses duplicate exception events before delegating to another
/// [`SpanProcessor`].
#[derive(Debug)]
pub struct ExceptionDedupProcessor<P> {
    delegate: P,
}

impl<P: SpanProcessor> ExceptionDedupProcessor<P> {
    /// Wrap `delegate`.
    pub fn new(delegate: P) -> Self {
        ExceptionDedupProcessor { delegate }
    }

    /// The wrapped processor.
    pub fn delegate(&self) -> &P {
        &self.delegate
    }
}

impl<P: SpanProcessor> SpanProcessor for ExceptionDedupProcessor<P> {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        self.delegate.on_start(span, cx)
    }

    fn on_end(&self, mut span: SpanData) {
        let removed = dedup_exception_events(&mut span.events.events);
        if removed > 0 {
            otel_debug!(
                name: "ExceptionDedupProcessor.EventsCollapsed",
                span_name = &*span.name,
                removed = removed
            );
        }
        self.delegate.on_end(span)
    }

    fn force_flush(&self) -> OTelSdkResult {
        self.delegate.force_flush()
    }

    fn shutdown_with_timeout(&self, timeout: Duration) -> OTelSdkResult {
        self.delegate.shutdown_with_timeout(timeout)
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.delegate.set_resource(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProcessor;
    use opentelemetry::trace::{Span as _, Tracer, TracerProvider as _};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use std::time::SystemTime;

    fn exception(signature: Option<&'static str>, message: &'static str) -> Event {
        let mut attributes = vec![KeyValue::new(semconv::EXCEPTION_MESSAGE, message)];
        if let Some(signature) = signature {
            attributes.push(KeyValue::new(semconv::EXCEPTION_STACK_SIGNATURE, signature));
        }
        Event::new(
            semconv::EXCEPTION_EVENT_NAME,
            SystemTime::UNIX_EPOCH,
            attributes,
            0,
        )
    }

    fn log(name: &'static str) -> Event {
        Event::new(name, SystemTime::UNIX_EPOCH, vec![], 0)
    }

    fn messages(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .map(|event| {
                event
                    .attributes
                    .iter()
                    .find(|kv| kv.key.as_str() == semconv::EXCEPTION_MESSAGE)
                    .map(|kv| kv.value.to_string())
                    .unwrap_or_else(|| event.name.to_string())
            })
            .collect()
    }

    #[test]
    fn keeps_first_event_per_signature() {
        let mut events = vec![
            exception(Some("aa"), "first"),
            log("retry"),
            exception(Some("aa"), "second"),
            exception(Some("bb"), "other"),
            exception(None, "unsigned"),
            exception(None, "unsigned again"),
            exception(Some("bb"), "other again"),
        ];

        let removed = dedup_exception_events(&mut events);

        assert_eq!(removed, 2);
        assert_eq!(
            messages(&events),
            ["first", "retry", "other", "unsigned", "unsigned again"]
        );
    }

    #[test]
    fn dedup_is_idempotent() {
        let mut events = vec![
            exception(Some("aa"), "first"),
            exception(Some("aa"), "second"),
            exception(Some("bb"), "other"),
        ];
        dedup_exception_events(&mut events);
        let once = messages(&events);

        assert_eq!(dedup_exception_events(&mut events), 0);
        assert_eq!(messages(&events), once);
    }

    #[test]
    fn signature_on_other_event_names_is_ignored() {
        let mut events = vec![
            Event::new(
                "retry",
                SystemTime::UNIX_EPOCH,
                vec![KeyValue::new(semconv::EXCEPTION_STACK_SIGNATURE, "aa")],
                0,
            ),
            exception(Some("aa"), "first"),
        ];
        assert_eq!(dedup_exception_events(&mut events), 0);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn stackless_enriched_exceptions_survive_on_end() {
        let recorder = RecordingProcessor::default();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(ExceptionDedupProcessor::new(recorder.clone()))
            .build();
        let enricher = crate::ExceptionEnricher::default();

        let mut span = provider.tracer("test").start("checkout");
        for (type_name, message) in [("DbError", "pool closed"), ("AuthError", "token expired")] {
            let exception = crate::Exception::new(type_name, message)
                .with_traceback(crate::Traceback::default());
            enricher.enrich(&mut span, &exception);
        }
        span.end();

        let spans = recorder.finished();
        assert_eq!(
            messages(&spans[0].events.events),
            ["pool closed", "token expired"]
        );
    }

    #[test]
    fn processor_collapses_before_delegate() {
        let recorder = RecordingProcessor::default();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(ExceptionDedupProcessor::new(recorder.clone()))
            .build();
        let tracer = provider.tracer("test");

        let mut span = tracer.start("retry-loop");
        for attempt in 0i64..3 {
            span.add_event(
                semconv::EXCEPTION_EVENT_NAME,
                vec![
                    KeyValue::new(semconv::EXCEPTION_STACK_SIGNATURE, "aa"),
                    KeyValue::new("attempt", attempt),
                ],
            );
        }
        span.end();

        let spans = recorder.finished();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].events.events.len(), 1);
        assert_eq!(
            spans[0].events.events[0].attributes[1],
            KeyValue::new("attempt", 0i64)
        );
        assert_eq!(recorder.started(), 1);
    }

    #[test]
    fn lifecycle_delegates() {
        let recorder = RecordingProcessor::default();
        let processor = ExceptionDedupProcessor::new(recorder.clone());

        assert!(processor.force_flush().is_ok());
        assert!(processor.shutdown().is_ok());
        assert_eq!(recorder.flushes(), 1);
        assert_eq!(recorder.shutdowns(), 1);
    }
}
