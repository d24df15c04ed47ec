use opentelemetry::trace::Tracer;
use opentelemetry::Value;
use opentelemetry_exception::semconv;
use opentelemetry_middleware::{Middleware, MwOptions};
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
use std::thread;

fn event_attr(span: &SpanData, key: &str) -> Option<Value> {
    span.events
        .events
        .iter()
        .find(|event| event.name == semconv::EXCEPTION_EVENT_NAME)?
        .attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

fn worker(exporter: &InMemorySpanExporter) -> Middleware {
    Middleware::builder(
        MwOptions::builder()
            .with_service_name("worker")
            .with_collect_logs(false)
            .with_capture_panics(true)
            .build(),
    )
    .with_span_exporter(exporter.clone())
    .build()
    .unwrap()
}

fn panic_in_span(middleware: &Middleware, name: &'static str, message: &'static str) {
    let tracer = middleware.tracer("worker");
    let joined = thread::spawn(move || {
        tracer.in_span(name, |_cx| {
            panic!("{message}");
        })
    })
    .join();
    assert!(joined.is_err());
    middleware.force_flush().unwrap();
}

// One test per binary: the panic hook is process wide.
#[test]
fn panics_are_recorded_as_escaped_exceptions() {
    let exporter = InMemorySpanExporter::default();
    let middleware = worker(&exporter);

    panic_in_span(&middleware, "process-batch", "batch 7 is corrupt");

    let spans = exporter.get_finished_spans().unwrap();
    let span = spans
        .iter()
        .find(|span| span.name == "process-batch")
        .expect("span ended while unwinding");
    assert_eq!(
        event_attr(span, semconv::EXCEPTION_TYPE),
        Some(Value::from("panic"))
    );
    assert_eq!(
        event_attr(span, semconv::EXCEPTION_MESSAGE),
        Some(Value::from("batch 7 is corrupt"))
    );
    assert_eq!(
        event_attr(span, semconv::EXCEPTION_ESCAPED),
        Some(Value::Bool(true))
    );
    assert!(event_attr(span, semconv::EXCEPTION_STACK_SIGNATURE).is_some());

    // shutting down hands the hook back, so a new installation can own it
    middleware.shutdown().unwrap();
    let exporter = InMemorySpanExporter::default();
    let middleware = worker(&exporter);

    panic_in_span(&middleware, "retry-batch", "still corrupt");

    let spans = exporter.get_finished_spans().unwrap();
    let span = spans
        .iter()
        .find(|span| span.name == "retry-batch")
        .expect("span ended while unwinding");
    assert_eq!(
        event_attr(span, semconv::EXCEPTION_MESSAGE),
        Some(Value::from("still corrupt"))
    );
    middleware.shutdown().unwrap();
}
