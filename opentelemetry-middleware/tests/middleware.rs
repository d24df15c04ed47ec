use opentelemetry::trace::{Span, Status, Tracer, TracerProvider as _};
use opentelemetry::Value;
use opentelemetry_exception::{semconv, Exception, RawFrame, Traceback};
use opentelemetry_middleware::{
    FrameworkAdapter, Middleware, MiddlewareError, MwOptions, RequestExceptionSink,
};
use opentelemetry_sdk::logs::InMemoryLogExporter;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SpanData};
use std::sync::{Arc, Mutex, MutexGuard};

// Each test replaces the global tracer provider.
static GLOBAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn options() -> MwOptions {
    MwOptions::builder()
        .with_service_name("orders")
        .with_capture_panics(false)
        .with_collect_logs(false)
        .build()
}

fn middleware(options: MwOptions) -> (InMemorySpanExporter, Middleware) {
    let exporter = InMemorySpanExporter::default();
    let middleware = Middleware::builder(options)
        .with_span_exporter(exporter.clone())
        .build()
        .unwrap();
    (exporter, middleware)
}

fn event_attr(span: &SpanData, key: &str) -> Option<Value> {
    span.events
        .events
        .first()?
        .attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

#[test]
fn errors_recorded_on_tracer_spans_are_enriched() {
    let _serial = serial();
    let (exporter, middleware) = middleware(options());

    let tracer = middleware.tracer("orders");
    let mut span = tracer.start("checkout");
    let err = "forty-two".parse::<u32>().unwrap_err();
    // a retried call fails twice from the same place
    for _ in 0..2 {
        span.record_error(&err);
    }
    span.end();
    middleware.force_flush().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].events.events.len(), 1);
    assert_eq!(
        event_attr(&spans[0], semconv::EXCEPTION_MESSAGE),
        Some(Value::from("invalid digit found in string"))
    );
    assert!(event_attr(&spans[0], semconv::EXCEPTION_STACK_DETAILS).is_some());
    assert_eq!(
        middleware
            .resource()
            .get(&opentelemetry::Key::from_static_str("service.name")),
        Some(Value::from("orders"))
    );

    middleware.shutdown().unwrap();
}

#[test]
fn record_exception_without_active_span_starts_one() {
    let _serial = serial();
    let (exporter, middleware) = middleware(options());

    let exception = Exception::new("JobFailed", "queue unavailable").with_traceback(
        Traceback::from_frames(vec![RawFrame::new("src/jobs.rs", 18, "drain")]),
    );
    middleware.record_exception(&exception, Some("nightly-job"));
    middleware.force_flush().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "nightly-job");
    assert_eq!(spans[0].instrumentation_scope.name(), "mw-tracer");
    assert_eq!(spans[0].status, Status::error("queue unavailable"));
    assert_eq!(
        event_attr(&spans[0], semconv::EXCEPTION_ESCAPED),
        Some(Value::Bool(false))
    );

    middleware.shutdown().unwrap();
}

#[test]
fn shutdown_is_idempotent() {
    let _serial = serial();
    let (_exporter, middleware) = middleware(options());

    middleware.shutdown().unwrap();
    assert!(matches!(
        middleware.shutdown(),
        Err(MiddlewareError::AlreadyShutdown)
    ));
    assert!(matches!(
        middleware.force_flush(),
        Err(MiddlewareError::AlreadyShutdown)
    ));
}

#[test]
fn disabled_signals_have_no_provider() {
    let _serial = serial();
    let middleware = Middleware::builder(
        MwOptions::builder()
            .with_collect_traces(false)
            .with_collect_logs(false)
            .with_capture_panics(false)
            .build(),
    )
    .build()
    .unwrap();

    assert!(middleware.tracer_provider().is_none());
    assert!(middleware.logger_provider().is_none());
    middleware.shutdown().unwrap();
}

#[derive(Debug, Default)]
struct ServerAdapter {
    sink: Mutex<Option<RequestExceptionSink>>,
}

impl ServerAdapter {
    fn unhandled(&self, exception: &Exception) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.report(exception, None);
        }
    }
}

impl FrameworkAdapter for ServerAdapter {
    fn name(&self) -> &str {
        "test-server"
    }

    fn subscribe(&self, sink: RequestExceptionSink) -> Result<(), MiddlewareError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn unsubscribe(&self) {
        *self.sink.lock().unwrap() = None;
    }
}

#[test]
fn framework_adapter_reports_escaped_request_exceptions() {
    let _serial = serial();
    let adapter = Arc::new(ServerAdapter::default());
    let exporter = InMemorySpanExporter::default();
    let middleware = Middleware::builder(options())
        .with_span_exporter(exporter.clone())
        .with_framework_adapter(adapter.clone())
        .build()
        .unwrap();

    let exception = Exception::new("HandlerError", "boom");
    middleware
        .tracer_provider()
        .unwrap()
        .tracer("server")
        .in_span("GET /orders", |_cx| adapter.unhandled(&exception));
    middleware.force_flush().unwrap();

    let spans = exporter.get_finished_spans().unwrap();
    assert_eq!(spans[0].name, "GET /orders");
    assert_eq!(
        event_attr(&spans[0], semconv::EXCEPTION_ESCAPED),
        Some(Value::Bool(true))
    );

    middleware.shutdown().unwrap();
    assert!(adapter.sink.lock().unwrap().is_none());
}

#[test]
fn logs_are_forwarded_from_tracing() {
    let _serial = serial();
    let exporter = InMemoryLogExporter::default();
    let middleware = Middleware::builder(
        MwOptions::builder()
            .with_collect_traces(false)
            .with_capture_panics(false)
            .build(),
    )
    .with_log_exporter(exporter.clone())
    .build()
    .unwrap();

    tracing::error!(target: "orders", "payment declined");
    tracing::debug!(target: "orders", "cart loaded");
    middleware.force_flush().unwrap();

    let logs = exporter.get_emitted_logs().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].record.target().map(|target| target.as_ref()), Some("orders"));

    middleware.shutdown().unwrap();
}
