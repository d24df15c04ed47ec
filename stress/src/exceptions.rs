/*
    Records an enriched exception on every span. Each iteration walks the
    live stack, so this measures the cost of resolving frames once the stack
    cache is warm.
*/

use lazy_static::lazy_static;
use opentelemetry::{
    trace::{Span, SpanBuilder, Tracer, TracerProvider},
    Context, KeyValue,
};
use opentelemetry_exception::{
    EnrichedTracer, ExceptionConfig, ExceptionDedupProcessor, ExceptionEnricher,
};
use opentelemetry_sdk::{
    error::OTelSdkResult,
    trace::{self as sdktrace, SpanData, SpanProcessor},
};
use std::time::Duration;

mod throughput;

lazy_static! {
    static ref PROVIDER: sdktrace::SdkTracerProvider = sdktrace::SdkTracerProvider::builder()
        .with_sampler(sdktrace::Sampler::AlwaysOn)
        .with_span_processor(ExceptionDedupProcessor::new(NoOpSpanProcessor))
        .build();
    static ref TRACER: EnrichedTracer<sdktrace::SdkTracer> = EnrichedTracer::new(
        PROVIDER.tracer("stress"),
        ExceptionEnricher::new(&ExceptionConfig::default()),
    );
}

#[derive(Debug)]
pub struct NoOpSpanProcessor;

impl SpanProcessor for NoOpSpanProcessor {
    fn on_start(&self, _span: &mut opentelemetry_sdk::trace::Span, _cx: &Context) {
        // No-op
    }

    fn on_end(&self, _span: SpanData) {
        // No-op
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }
}

fn main() {
    throughput::test_throughput(test_exception);
}

fn test_exception() {
    let span_builder = SpanBuilder::from_name("test_exception")
        .with_attributes(vec![KeyValue::new("attribute_at_span_start", "value")]);

    let mut span = TRACER.build(span_builder);
    if let Err(err) = "forty-two".parse::<u32>() {
        span.record_error(&err);
    }
    span.end();
}
