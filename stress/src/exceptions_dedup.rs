/*
    Records the same captured exception several times per span, so the cost
    is dominated by the de-duplication at span end rather than stack walking.
*/

use lazy_static::lazy_static;
use opentelemetry::{
    trace::{Span, Tracer, TracerProvider},
    Context,
};
use opentelemetry_exception::{
    EnrichedTracer, Exception, ExceptionDedupProcessor, ExceptionEnricher, RawFrame, Traceback,
};
use opentelemetry_sdk::{
    error::OTelSdkResult,
    trace::{self as sdktrace, SpanData, SpanProcessor},
};
use std::time::Duration;

mod throughput;

const RETRIES: usize = 5;

lazy_static! {
    static ref PROVIDER: sdktrace::SdkTracerProvider = sdktrace::SdkTracerProvider::builder()
        .with_sampler(sdktrace::Sampler::AlwaysOn)
        .with_span_processor(ExceptionDedupProcessor::new(NoOpSpanProcessor))
        .build();
    static ref TRACER: EnrichedTracer<sdktrace::SdkTracer> =
        EnrichedTracer::new(PROVIDER.tracer("stress"), ExceptionEnricher::default());
    static ref EXCEPTION: Exception = Exception::new("ConnectionRefused", "upstream unavailable")
        .with_traceback(Traceback::from_frames(vec![
            RawFrame::new("src/client.rs", 88, "connect"),
            RawFrame::new("src/client.rs", 41, "send"),
            RawFrame::new("src/main.rs", 12, "main"),
        ]));
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
    throughput::test_throughput(test_retried_exception);
}

fn test_retried_exception() {
    let mut span = TRACER.start("test_retried_exception");
    for _ in 0..RETRIES {
        span.record_exception(&EXCEPTION);
    }
    span.end();
}
