//! Tracer provider bootstrap.
use crate::error::MiddlewareError;
use crate::options::MwOptions;
use opentelemetry::baggage::BaggageExt;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::Span as _;
use opentelemetry::{otel_warn, Context, KeyValue};
use opentelemetry_exception::{
    ExceptionDedupProcessor, ExceptionEnricher, ProfileSpanProcessor,
    SurroundingCodeSpanProcessor,
};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{
    BatchSpanProcessor, Sampler, SdkTracerProvider, Span, SpanData, SpanExporter, SpanProcessor,
};
use opentelemetry_sdk::Resource;
use std::time::Duration;

/// Copies every baggage entry of the parent context onto the span.
#[derive(Debug)]
pub struct BaggageSpanProcessor;

impl SpanProcessor for BaggageSpanProcessor {
    fn on_start(&self, span: &mut Span, cx: &Context) {
        for (key, value) in cx.baggage().iter() {
            span.set_attribute(KeyValue::new(key.clone(), value.0.clone()));
        }
    }

    fn on_end(&self, _span: SpanData) {}

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }
}

/// Root spans are sampled at `rate`; child spans follow their parent.
pub(crate) fn sampler(rate: f64) -> Sampler {
    let root = if rate >= 1.0 {
        Sampler::AlwaysOn
    } else if rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(rate)
    };
    Sampler::ParentBased(Box::new(root))
}

/// Propagator for the configured names. `tracecontext` and `baggage` are
/// supported; `none` disables propagation. Anything else is skipped with a
/// warning, and if nothing usable remains W3C trace context is used.
pub(crate) fn propagator(options: &MwOptions) -> TextMapCompositePropagator {
    let names = options.propagators();
    let mut propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>> = Vec::new();
    for name in &names {
        match name.as_str() {
            "tracecontext" => propagators.push(Box::new(TraceContextPropagator::new())),
            "baggage" => propagators.push(Box::new(BaggagePropagator::new())),
            "none" => {}
            unsupported => {
                otel_warn!(
                    name: "Middleware.UnsupportedPropagator",
                    propagator = unsupported.to_string()
                );
            }
        }
    }

    if propagators.is_empty() && !names.iter().any(|name| name == "none") {
        propagators.push(Box::new(TraceContextPropagator::new()));
    }
    TextMapCompositePropagator::new(propagators)
}

/// OTLP/gRPC span exporter for the configured target, gzip compressed.
///
/// Must be called from within a Tokio runtime.
pub(crate) fn otlp_span_exporter(
    options: &MwOptions,
) -> Result<opentelemetry_otlp::SpanExporter, MiddlewareError> {
    opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(options.target.clone())
        .with_compression(Compression::Gzip)
        .build()
        .map_err(|source| MiddlewareError::ExporterBuild {
            signal: "span",
            source,
        })
}

/// Tracer provider exporting through `exporter`.
///
/// Processors run in this order: baggage, then the span-start profiling
/// processors when profiling is collected, then the batch exporter behind an
/// [`ExceptionDedupProcessor`], then the console exporter if enabled.
pub(crate) fn build_tracer_provider<E>(
    options: &MwOptions,
    resource: Resource,
    enricher: &ExceptionEnricher,
    exporter: E,
) -> SdkTracerProvider
where
    E: SpanExporter + 'static,
{
    let mut builder = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(sampler(options.sample_rate))
        .with_span_processor(BaggageSpanProcessor);

    if options.collect_profiling {
        builder = builder
            .with_span_processor(ProfileSpanProcessor::new(enricher))
            .with_span_processor(SurroundingCodeSpanProcessor::new(enricher));
    }

    builder = builder.with_span_processor(ExceptionDedupProcessor::new(
        BatchSpanProcessor::builder(exporter).build(),
    ));

    if options.console_exporter {
        builder = builder.with_span_processor(ExceptionDedupProcessor::new(
            BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default()).build(),
        ));
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{with_env, MW_PROPAGATORS};
    use opentelemetry::trace::{Span as _, TraceContextExt, Tracer, TracerProvider as _};
    use opentelemetry::Value;
    use opentelemetry_exception::{semconv, Exception, ExceptionConfig, RawFrame, Traceback};
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    fn fields(options: &MwOptions) -> Vec<String> {
        let mut fields: Vec<String> = propagator(options).fields().map(str::to_string).collect();
        fields.sort();
        fields
    }

    fn attr<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a Value> {
        attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    #[test]
    fn propagators_from_names() {
        with_env(&[(MW_PROPAGATORS, "tracecontext, Baggage")], || {
            assert_eq!(
                fields(&MwOptions::default()),
                ["baggage", "traceparent", "tracestate"]
            );
        });
    }

    #[test]
    fn unsupported_propagators_fall_back_to_tracecontext() {
        with_env(&[(MW_PROPAGATORS, "b3")], || {
            assert_eq!(
                fields(&MwOptions::default()),
                ["traceparent", "tracestate"]
            );
        });
        with_env(&[(MW_PROPAGATORS, "b3,baggage")], || {
            assert_eq!(fields(&MwOptions::default()), ["baggage"]);
        });
    }

    #[test]
    fn none_disables_propagation() {
        with_env(&[(MW_PROPAGATORS, "none")], || {
            assert!(fields(&MwOptions::default()).is_empty());
        });
    }

    fn provider(options: &MwOptions) -> (InMemorySpanExporter, SdkTracerProvider) {
        let exporter = InMemorySpanExporter::default();
        let config = ExceptionConfig::default();
        let provider = build_tracer_provider(
            options,
            Resource::builder_empty().build(),
            &ExceptionEnricher::new(&config),
            exporter.clone(),
        );
        (exporter, provider)
    }

    #[test]
    fn sample_rate_zero_drops_root_spans() {
        with_env(&[], || {
            let (_exporter, never) = provider(&MwOptions::builder().with_sample_rate(0.0).build());
            let span = never.tracer("test").start("dropped");
            assert!(!span.is_recording());

            let (_exporter, always) = provider(&MwOptions::builder().with_sample_rate(1.0).build());
            let span = always.tracer("test").start("kept");
            assert!(span.is_recording());
        });
    }

    #[test]
    fn exported_spans_are_deduplicated() {
        with_env(&[], || {
            let (exporter, provider) = provider(&MwOptions::default());
            let enricher = ExceptionEnricher::default();
            let exception = Exception::new("Timeout", "upstream").with_traceback(
                Traceback::from_frames(vec![RawFrame::new("src/client.rs", 12, "call")]),
            );

            let mut span = provider.tracer("test").start("retry");
            enricher.enrich(&mut span, &exception);
            enricher.enrich(&mut span, &exception);
            span.end();
            provider.force_flush().unwrap();

            let spans = exporter.get_finished_spans().unwrap();
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].events.events.len(), 1);
            assert_eq!(spans[0].events.events[0].name, semconv::EXCEPTION_EVENT_NAME);
        });
    }

    #[test]
    fn baggage_and_profiling_attributes() {
        with_env(&[], || {
            let (exporter, provider) =
                provider(&MwOptions::builder().with_collect_profiling(true).build());
            let cx = Context::current_with_baggage(vec![KeyValue::new("tenant", "acme")]);

            let span = provider.tracer("test").start_with_context("checkout", &cx);
            let cx = cx.with_span(span);
            cx.span().end();
            provider.force_flush().unwrap();

            let spans = exporter.get_finished_spans().unwrap();
            let attributes = &spans[0].attributes;
            assert_eq!(attr(attributes, "tenant"), Some(&Value::from("acme")));
            assert!(attr(attributes, semconv::PROFILING_STACK_ID).is_some());
            assert!(attr(attributes, semconv::PROFILING_FRAME_IDS).is_some());
        });
    }
}
