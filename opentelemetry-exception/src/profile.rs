//! Records where in the code every span was started.
use crate::cache::StackCache;
use crate::enricher::{frames_to_json, ExceptionEnricher};
use crate::semconv;
use crate::walker::{StackWalker, WalkedStack};
use opentelemetry::trace::Span as _;
use opentelemetry::{otel_debug, Array, Context, KeyValue, StringValue, Value};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use std::sync::Arc;
use std::time::Duration;

/// Attaches the innermost frames of the live stack to every span at start:
/// `profiling.stack_id`, `profiling.frames` and `profiling.frame_ids`.
#[derive(Debug)]
pub struct ProfileSpanProcessor {
    walker: StackWalker,
    cache: Arc<StackCache>,
}

impl ProfileSpanProcessor {
    /// Resolve frames with `enricher`'s extractor and cache, keeping its
    /// [`live_stack_depth`](ExceptionEnricher::live_stack_depth) frames.
    pub fn new(enricher: &ExceptionEnricher) -> Self {
        ProfileSpanProcessor {
            walker: StackWalker::live(enricher.extractor().clone())
                .with_max_depth(Some(enricher.live_stack_depth())),
            cache: enricher.cache().clone(),
        }
    }

    /// Keep at most `depth` frames.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.walker = self.walker.with_max_depth(Some(depth));
        self
    }

    fn stack_attributes(walked: &WalkedStack) -> Vec<KeyValue> {
        let mut attributes = vec![KeyValue::new(
            semconv::PROFILING_STACK_ID,
            walked.signature.to_string(),
        )];

        match frames_to_json(&walked.frames) {
            Ok(frames) => attributes.push(KeyValue::new(semconv::PROFILING_FRAMES, frames)),
            Err(err) => {
                otel_debug!(
                    name: "ProfileSpanProcessor.SerializeFailed",
                    reason = err.to_string()
                );
            }
        }

        let ids: Vec<StringValue> = walked
            .frames
            .iter()
            .map(|frame| {
                format!(
                    "{}:{}:{}",
                    frame.file_path(),
                    frame.function_name(),
                    frame.line_number()
                )
                .into()
            })
            .collect();
        attributes.push(KeyValue::new(
            semconv::PROFILING_FRAME_IDS,
            Value::Array(Array::String(ids)),
        ));
        attributes
    }
}

impl SpanProcessor for ProfileSpanProcessor {
    fn on_start(&self, span: &mut Span, _cx: &Context) {
        if !span.is_recording() {
            return;
        }
        let walked = self.walker.walk_current(&self.cache);
        if walked.frames.is_empty() {
            return;
        }
        span.set_attributes(Self::stack_attributes(&walked));
    }

    fn on_end(&self, _span: SpanData) {}

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        Ok(())
    }
}
