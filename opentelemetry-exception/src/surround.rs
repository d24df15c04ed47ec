//! Attaches the source surrounding the application code that started a span.
use crate::cache::StackCache;
use crate::enricher::ExceptionEnricher;
use crate::frame::{FrameExtractor, StackFrame};
use crate::semconv;
use crate::walker::Traceback;
use opentelemetry::trace::Span as _;
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{Span, SpanData, SpanProcessor};
use std::time::Duration;

const LINES_BEFORE: u32 = 5;
const LINES_AFTER: u32 = 4;

/// Sets `code.surrounding` on every span at start, from the innermost frame
/// of the live stack that is not dependency code:
///
/// ```text
/// path = src/orders.rs at line 42
/// codeblock = 37: ...
/// 38: ...
/// ```
#[derive(Debug)]
pub struct SurroundingCodeSpanProcessor {
    extractor: FrameExtractor,
    cache: StackCache,
}

impl SurroundingCodeSpanProcessor {
    /// Resolve frames with a copy of `enricher`'s extractor narrowed to the
    /// lines around each frame. Uses its own cache since the windows differ.
    pub fn new(enricher: &ExceptionEnricher) -> Self {
        SurroundingCodeSpanProcessor {
            extractor: enricher
                .extractor()
                .clone()
                .with_max_window(2 * LINES_BEFORE as usize)
                .with_function_bodies(false),
            cache: StackCache::new(enricher.cache().capacity()),
        }
    }

    fn innermost_application_frame(&self, traceback: &Traceback) -> Option<String> {
        traceback
            .frames()
            .iter()
            .filter(|raw| raw.file.is_some() && raw.line.is_some())
            .map(|raw| self.extractor.extract(raw, &self.cache))
            .find(|frame| !frame.is_external() && frame.start_line().is_some())
            .map(|frame| surrounding_code(&frame))
    }
}

/// Render `frame`'s window, limited to the lines around its line.
fn surrounding_code(frame: &StackFrame) -> String {
    let line = frame.line_number();
    let first = line.saturating_sub(LINES_BEFORE);
    let last = line.saturating_add(LINES_AFTER);

    let mut out = format!(
        "path = {} at line {}\ncodeblock = ",
        frame.file_path(),
        line
    );
    let block: Vec<String> = frame
        .source_window()
        .iter()
        .filter(|source| (first..=last).contains(&source.number))
        .map(|source| format!("{}: {}", source.number, source.text))
        .collect();
    out.push_str(&block.join("\n"));
    out
}

impl SpanProcessor for SurroundingCodeSpanProcessor {
    fn on_start(&self, span: &mut Span, _cx: &Context) {
        if !span.is_recording() {
            return;
        }
        let traceback = Traceback::capture();
        if let Some(code) = self.innermost_application_frame(&traceback) {
            span.set_attribute(KeyValue::new(semconv::CODE_SURROUNDING, code));
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
