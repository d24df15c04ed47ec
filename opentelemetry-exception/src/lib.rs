//! # OpenTelemetry Exception Enrichment
//!
//! Captures errors and panics as enriched `"exception"` span events. When an
//! exception is recorded the call stack is walked, each frame is resolved to
//! its source location with a bounded window of surrounding source lines,
//! frames are classified as application code or dependency code, and the
//! result is attached to the span as a serialized attribute. At span end,
//! [`ExceptionDedupProcessor`] collapses exception events that share the same
//! stack signature so a retried operation reports one representative failure.
//!
//! ```ascii
//!   error / panic
//!        |
//!        v
//!   ExceptionEnricher --> StackWalker --> FrameExtractor <--> StackCache
//!        |
//!        v  add_event("exception")
//!      Span --- end() ---> ExceptionDedupProcessor ---> delegate SpanProcessor ---> exporter
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use opentelemetry::trace::{Tracer, TracerProvider as _};
//! use opentelemetry_exception::{EnrichedTracer, Exception, ExceptionDedupProcessor, ExceptionEnricher};
//! use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
//!
//! # fn main() {
//! # let exporter = opentelemetry_sdk::trace::InMemorySpanExporter::default();
//! let provider = SdkTracerProvider::builder()
//!     .with_span_processor(ExceptionDedupProcessor::new(
//!         BatchSpanProcessor::builder(exporter).build(),
//!     ))
//!     .build();
//! let enricher = ExceptionEnricher::default();
//! let tracer = EnrichedTracer::new(provider.tracer("app"), enricher.clone());
//!
//! tracer.in_span("parse", |_cx| {
//!     if let Err(err) = "forty-two".parse::<u32>() {
//!         enricher.record_exception(&Exception::capture(&err), None);
//!     }
//! });
//! # }
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod ambient;
mod cache;
mod config;
mod enricher;
mod error;
mod exception;
mod frame;
mod processor;
mod profile;
pub mod semconv;
mod span;
mod surround;
#[cfg(test)]
mod testing;
mod walker;

pub use ambient::{AmbientException, PropagationGuard, ThreadLocalAmbient};
pub use cache::{FrameKey, StackCache, DEFAULT_CACHE_CAPACITY};
pub use config::{ExceptionConfig, ExceptionConfigBuilder};
pub use enricher::{CapturedException, ExceptionEnricher, VcsInfo};
pub use exception::{Exception, ExceptionId};
pub use frame::{
    DependencyRoots, ExternalClassifier, FrameExtractor, RawFrame, SourceLine, StackFrame,
    UNKNOWN_FUNCTION,
};
pub use processor::{dedup_exception_events, ExceptionDedupProcessor};
pub use profile::ProfileSpanProcessor;
pub use span::{EnrichedSpan, EnrichedTracer, ExceptionContextExt};
pub use surround::SurroundingCodeSpanProcessor;
pub use walker::{StackSignature, StackWalker, Traceback, WalkedStack};
