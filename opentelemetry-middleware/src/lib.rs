//! # Middleware OpenTelemetry Distribution
//!
//! Sets up OpenTelemetry tracing and logging for a service reporting to
//! Middleware: an OTLP/gRPC exporter for spans and logs, a resource describing
//! the service, the configured propagators and sampler, and exception
//! enrichment from [`opentelemetry_exception`].
//!
//! Exceptions reach spans three ways:
//!
//! * explicitly, through [`Middleware::record_exception`] or
//!   [`record_exception`],
//! * from the process panic hook, installed unless `MW_CAPTURE_PANICS=false`,
//! * from the request-exception notification of a registered
//!   [`FrameworkAdapter`].
//!
//! Every exported span passes through an
//! [`ExceptionDedupProcessor`](opentelemetry_exception::ExceptionDedupProcessor),
//! so a retried operation reports each distinct failure once.
//!
//! ## Usage
//!
//! ```no_run
//! use opentelemetry::trace::Tracer;
//! use opentelemetry_middleware::{Middleware, MwOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let middleware = Middleware::init(
//!         MwOptions::builder()
//!             .with_service_name("orders")
//!             .with_access_token("your-api-key")
//!             .build(),
//!     )?;
//!
//!     let tracer = middleware.tracer("orders");
//!     tracer.in_span("checkout", |_cx| {
//!         if let Err(err) = "forty-two".parse::<u32>() {
//!             opentelemetry_middleware::record_exception(&err, None);
//!         }
//!     });
//!
//!     middleware.shutdown()?;
//!     Ok(())
//! }
//! ```
//!
//! All options can also be set through environment variables, see
//! [`MwOptionsBuilder`].
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

mod error;
mod install;
mod log;
pub mod options;
mod resource;
mod trace;

pub use error::MiddlewareError;
pub use install::{FrameworkAdapter, InstallationState, RequestExceptionSink};
pub use options::{MwOptions, MwOptionsBuilder};
pub use resource::{create_resource, SDK_VERSION};
pub use trace::BaggageSpanProcessor;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::otel_info;
use opentelemetry_exception::{EnrichedTracer, Exception, ExceptionConfig, ExceptionEnricher};
use opentelemetry_sdk::logs::{LogExporter, SdkLoggerProvider};
use opentelemetry_sdk::trace::{SdkTracerProvider, SpanExporter};
use opentelemetry_sdk::Resource;
use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

static DEFAULT_ENRICHER: OnceLock<ExceptionEnricher> = OnceLock::new();

/// Record `err` on the active span, or on a new span named `span_name` (or
/// the error's type) when no span is active.
///
/// Uses the enricher of the first [`Middleware`] initialized in the process.
#[inline(never)]
pub fn record_exception<E: Error>(err: &E, span_name: Option<&str>) {
    DEFAULT_ENRICHER
        .get_or_init(ExceptionEnricher::default)
        .record_exception(&Exception::capture(err), span_name);
}

type TracerProviderFactory =
    Box<dyn FnOnce(&MwOptions, Resource, &ExceptionEnricher) -> SdkTracerProvider>;
type LoggerProviderFactory = Box<dyn FnOnce(&MwOptions, Resource) -> SdkLoggerProvider>;

/// Builder for [`Middleware`].
pub struct MiddlewareBuilder {
    options: MwOptions,
    exception_config: Option<ExceptionConfig>,
    tracer_provider: Option<TracerProviderFactory>,
    logger_provider: Option<LoggerProviderFactory>,
    adapters: Vec<Arc<dyn FrameworkAdapter>>,
}

impl fmt::Debug for MiddlewareBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareBuilder")
            .field("options", &self.options)
            .field("exception_config", &self.exception_config)
            .field("custom_span_exporter", &self.tracer_provider.is_some())
            .field("custom_log_exporter", &self.logger_provider.is_some())
            .field("adapters", &self.adapters)
            .finish()
    }
}

impl MiddlewareBuilder {
    /// Configure exception enrichment. Defaults to
    /// [`ExceptionConfig::default`], which reads the environment.
    pub fn with_exception_config(mut self, config: ExceptionConfig) -> Self {
        self.exception_config = Some(config);
        self
    }

    /// Export spans through `exporter` instead of OTLP.
    pub fn with_span_exporter<E>(mut self, exporter: E) -> Self
    where
        E: SpanExporter + 'static,
    {
        self.tracer_provider = Some(Box::new(move |options, resource, enricher| {
            trace::build_tracer_provider(options, resource, enricher, exporter)
        }));
        self
    }

    /// Export logs through `exporter` instead of OTLP.
    pub fn with_log_exporter<E>(mut self, exporter: E) -> Self
    where
        E: LogExporter + 'static,
    {
        self.logger_provider = Some(Box::new(move |options, resource| {
            log::build_logger_provider(options, resource, exporter)
        }));
        self
    }

    /// Forward unhandled request exceptions reported by `adapter`.
    pub fn with_framework_adapter(mut self, adapter: Arc<dyn FrameworkAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Build the providers, register them globally and install the capture
    /// points.
    ///
    /// The OTLP exporters need a Tokio runtime, so without custom exporters
    /// this must be called from within one.
    pub fn build(self) -> Result<Middleware, MiddlewareError> {
        let options = self.options;
        let config = self.exception_config.unwrap_or_default();
        let enricher = ExceptionEnricher::new(&config);
        let resource = create_resource(&options);

        let tracer_provider = if options.collect_traces {
            let provider = match self.tracer_provider {
                Some(factory) => factory(&options, resource.clone(), &enricher),
                None => trace::build_tracer_provider(
                    &options,
                    resource.clone(),
                    &enricher,
                    trace::otlp_span_exporter(&options)?,
                ),
            };
            global::set_text_map_propagator(trace::propagator(&options));
            global::set_tracer_provider(provider.clone());
            Some(provider)
        } else {
            None
        };

        let logger_provider = if options.collect_logs {
            let provider = match self.logger_provider {
                Some(factory) => factory(&options, resource.clone()),
                None => log::build_logger_provider(
                    &options,
                    resource.clone(),
                    log::otlp_log_exporter(&options)?,
                ),
            };
            log::install_tracing_bridge(&provider, options.log_level);
            Some(provider)
        } else {
            None
        };

        let mut installation = InstallationState::new(enricher.clone())
            .with_panic_capture(options.capture_panics);
        for adapter in self.adapters {
            installation.register_adapter(adapter);
        }
        installation.install();

        let _ = DEFAULT_ENRICHER.set(enricher.clone());

        otel_info!(
            name: "Middleware.Initialized",
            service_name = options.service_name.as_str(),
            target = options.target.as_str(),
            collect_traces = options.collect_traces,
            collect_logs = options.collect_logs
        );

        Ok(Middleware {
            options,
            resource,
            enricher,
            tracer_provider,
            logger_provider,
            installation: Mutex::new(installation),
            is_shutdown: AtomicBool::new(false),
        })
    }
}

/// A running distribution.
///
/// Dropping it shuts it down.
#[derive(Debug)]
pub struct Middleware {
    options: MwOptions,
    resource: Resource,
    enricher: ExceptionEnricher,
    tracer_provider: Option<SdkTracerProvider>,
    logger_provider: Option<SdkLoggerProvider>,
    installation: Mutex<InstallationState>,
    is_shutdown: AtomicBool,
}

impl Middleware {
    /// Initialize with `options` and the OTLP exporters.
    pub fn init(options: MwOptions) -> Result<Self, MiddlewareError> {
        Middleware::builder(options).build()
    }

    /// Customize the distribution before building it.
    pub fn builder(options: MwOptions) -> MiddlewareBuilder {
        MiddlewareBuilder {
            options,
            exception_config: None,
            tracer_provider: None,
            logger_provider: None,
            adapters: Vec::new(),
        }
    }

    /// The resolved options.
    pub fn options(&self) -> &MwOptions {
        &self.options
    }

    /// The resource attached to spans and logs.
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// The enricher shared by every capture point.
    pub fn enricher(&self) -> &ExceptionEnricher {
        &self.enricher
    }

    /// The tracer provider, unless traces are not collected.
    pub fn tracer_provider(&self) -> Option<&SdkTracerProvider> {
        self.tracer_provider.as_ref()
    }

    /// The logger provider, unless logs are not collected.
    pub fn logger_provider(&self) -> Option<&SdkLoggerProvider> {
        self.logger_provider.as_ref()
    }

    /// A global tracer whose spans enrich errors passed to `record_error`.
    ///
    /// Spans made current through a [`Context`](opentelemetry::Context) are
    /// enriched through
    /// [`ExceptionContextExt`](opentelemetry_exception::ExceptionContextExt).
    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> EnrichedTracer<BoxedTracer> {
        EnrichedTracer::new(global::tracer(name), self.enricher.clone())
    }

    /// Record `exception` on the active span, or on a new span named
    /// `span_name` (or the exception's type) when no span is active.
    pub fn record_exception(&self, exception: &Exception, span_name: Option<&str>) {
        self.enricher.record_exception(exception, span_name);
    }

    /// Forward unhandled request exceptions reported by `adapter`.
    pub fn register_adapter(&self, adapter: Arc<dyn FrameworkAdapter>) {
        self.installation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register_adapter(adapter);
    }

    /// Export everything buffered so far.
    pub fn force_flush(&self) -> Result<(), MiddlewareError> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(MiddlewareError::AlreadyShutdown);
        }
        if let Some(provider) = &self.tracer_provider {
            provider
                .force_flush()
                .map_err(|source| MiddlewareError::Provider {
                    signal: "tracer",
                    source,
                })?;
        }
        if let Some(provider) = &self.logger_provider {
            provider
                .force_flush()
                .map_err(|source| MiddlewareError::Provider {
                    signal: "logger",
                    source,
                })?;
        }
        Ok(())
    }

    /// Uninstall the capture points, then flush and shut down the providers.
    ///
    /// Only the first call does anything; later calls return
    /// [`MiddlewareError::AlreadyShutdown`].
    pub fn shutdown(&self) -> Result<(), MiddlewareError> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return Err(MiddlewareError::AlreadyShutdown);
        }

        self.installation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .uninstall();

        let traces = self.tracer_provider.as_ref().map(|provider| {
            provider
                .shutdown()
                .map_err(|source| MiddlewareError::Provider {
                    signal: "tracer",
                    source,
                })
        });
        let logs = self.logger_provider.as_ref().map(|provider| {
            provider
                .shutdown()
                .map_err(|source| MiddlewareError::Provider {
                    signal: "logger",
                    source,
                })
        });

        otel_info!(name: "Middleware.Shutdown");
        traces.transpose()?;
        logs.transpose()?;
        Ok(())
    }
}

impl Drop for Middleware {
    fn drop(&mut self) {
        if !self.is_shutdown.load(Ordering::Acquire) {
            let _ = self.shutdown();
        }
    }
}
