//! Distribution options and their environment bindings.
//!
//! Every option can be set in code through [`MwOptionsBuilder`] or through an
//! environment variable. A set environment variable wins over the value passed
//! in code.
use opentelemetry::otel_warn;
use std::env;
use tracing::level_filters::LevelFilter;

/// API key of the Middleware account.
pub const MW_API_KEY: &str = "MW_API_KEY";
/// Service name, read after `OTEL_SERVICE_NAME`.
pub const MW_SERVICE_NAME: &str = "MW_SERVICE_NAME";
/// Host of the Middleware agent.
pub const MW_AGENT_SERVICE: &str = "MW_AGENT_SERVICE";
/// Collector endpoint, read after `OTEL_EXPORTER_OTLP_ENDPOINT`.
pub const MW_TARGET: &str = "MW_TARGET";
/// Extra resource attributes as `key=value,key2=value2`.
pub const MW_CUSTOM_RESOURCE_ATTRIBUTES: &str = "MW_CUSTOM_RESOURCE_ATTRIBUTES";
/// Whether spans are exported.
pub const MW_APM_COLLECT_TRACES: &str = "MW_APM_COLLECT_TRACES";
/// Whether logs are exported.
pub const MW_APM_COLLECT_LOGS: &str = "MW_APM_COLLECT_LOGS";
/// Whether spans carry the stack they were started from.
pub const MW_APM_COLLECT_PROFILING: &str = "MW_APM_COLLECT_PROFILING";
/// Whether panics are recorded as exceptions.
pub const MW_CAPTURE_PANICS: &str = "MW_CAPTURE_PANICS";
/// Propagators, read after `OTEL_PROPAGATORS`.
pub const MW_PROPAGATORS: &str = "MW_PROPAGATORS";
/// Whether spans and logs are also printed to stdout.
pub const MW_CONSOLE_EXPORTER: &str = "MW_CONSOLE_EXPORTER";
/// Project the service belongs to.
pub const MW_PROJECT_NAME: &str = "MW_PROJECT_NAME";
/// Ratio of traces sampled, between 0 and 1.
pub const MW_SAMPLE_RATE: &str = "MW_SAMPLE_RATE";
/// Minimum level of forwarded logs, read after `OTEL_LOG_LEVEL`.
pub const MW_LOG_LEVEL: &str = "MW_LOG_LEVEL";

/// Standard OpenTelemetry service name.
pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Standard OpenTelemetry collector endpoint.
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Standard OpenTelemetry propagators.
pub const OTEL_PROPAGATORS: &str = "OTEL_PROPAGATORS";
/// Standard OpenTelemetry log level.
pub const OTEL_LOG_LEVEL: &str = "OTEL_LOG_LEVEL";

/// Collector endpoint used when none is configured.
pub const DEFAULT_TARGET: &str = "http://localhost:9319";
/// Port of the Middleware agent.
pub const DEFAULT_PORT: u16 = 9319;
/// Service name used when none is configured.
pub const DEFAULT_SERVICE_NAME: &str = "unknown_service:rust";
/// Propagators used when none are configured.
pub const DEFAULT_PROPAGATORS: &str = "b3";
/// Sample every trace by default.
pub const DEFAULT_SAMPLE_RATE: f64 = 1.0;

#[cfg(test)]
pub(crate) const ALL_ENV_VARS: &[&str] = &[
    MW_API_KEY,
    MW_SERVICE_NAME,
    MW_AGENT_SERVICE,
    MW_TARGET,
    MW_CUSTOM_RESOURCE_ATTRIBUTES,
    MW_APM_COLLECT_TRACES,
    MW_APM_COLLECT_LOGS,
    MW_APM_COLLECT_PROFILING,
    MW_CAPTURE_PANICS,
    MW_PROPAGATORS,
    MW_CONSOLE_EXPORTER,
    MW_PROJECT_NAME,
    MW_SAMPLE_RATE,
    MW_LOG_LEVEL,
    OTEL_SERVICE_NAME,
    OTEL_EXPORTER_OTLP_ENDPOINT,
    OTEL_PROPAGATORS,
    OTEL_LOG_LEVEL,
];

/// Run `f` with every option variable unset except those in `set`.
#[cfg(test)]
pub(crate) fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
    let vars: Vec<(&str, Option<&str>)> = ALL_ENV_VARS
        .iter()
        .map(|name| {
            let value = set
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| *value);
            (*name, value)
        })
        .collect();
    temp_env::with_vars(vars, f);
}

/// Resolved distribution options.
///
/// Use [`MwOptions::builder`] to set values in code. [`MwOptions::default`]
/// reads the environment only.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct MwOptions {
    /// Account key sent as the `mw.account_key` resource attribute.
    pub access_token: Option<String>,
    /// Value of `service.name`.
    pub service_name: String,
    /// Export spans.
    pub collect_traces: bool,
    /// Export logs.
    pub collect_logs: bool,
    /// Attach the live stack and surrounding source to spans at start.
    pub collect_profiling: bool,
    /// Record panics on the active span.
    pub capture_panics: bool,
    /// Minimum level of logs forwarded from `tracing`.
    pub log_level: LevelFilter,
    /// Host of the Middleware agent, if configured.
    pub mw_agent_service: Option<String>,
    /// OTLP/gRPC collector endpoint.
    pub target: String,
    /// Extra resource attributes, unparsed.
    pub custom_resource_attributes: Option<String>,
    /// Comma separated propagator names.
    pub otel_propagators: String,
    /// Also print spans and logs to stdout.
    pub console_exporter: bool,
    /// Value of `project.name`.
    pub project_name: Option<String>,
    /// Ratio of traces sampled, between 0 and 1.
    pub sample_rate: f64,
}

impl Default for MwOptions {
    fn default() -> Self {
        MwOptionsBuilder::default().build()
    }
}

impl MwOptions {
    /// Set options in code. Environment variables still take precedence.
    pub fn builder() -> MwOptionsBuilder {
        MwOptionsBuilder::default()
    }

    /// Whether the collector is reached over TLS, which is how serverless
    /// deployments send data straight to Middleware.
    pub fn is_serverless(&self) -> bool {
        self.target.contains("https")
    }

    /// Propagator names, lowercased and trimmed.
    pub fn propagators(&self) -> Vec<String> {
        self.otel_propagators
            .split(',')
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// Builder for [`MwOptions`].
#[derive(Clone, Debug, Default)]
pub struct MwOptionsBuilder {
    access_token: Option<String>,
    service_name: Option<String>,
    collect_traces: Option<bool>,
    collect_logs: Option<bool>,
    collect_profiling: Option<bool>,
    capture_panics: Option<bool>,
    log_level: Option<LevelFilter>,
    mw_agent_service: Option<String>,
    target: Option<String>,
    custom_resource_attributes: Option<String>,
    otel_propagators: Option<String>,
    console_exporter: Option<bool>,
    project_name: Option<String>,
    sample_rate: Option<f64>,
}

impl MwOptionsBuilder {
    /// Set the account key. Overridden by `MW_API_KEY`.
    pub fn with_access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    /// Set the service name. Overridden by `OTEL_SERVICE_NAME` and
    /// `MW_SERVICE_NAME`.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Export spans. Overridden by `MW_APM_COLLECT_TRACES`. Defaults to true.
    pub fn with_collect_traces(mut self, collect: bool) -> Self {
        self.collect_traces = Some(collect);
        self
    }

    /// Export logs. Overridden by `MW_APM_COLLECT_LOGS`. Defaults to true.
    pub fn with_collect_logs(mut self, collect: bool) -> Self {
        self.collect_logs = Some(collect);
        self
    }

    /// Attach start stacks to spans. Overridden by `MW_APM_COLLECT_PROFILING`.
    /// Defaults to false.
    pub fn with_collect_profiling(mut self, collect: bool) -> Self {
        self.collect_profiling = Some(collect);
        self
    }

    /// Record panics. Overridden by `MW_CAPTURE_PANICS`. Defaults to true.
    pub fn with_capture_panics(mut self, capture: bool) -> Self {
        self.capture_panics = Some(capture);
        self
    }

    /// Minimum forwarded log level. Overridden by `OTEL_LOG_LEVEL` and
    /// `MW_LOG_LEVEL`. Defaults to `INFO`.
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }

    /// Host of the Middleware agent. Unless the target is https, the target
    /// becomes `http://{agent}:9319`. Overridden by `MW_AGENT_SERVICE`.
    pub fn with_mw_agent_service(mut self, agent: impl Into<String>) -> Self {
        self.mw_agent_service = Some(agent.into());
        self
    }

    /// Collector endpoint. Overridden by `OTEL_EXPORTER_OTLP_ENDPOINT` and
    /// `MW_TARGET`.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Extra resource attributes as `key=value,key2=value2`. Overridden by
    /// `MW_CUSTOM_RESOURCE_ATTRIBUTES`.
    pub fn with_custom_resource_attributes(mut self, attributes: impl Into<String>) -> Self {
        self.custom_resource_attributes = Some(attributes.into());
        self
    }

    /// Comma separated propagators. Overridden by `OTEL_PROPAGATORS` and
    /// `MW_PROPAGATORS`.
    pub fn with_otel_propagators(mut self, propagators: impl Into<String>) -> Self {
        self.otel_propagators = Some(propagators.into());
        self
    }

    /// Print spans and logs to stdout. Overridden by `MW_CONSOLE_EXPORTER`.
    pub fn with_console_exporter(mut self, console: bool) -> Self {
        self.console_exporter = Some(console);
        self
    }

    /// Project the service belongs to. Overridden by `MW_PROJECT_NAME`.
    pub fn with_project_name(mut self, project: impl Into<String>) -> Self {
        self.project_name = Some(project.into());
        self
    }

    /// Ratio of traces sampled. Values outside `0..=1` are clamped.
    /// Overridden by `MW_SAMPLE_RATE`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    /// Resolve the options against the environment.
    pub fn build(self) -> MwOptions {
        let service_name = non_empty_env(OTEL_SERVICE_NAME)
            .or_else(|| non_empty_env(MW_SERVICE_NAME))
            .or(self.service_name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| {
                otel_warn!(
                    name: "MwOptions.MissingServiceName",
                    message = "Missing service name. Specify either OTEL_SERVICE_NAME/MW_SERVICE_NAME environment variable or the service name option. If left unset, this will show up in middleware as unknown_service:rust"
                );
                DEFAULT_SERVICE_NAME.to_string()
            });

        let log_level = match non_empty_env(OTEL_LOG_LEVEL).or_else(|| non_empty_env(MW_LOG_LEVEL))
        {
            Some(value) => parse_log_level(&value).unwrap_or_else(|| {
                otel_warn!(
                    name: "MwOptions.InvalidLogLevel",
                    log_level = value.as_str()
                );
                self.log_level.unwrap_or(LevelFilter::INFO)
            }),
            None => self.log_level.unwrap_or(LevelFilter::INFO),
        };

        let mw_agent_service = non_empty_env(MW_AGENT_SERVICE).or(self.mw_agent_service);
        let mut target = non_empty_env(OTEL_EXPORTER_OTLP_ENDPOINT)
            .or_else(|| non_empty_env(MW_TARGET))
            .or(self.target)
            .unwrap_or_else(|| DEFAULT_TARGET.to_string());
        if !target.contains("https") {
            if let Some(agent) = &mw_agent_service {
                target = format!("http://{agent}:{DEFAULT_PORT}");
            }
        }

        MwOptions {
            access_token: non_empty_env(MW_API_KEY).or(self.access_token),
            service_name,
            collect_traces: parse_bool(MW_APM_COLLECT_TRACES, self.collect_traces.unwrap_or(true)),
            collect_logs: parse_bool(MW_APM_COLLECT_LOGS, self.collect_logs.unwrap_or(true)),
            collect_profiling: parse_bool(
                MW_APM_COLLECT_PROFILING,
                self.collect_profiling.unwrap_or(false),
            ),
            capture_panics: parse_bool(MW_CAPTURE_PANICS, self.capture_panics.unwrap_or(true)),
            log_level,
            mw_agent_service,
            target,
            custom_resource_attributes: non_empty_env(MW_CUSTOM_RESOURCE_ATTRIBUTES)
                .or(self.custom_resource_attributes),
            otel_propagators: non_empty_env(OTEL_PROPAGATORS)
                .or_else(|| non_empty_env(MW_PROPAGATORS))
                .or(self.otel_propagators)
                .unwrap_or_else(|| DEFAULT_PROPAGATORS.to_string()),
            console_exporter: parse_bool(
                MW_CONSOLE_EXPORTER,
                self.console_exporter.unwrap_or(false),
            ),
            project_name: non_empty_env(MW_PROJECT_NAME).or(self.project_name),
            sample_rate: parse_sample_rate(self.sample_rate),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `name` parsed as a boolean, or `default` when unset or invalid.
fn parse_bool(name: &'static str, default: bool) -> bool {
    let Some(value) = non_empty_env(name) else {
        return default;
    };
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            otel_warn!(
                name: "MwOptions.InvalidBool",
                variable = name,
                value = value.as_str()
            );
            default
        }
    }
}

pub(crate) fn parse_log_level(value: &str) -> Option<LevelFilter> {
    match value.trim().to_ascii_uppercase().as_str() {
        "NOTSET" | "TRACE" => Some(LevelFilter::TRACE),
        "DEBUG" => Some(LevelFilter::DEBUG),
        "INFO" => Some(LevelFilter::INFO),
        "WARN" | "WARNING" => Some(LevelFilter::WARN),
        "ERROR" | "CRITICAL" | "FATAL" => Some(LevelFilter::ERROR),
        "OFF" => Some(LevelFilter::OFF),
        _ => None,
    }
}

fn parse_sample_rate(passed: Option<f64>) -> f64 {
    let rate = match non_empty_env(MW_SAMPLE_RATE) {
        Some(value) => match value.parse::<f64>() {
            Ok(rate) => Some(rate),
            Err(_) => {
                otel_warn!(
                    name: "MwOptions.InvalidSampleRate",
                    value = value.as_str()
                );
                passed
            }
        },
        None => passed,
    };

    match rate {
        Some(rate) if rate.is_nan() => DEFAULT_SAMPLE_RATE,
        Some(rate) if !(0.0..=1.0).contains(&rate) => {
            otel_warn!(
                name: "MwOptions.SampleRateOutOfRange",
                sample_rate = rate
            );
            rate.clamp(0.0, 1.0)
        }
        Some(rate) => rate,
        None => DEFAULT_SAMPLE_RATE,
    }
}
