//! Errors returned while bootstrapping the distribution.
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;

/// Errors returned by [`crate::Middleware`] and its builder.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MiddlewareError {
    /// An OTLP exporter could not be created.
    #[error("failed to build {signal} exporter: {source}")]
    ExporterBuild {
        /// The signal the exporter was built for.
        signal: &'static str,
        /// The exporter error.
        #[source]
        source: ExporterBuildError,
    },

    /// An option could not be parsed.
    #[error("invalid value for {name}: {reason}")]
    InvalidOption {
        /// The option or environment variable name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A framework adapter failed to subscribe to its request-exception
    /// notification.
    #[error("framework adapter {adapter} failed to subscribe: {reason}")]
    AdapterSubscribe {
        /// Name of the adapter.
        adapter: String,
        /// Why subscribing failed.
        reason: String,
    },

    /// A provider failed to flush or shut down.
    #[error("{signal} provider: {source}")]
    Provider {
        /// The provider's signal.
        signal: &'static str,
        /// The SDK error.
        #[source]
        source: OTelSdkError,
    },

    /// The distribution was already shut down.
    #[error("middleware already shut down")]
    AlreadyShutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = MiddlewareError::InvalidOption {
            name: "MW_CUSTOM_RESOURCE_ATTRIBUTES",
            reason: "expected `key=value`, found `oops`".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for MW_CUSTOM_RESOURCE_ATTRIBUTES: expected `key=value`, found `oops`"
        );
        assert_eq!(
            MiddlewareError::AlreadyShutdown.to_string(),
            "middleware already shut down"
        );
    }
}
