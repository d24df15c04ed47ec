use crate::error::MiddlewareError;
use crate::options::{MwOptions, MW_CUSTOM_RESOURCE_ATTRIBUTES};
use opentelemetry::{otel_warn, KeyValue};
use opentelemetry_sdk::Resource;

/// Version of this distribution, sent as `mw.sdk.version`.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the resource describing this service.
///
/// On top of the SDK's default detectors (`OTEL_RESOURCE_ATTRIBUTES`,
/// `OTEL_SERVICE_NAME`, telemetry SDK attributes) it carries the service name
/// and the attributes Middleware uses to classify the service. Custom
/// attributes are parsed from `key=value,key2=value2`; if any entry is
/// malformed all of them are skipped.
pub fn create_resource(options: &MwOptions) -> Resource {
    let mut attributes = vec![
        KeyValue::new("mw.sdk.version", SDK_VERSION),
        KeyValue::new("mw.app.lang", "rust"),
        KeyValue::new("runtime.metrics.rust", "true"),
    ];
    if options.is_serverless() {
        attributes.push(KeyValue::new("mw.serverless", "true"));
    }
    if let Some(token) = &options.access_token {
        attributes.push(KeyValue::new("mw.account_key", token.clone()));
    }
    if let Some(project) = &options.project_name {
        attributes.push(KeyValue::new("project.name", project.clone()));
    }
    if let Some(custom) = &options.custom_resource_attributes {
        match parse_custom_attributes(custom) {
            Ok(custom) => attributes.extend(custom),
            Err(err) => {
                otel_warn!(
                    name: "Resource.CustomAttributesSkipped",
                    message = "Skipped custom attributes: expected format `abcd=1234,wxyz=5678`",
                    reason = err.to_string()
                );
            }
        }
    }

    Resource::builder()
        .with_service_name(options.service_name.clone())
        .with_attributes(attributes)
        .build()
}

fn parse_custom_attributes(input: &str) -> Result<Vec<KeyValue>, MiddlewareError> {
    input
        .split(',')
        .map(|item| {
            let mut parts = item.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => {
                    Ok(KeyValue::new(key.trim().to_string(), value.trim().to_string()))
                }
                _ => Err(MiddlewareError::InvalidOption {
                    name: MW_CUSTOM_RESOURCE_ATTRIBUTES,
                    reason: format!("expected `key=value`, found `{}`", item.trim()),
                }),
            }
        })
        .collect()
}
