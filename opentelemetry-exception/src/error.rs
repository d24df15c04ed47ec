//! Failures encountered while enriching an exception.
//!
//! None of these reach callers of the public API: enrichment degrades to a
//! smaller event instead, and the error is reported through internal logs.
use thiserror::Error;

/// Reasons frame extraction or event building fell back to a degraded result.
#[derive(Error, Debug)]
#[non_exhaustive]
pub(crate) enum EnrichmentError {
    /// The source file could not be read.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The source file is larger than the configured read limit.
    #[error("source file exceeds {limit} bytes ({size} bytes)")]
    SourceTooLarge { size: u64, limit: u64 },

    /// The frame list could not be serialized.
    #[error("failed to serialize stack details: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = EnrichmentError::SourceTooLarge {
            size: 2048,
            limit: 1024,
        };
        assert_eq!(
            err.to_string(),
            "source file exceeds 1024 bytes (2048 bytes)"
        );

        let err: EnrichmentError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "No such file").into();
        assert_eq!(err.to_string(), "No such file");
    }
}
