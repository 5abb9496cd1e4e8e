//! Error types of the benchmark engine.

use std::process::ExitStatus;

use thiserror::Error;

/// An invalid run parameter, detected before any benchmark task starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A parameter that must be strictly positive is zero.
    #[error("`{0}` must be greater than 0")]
    NotPositive(&'static str),

    /// A duration passed on to the load generator has a fractional part.
    #[error("`{0}` must be a whole number of seconds")]
    NotWholeSeconds(&'static str),

    /// The discard count does not leave any warm sample to average.
    #[error("`warm_samples` ({warm_samples}) must be greater than `discard_count` ({discard_count})")]
    DiscardExceedsSamples {
        /// Number of warm samples that are dropped.
        discard_count: usize,
        /// Number of warm samples taken per estimate.
        warm_samples: usize,
    },

    /// There is nothing to benchmark.
    #[error("no benchmark targets configured")]
    NoTargets,

    /// Two targets share the same name.
    #[error("duplicate benchmark target `{0}`")]
    DuplicateTarget(String),
}

/// Failure of a single cold start estimate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EstimateError {
    /// The probe measuring the cold invocation failed fatally.
    #[error("cold start probe failed after {retries} retries")]
    ColdProbe {
        /// Retries caused by an unavailable provider before the failure.
        retries: u32,
    },

    /// One of the warm probes failed fatally.
    #[error("warm start probe {index} failed after {retries} retries")]
    WarmProbe {
        /// Zero-based index of the failing warm sample.
        index: usize,
        /// Retries caused by an unavailable provider before the failure.
        retries: u32,
    },
}

impl EstimateError {
    /// Number of retries caused by an unavailable provider before the estimate failed.
    pub fn retries(&self) -> u32 {
        match *self {
            EstimateError::ColdProbe { retries } => retries,
            EstimateError::WarmProbe { retries, .. } => retries,
        }
    }
}

/// Failure of a single load test run.
#[derive(Debug, Error)]
pub enum LoadTestError {
    /// The load generator could not be spawned or its output could not be read.
    #[error("failed to run load generator: {0}")]
    Io(#[from] std::io::Error),

    /// The load generator exited unsuccessfully.
    #[error("load generator exited with {0}")]
    Exit(ExitStatus),

    /// No load generator command is configured.
    #[error("load generator command is empty")]
    EmptyCommand,
}

/// Failure to record a measurement in a metrics sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The request to the metrics store failed.
    #[error("request to metrics store failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The metrics store rejected the write.
    #[error("metrics store rejected write with status {status}: {body}")]
    Rejected {
        /// HTTP status returned by the store.
        status: reqwest::StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },
}
