//! Load tests driven by an external load generator.
//!
//! The generator itself is a separate process (see [`Wrk2`]). [`LoadTestDriver`] invokes it with
//! the configured [`LoadParams`] and repeats the whole test until the report contains an average
//! latency.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LoadParams;
use crate::error::LoadTestError;

mod wrk2;

pub use wrk2::{ReportParser, Wrk2, command_args};

/// A single point of the latency distribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyPercentile {
    /// The percentile in the range `0..=100`.
    pub percentile: f64,
    /// Latency at this percentile in milliseconds.
    pub latency_ms: f64,
}

/// Aggregate statistics of one load test run.
///
/// Every field is optional since generators may omit parts of their report. A run without an
/// average latency is not usable and gets repeated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadStatistics {
    /// Average request latency in milliseconds.
    pub avg_latency_ms: Option<f64>,
    /// Standard deviation of the request latency in milliseconds.
    pub stdev_latency_ms: Option<f64>,
    /// Maximum request latency in milliseconds.
    pub max_latency_ms: Option<f64>,
    /// Average requests per second of a single generator thread.
    pub thread_requests_per_second: Option<f64>,
    /// Latency distribution, ordered by percentile.
    pub percentiles: Vec<LatencyPercentile>,
    /// Number of completed requests.
    pub total_requests: Option<u64>,
    /// Bytes read over the whole run.
    pub bytes_read: Option<u64>,
    /// Overall throughput in requests per second.
    pub requests_per_second: Option<f64>,
    /// Overall transfer rate in bytes per second.
    pub transfer_per_second: Option<f64>,
    /// Connect, read, write and timeout errors combined.
    pub socket_errors: u64,
    /// Responses with a status other than 2xx or 3xx.
    pub non_success_responses: u64,
}

impl LoadStatistics {
    /// Returns `true` if the statistics contain an average latency.
    pub fn is_usable(&self) -> bool {
        self.avg_latency_ms.is_some()
    }

    /// Returns the latency at the given percentile, if reported.
    pub fn percentile(&self, percentile: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|p| (p.percentile - percentile).abs() < f64::EPSILON)
            .map(|p| p.latency_ms)
    }
}

/// An external load generator.
#[async_trait::async_trait]
pub trait LoadGenerator: fmt::Debug + Send + Sync + 'static {
    /// Runs a single load test against `url` and returns the parsed report.
    async fn run(&self, url: &str, params: &LoadParams) -> Result<LoadStatistics, LoadTestError>;
}

/// Result of [`LoadTestDriver::run_until_usable`].
#[derive(Clone, Debug, PartialEq)]
pub struct LoadTestOutcome {
    /// Statistics of the first usable run.
    pub statistics: LoadStatistics,
    /// Number of runs that had to be repeated.
    pub repeats: u32,
}

/// Runs load tests with fixed parameters.
#[derive(Clone, Debug)]
pub struct LoadTestDriver {
    generator: Arc<dyn LoadGenerator>,
    params: LoadParams,
    retry_interval: Duration,
}

impl LoadTestDriver {
    /// Creates a new driver.
    pub fn new(generator: Arc<dyn LoadGenerator>, params: LoadParams, retry_interval: Duration) -> Self {
        Self {
            generator,
            params,
            retry_interval,
        }
    }

    /// Runs a single load test.
    pub async fn run(&self, url: &str) -> Result<LoadStatistics, LoadTestError> {
        tracing::debug!(url, params = ?self.params, "running load test");
        self.generator.run(url, &self.params).await
    }

    /// Runs load tests until one produces an average latency.
    ///
    /// Failed and incomplete runs are repeated without bound, logging a warning each time.
    pub async fn run_until_usable(&self, url: &str) -> LoadTestOutcome {
        let mut repeats = 0;
        loop {
            match self.run(url).await {
                Ok(statistics) if statistics.is_usable() => {
                    return LoadTestOutcome {
                        statistics,
                        repeats,
                    };
                }
                Ok(_) => {
                    tracing::warn!(url, "load test reported no average latency, repeating");
                }
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        url,
                        "load test failed, repeating"
                    );
                }
            }

            repeats += 1;
            merni::counter!("load_test.repeats": 1);
            if !self.retry_interval.is_zero() {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
    }
}
