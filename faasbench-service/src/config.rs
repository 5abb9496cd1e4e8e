//! Parameters of a benchmark run.
//!
//! A [`RunConfig`] is assembled once before the orchestration starts, validated with
//! [`RunConfig::validate`], and is then shared read-only by all target tasks.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::target::BenchmarkTarget;

/// Time the providers need to recycle idle instances.
///
/// Value determined in "Peeking Behind the Curtains of Serverless Platforms" (USENIX ATC '18).
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

/// Upper bound for a single probe request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Warm samples dropped after a cold invocation.
pub const DEFAULT_DISCARD_COUNT: usize = 5;

/// Warm samples taken per cold start estimate.
pub const DEFAULT_WARM_SAMPLES: usize = 10;

/// Parameters handed to the load generator for a single load test.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadParams {
    /// Number of open HTTP connections.
    pub concurrency: u32,
    /// Number of load generator threads.
    pub threads: u32,
    /// Duration of the load test.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Constant throughput in requests per second.
    pub requests_per_second: u32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            concurrency: 10,
            threads: 2,
            duration: Duration::from_secs(60),
            requests_per_second: 100,
        }
    }
}

/// Per-run benchmark parameters.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// Parameters of every load test.
    pub load: LoadParams,

    /// Pause before every cycle, giving the provider time to reclaim idle instances.
    ///
    /// # Default
    ///
    /// 2 hours
    #[serde(with = "humantime_serde")]
    pub sleep_interval: Duration,

    /// Connect and read timeout of every probe request.
    ///
    /// # Default
    ///
    /// 30 minutes
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Number of cycles per target. `None` runs until shutdown.
    pub iterations: Option<u32>,

    /// Number of leading warm samples ignored in every estimate.
    ///
    /// Right after a cold invocation the provider may still route requests to fresh instances.
    pub discard_count: usize,

    /// Number of warm samples taken after the cold probe. Must exceed `discard_count`.
    pub warm_samples: usize,

    /// Pause between two attempts of an operation that is retried without bound.
    ///
    /// Zero retries immediately.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            load: LoadParams::default(),
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            iterations: None,
            discard_count: DEFAULT_DISCARD_COUNT,
            warm_samples: DEFAULT_WARM_SAMPLES,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl RunConfig {
    /// Checks all parameters, reporting the first invalid one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("load.concurrency", self.load.concurrency > 0),
            ("load.threads", self.load.threads > 0),
            ("load.duration", self.load.duration.as_secs() > 0),
            ("load.requests_per_second", self.load.requests_per_second > 0),
            ("sleep_interval", !self.sleep_interval.is_zero()),
            ("request_timeout", !self.request_timeout.is_zero()),
            ("iterations", self.iterations != Some(0)),
            ("warm_samples", self.warm_samples > 0),
        ];
        if let Some((name, _)) = positive.into_iter().find(|(_, valid)| !valid) {
            return Err(ConfigError::NotPositive(name));
        }

        // wrk2 only takes whole seconds
        if self.load.duration.subsec_nanos() != 0 {
            return Err(ConfigError::NotWholeSeconds("load.duration"));
        }

        if self.discard_count >= self.warm_samples {
            return Err(ConfigError::DiscardExceedsSamples {
                discard_count: self.discard_count,
                warm_samples: self.warm_samples,
            });
        }

        Ok(())
    }

    /// Rough wall-clock duration of a bounded run, `None` when running forever.
    ///
    /// Every cycle sleeps once and then runs one load test per target, of which at most
    /// `min_concurrency` run at the same time. Cold start estimates are not accounted for.
    pub fn estimated_duration(&self, targets: usize, min_concurrency: usize) -> Option<Duration> {
        let iterations = self.iterations?;
        let load = self.load.duration.as_secs_f64() * targets as f64
            / min_concurrency.max(1) as f64;
        let cycle = self.sleep_interval.as_secs_f64() + load;
        Some(Duration::from_secs_f64(cycle * f64::from(iterations)))
    }
}

/// Checks that there is at least one target and that all target names are unique.
pub fn validate_targets(targets: &[BenchmarkTarget]) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::NoTargets);
    }

    let mut seen = HashSet::new();
    for target in targets {
        if !seen.insert(target.name.as_str()) {
            return Err(ConfigError::DuplicateTarget(target.name.clone()));
        }
    }

    Ok(())
}
