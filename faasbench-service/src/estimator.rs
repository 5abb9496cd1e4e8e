//! Estimation of the latency penalty caused by a cold start.
//!
//! An estimate takes one sample right after the function has been idle long enough to be
//! reclaimed by the provider, followed by a series of warm samples. The first few warm samples
//! are discarded, since the provider can still be settling its instance bookkeeping right after
//! a cold invocation. The cost is the difference between the cold sample and the average of the
//! remaining warm samples, floored at zero.
//!
//! Samples reporting a temporarily unavailable provider are retried without bound.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RunConfig;
use crate::error::EstimateError;
use crate::probe::{LatencyProbe, LatencySample};

/// Sampling policy of a [`ColdStartEstimator`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SamplingPolicy {
    /// Timeout of every single probe.
    pub request_timeout: Duration,
    /// Leading warm samples to ignore. Must be less than `warm_samples`.
    pub discard_count: usize,
    /// Warm samples taken after the cold one.
    pub warm_samples: usize,
    /// Pause before retrying an unavailable endpoint.
    pub retry_interval: Duration,
}

impl From<&RunConfig> for SamplingPolicy {
    fn from(config: &RunConfig) -> Self {
        Self {
            request_timeout: config.request_timeout,
            discard_count: config.discard_count,
            warm_samples: config.warm_samples,
            retry_interval: config.retry_interval,
        }
    }
}

/// Result of a successful estimate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ColdStartCost {
    /// Latency of the first request after the idle period.
    pub cold: Duration,
    /// Average latency of the warm samples that were kept.
    pub warm_average: Duration,
    /// Number of retries caused by an unavailable provider.
    pub retries: u32,
}

impl ColdStartCost {
    /// The latency attributable to the cold start, never negative.
    ///
    /// A warm average above the cold sample means no cold start was observed, which yields zero.
    pub fn cost(&self) -> Duration {
        self.cold.saturating_sub(self.warm_average)
    }

    /// [`cost`](Self::cost) in fractional milliseconds.
    pub fn cost_ms(&self) -> f64 {
        self.cost().as_secs_f64() * 1000.0
    }
}

/// Computes [`ColdStartCost`]s using a [`LatencyProbe`].
#[derive(Clone, Debug)]
pub struct ColdStartEstimator {
    probe: Arc<dyn LatencyProbe>,
    policy: SamplingPolicy,
}

impl ColdStartEstimator {
    /// Creates a new estimator.
    pub fn new(probe: Arc<dyn LatencyProbe>, policy: SamplingPolicy) -> Self {
        Self { probe, policy }
    }

    /// Estimates the cold start cost of the endpoint at `url`.
    ///
    /// The first probe is assumed to hit a cold instance, so callers must make sure the
    /// function has been idle for long enough.
    pub async fn estimate(&self, url: &str) -> Result<ColdStartCost, EstimateError> {
        let mut retries = 0;

        let Some(cold) = self.sample(url, &mut retries).await else {
            return Err(EstimateError::ColdProbe { retries });
        };

        let mut kept = Vec::with_capacity(self.policy.warm_samples);
        for index in 0..self.policy.warm_samples {
            let Some(warm) = self.sample(url, &mut retries).await else {
                return Err(EstimateError::WarmProbe { index, retries });
            };

            if index >= self.policy.discard_count {
                kept.push(warm);
            }
        }

        // validated to be non-empty, guard against a zero division anyway
        let warm_average = match kept.len() {
            0 => Duration::ZERO,
            len => kept.iter().sum::<Duration>() / len as u32,
        };

        let cost = ColdStartCost {
            cold,
            warm_average,
            retries,
        };
        tracing::debug!(
            url,
            cold = ?cost.cold,
            warm_average = ?cost.warm_average,
            "estimated cold start cost"
        );

        Ok(cost)
    }

    /// Probes until the result is not [`LatencySample::Unavailable`].
    async fn sample(&self, url: &str, retries: &mut u32) -> Option<Duration> {
        loop {
            match self.probe.measure(url, self.policy.request_timeout).await {
                LatencySample::Latency(latency) => return Some(latency),
                LatencySample::Failed => return None,
                LatencySample::Unavailable => {
                    *retries += 1;
                    merni::counter!("probe.unavailable": 1);
                    tracing::warn!(url, retries = *retries, "service is unavailable, retrying");
                    if !self.policy.retry_interval.is_zero() {
                        tokio::time::sleep(self.policy.retry_interval).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::ScriptedProbe;

    use LatencySample::{Failed, Unavailable};

    fn ms(millis: u64) -> LatencySample {
        LatencySample::Latency(Duration::from_millis(millis))
    }

    fn estimator(probe: &Arc<ScriptedProbe>, discard_count: usize, warm_samples: usize) -> ColdStartEstimator {
        let policy = SamplingPolicy {
            request_timeout: Duration::from_secs(1),
            discard_count,
            warm_samples,
            retry_interval: Duration::ZERO,
        };
        ColdStartEstimator::new(probe.clone(), policy)
    }

    #[tokio::test]
    async fn subtracts_warm_average() {
        let probe = ScriptedProbe::new([ms(500), ms(100), ms(100), ms(100), ms(100), ms(100)]);

        let cost = estimator(&probe, 2, 5).estimate("http://fn").await.unwrap();

        assert_eq!(cost.cold, Duration::from_millis(500));
        assert_eq!(cost.warm_average, Duration::from_millis(100));
        assert_eq!(cost.cost(), Duration::from_millis(400));
        assert_eq!(cost.cost_ms(), 400.0);
        assert_eq!(probe.calls(), 6);
    }

    #[tokio::test]
    async fn discards_leading_warm_samples() {
        // the two slow warm samples are still settling and must not count
        let probe = ScriptedProbe::new([ms(500), ms(450), ms(300), ms(100), ms(120), ms(80)]);

        let cost = estimator(&probe, 2, 5).estimate("http://fn").await.unwrap();

        assert_eq!(cost.warm_average, Duration::from_millis(100));
        assert_eq!(cost.cost(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn clamps_to_zero() {
        let probe = ScriptedProbe::new([ms(80), ms(100), ms(100)]);

        let cost = estimator(&probe, 1, 2).estimate("http://fn").await.unwrap();

        assert_eq!(cost.cost(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_unavailable_cold_sample() {
        let probe = ScriptedProbe::new([Unavailable, Unavailable, ms(120), ms(20), ms(20)]);

        let cost = estimator(&probe, 1, 2).estimate("http://fn").await.unwrap();

        assert_eq!(cost.cold, Duration::from_millis(120));
        assert_eq!(cost.retries, 2);
        assert_eq!(cost.cost(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retries_unavailable_warm_samples_independently() {
        let probe = ScriptedProbe::new([ms(300), Unavailable, ms(50), Unavailable, ms(50)]);

        let cost = estimator(&probe, 0, 2).estimate("http://fn").await.unwrap();

        assert_eq!(cost.warm_average, Duration::from_millis(50));
        assert_eq!(cost.retries, 2);
    }

    #[tokio::test]
    async fn fatal_cold_sample_aborts() {
        let probe = ScriptedProbe::new([Unavailable, Failed]);

        let result = estimator(&probe, 1, 2).estimate("http://fn").await;

        assert_eq!(result, Err(EstimateError::ColdProbe { retries: 1 }));
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn fatal_warm_sample_aborts() {
        let probe = ScriptedProbe::new([ms(300), Unavailable, ms(50), Unavailable, Failed, ms(50)]);

        let result = estimator(&probe, 1, 3).estimate("http://fn").await;

        assert_eq!(
            result,
            Err(EstimateError::WarmProbe {
                index: 1,
                retries: 2
            })
        );
        assert_eq!(result.unwrap_err().retries(), 2);
        assert_eq!(probe.calls(), 5);
    }

    #[tokio::test]
    async fn cost_is_never_negative() {
        for cold in [0, 10, 99, 100, 101, 1000] {
            for warm in [0, 50, 100, 5000] {
                let samples = [ms(cold), ms(warm), ms(warm), ms(warm)];
                let probe = ScriptedProbe::new(samples);

                let cost = estimator(&probe, 1, 3).estimate("http://fn").await.unwrap();

                let expected = Duration::from_millis(cold.saturating_sub(warm));
                assert_eq!(cost.cost(), expected);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pauses_between_retries() {
        let probe = ScriptedProbe::new([Unavailable, ms(100), ms(10)]);
        let policy = SamplingPolicy {
            request_timeout: Duration::from_secs(1),
            discard_count: 0,
            warm_samples: 1,
            retry_interval: Duration::from_secs(5),
        };

        let start = tokio::time::Instant::now();
        ColdStartEstimator::new(probe, policy)
            .estimate("http://fn")
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }
}
