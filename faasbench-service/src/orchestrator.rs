//! Drives cold start estimates and load tests for all targets.
//!
//! Every [`BenchmarkTarget`] gets its own task. A task repeats the following cycle for the
//! configured number of iterations, or until shutdown:
//!
//! 1. Sleep, so that the provider reclaims idle instances of the function.
//! 2. For each provider the target is deployed to, in order:
//!    - estimate the cold start cost while holding a [`PermitKind::ColdStart`] permit,
//!    - record the cost in the [`MetricsSink`],
//!    - run a load test while holding a [`PermitKind::LoadTest`] permit,
//!    - record the statistics in the [`MetricsSink`].
//!
//! Tasks only interact through the shared [`ConcurrencyGate`]. Errors stay within the task that
//! observed them: a fatal probe error skips the provider for the current cycle, and a failed
//! write to the sink is logged and otherwise ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future;
use sketches_ddsketch::DDSketch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{RunConfig, validate_targets};
use crate::error::ConfigError;
use crate::estimator::{ColdStartEstimator, SamplingPolicy};
use crate::gate::{ConcurrencyGate, PermitKind};
use crate::load::{LoadGenerator, LoadTestDriver};
use crate::probe::LatencyProbe;
use crate::sink::MetricsSink;
use crate::target::{BenchmarkTarget, Provider};

/// Measurements and failures of one provider over the whole run.
#[derive(Default)]
pub struct ProviderReport {
    /// Cold start costs in milliseconds.
    pub cold_start_ms: DDSketch,
    /// Average load test latencies in milliseconds.
    pub load_latency_ms: DDSketch,
    /// Cold start estimates aborted by a fatal probe error.
    pub failed_estimates: u32,
    /// Probes retried because the provider was unavailable.
    pub unavailable_retries: u32,
    /// Load tests repeated because they produced no usable result.
    pub load_test_repeats: u32,
    /// Points the sink failed to record.
    pub persist_failures: u32,
}

impl fmt::Debug for ProviderReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderReport")
            .field("cold_starts", &self.cold_start_ms.count())
            .field("load_tests", &self.load_latency_ms.count())
            .field("failed_estimates", &self.failed_estimates)
            .field("unavailable_retries", &self.unavailable_retries)
            .field("load_test_repeats", &self.load_test_repeats)
            .field("persist_failures", &self.persist_failures)
            .finish()
    }
}

/// Summary of one target task.
#[derive(Debug)]
pub struct TargetReport {
    /// Name of the target.
    pub name: String,
    /// Number of fully completed cycles.
    pub cycles: u32,
    /// Per-provider results, for every provider the target is deployed to.
    pub providers: BTreeMap<Provider, ProviderReport>,
    /// Whether the task was stopped by shutdown.
    pub cancelled: bool,
}

impl TargetReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            cycles: 0,
            providers: BTreeMap::new(),
            cancelled: false,
        }
    }
}

/// Runs the benchmark tasks of all targets.
///
/// Cloning is cheap; all clones share the same gate and collaborators.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    config: Arc<RunConfig>,
    gate: ConcurrencyGate,
    estimator: ColdStartEstimator,
    driver: LoadTestDriver,
    sink: Arc<dyn MetricsSink>,
}

impl Orchestrator {
    /// Creates a new orchestrator after validating `config`.
    pub fn new(
        config: RunConfig,
        gate: ConcurrencyGate,
        probe: Arc<dyn LatencyProbe>,
        generator: Arc<dyn LoadGenerator>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let estimator = ColdStartEstimator::new(probe, SamplingPolicy::from(&config));
        let driver = LoadTestDriver::new(generator, config.load, config.retry_interval);

        Ok(Self {
            config: Arc::new(config),
            gate,
            estimator,
            driver,
            sink,
        })
    }

    /// Returns the validated run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Returns the gate shared by all tasks.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Benchmarks all `targets` concurrently until they finish or `shutdown` is cancelled.
    ///
    /// Targets are validated before any task starts. Returns one report per target.
    pub async fn run(
        &self,
        targets: Vec<BenchmarkTarget>,
        shutdown: CancellationToken,
    ) -> Result<Vec<TargetReport>, ConfigError> {
        validate_targets(&targets)?;

        tracing::info!(targets = targets.len(), "starting benchmarks");
        if let Some(estimate) = self
            .config
            .estimated_duration(targets.len(), self.gate.min_concurrency())
        {
            tracing::info!(?estimate, "estimated duration of the run");
        }

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let orchestrator = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { orchestrator.run_target(target, shutdown).await })
            })
            .collect();

        let gate = self.gate.clone();
        let emitter = tokio::spawn(async move {
            gate.run_emitter(|kind, count| async move {
                merni::gauge!("gate.permits.in_use": count, "kind" => kind.as_str());
            })
            .await
        });

        let results = future::join_all(tasks).await;
        emitter.abort();

        let mut reports = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        "benchmark task failed"
                    );
                }
            }
        }

        tracing::info!("benchmarks completed");
        Ok(reports)
    }

    /// Runs the benchmark cycles of a single target.
    pub async fn run_target(
        &self,
        target: BenchmarkTarget,
        shutdown: CancellationToken,
    ) -> TargetReport {
        let mut report = TargetReport::new(&target.name);

        let endpoints: Vec<_> = target.endpoints().collect();
        if endpoints.is_empty() {
            tracing::info!(function = %target.name, "no endpoint to benchmark");
            return report;
        }

        let mut remaining = self.config.iterations;
        while remaining != Some(0) {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    report.cancelled = true;
                    return report;
                }
                _ = tokio::time::sleep(self.config.sleep_interval) => {}
            }

            for &(provider, url) in &endpoints {
                let provider_report = report.providers.entry(provider).or_default();
                let span = tracing::info_span!("benchmark", function = %target.name, %provider);

                let flow = self
                    .benchmark_endpoint(&target.name, provider, url, provider_report, &shutdown)
                    .instrument(span)
                    .await;

                if flow.is_break() {
                    tracing::info!(function = %target.name, "benchmark cancelled");
                    report.cancelled = true;
                    return report;
                }
            }

            report.cycles += 1;
            merni::counter!("benchmark.cycles": 1);
            if let Some(remaining) = remaining.as_mut() {
                *remaining -= 1;
            }
        }

        report
    }

    /// Measures one provider endpoint. Breaks only on shutdown.
    async fn benchmark_endpoint(
        &self,
        name: &str,
        provider: Provider,
        url: &str,
        report: &mut ProviderReport,
        shutdown: &CancellationToken,
    ) -> ControlFlow<()> {
        let Some(permit) = self.gate.acquire(PermitKind::ColdStart, shutdown).await else {
            return ControlFlow::Break(());
        };
        let estimate = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return ControlFlow::Break(()),
            estimate = self.estimator.estimate(url) => estimate,
        };
        drop(permit);

        let cost = match estimate {
            Ok(cost) => cost,
            Err(error) => {
                report.failed_estimates += 1;
                report.unavailable_retries += error.retries();
                merni::counter!("cold_start.failures": 1, "provider" => provider.tag());
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    url,
                    "could not estimate cold start cost, skipping provider for this cycle"
                );
                return ControlFlow::Continue(());
            }
        };

        let cost_ms = cost.cost_ms();
        report.unavailable_retries += cost.retries;
        report.cold_start_ms.add(cost_ms);
        merni::distribution!("cold_start.cost"@s: cost.cost(), "provider" => provider.tag());
        tracing::info!(cost_ms, "measured cold start cost");

        match self
            .sink
            .insert_cold_point(name, provider, cost_ms, SystemTime::now())
            .await
        {
            Ok(()) => tracing::debug!("persisted cold start cost"),
            Err(error) => {
                report.persist_failures += 1;
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "failed persisting cold start cost"
                );
            }
        }

        let Some(permit) = self.gate.acquire(PermitKind::LoadTest, shutdown).await else {
            return ControlFlow::Break(());
        };
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return ControlFlow::Break(()),
            outcome = self.driver.run_until_usable(url) => outcome,
        };
        drop(permit);

        report.load_test_repeats += outcome.repeats;
        let statistics = outcome.statistics;
        if let Some(avg_latency_ms) = statistics.avg_latency_ms {
            report.load_latency_ms.add(avg_latency_ms);
        }
        tracing::info!(
            avg_latency_ms = statistics.avg_latency_ms,
            repeats = outcome.repeats,
            "load test completed"
        );

        match self
            .sink
            .insert_load_points(name, provider, &statistics, SystemTime::now())
            .await
        {
            Ok(()) => tracing::debug!("persisted load test statistics"),
            Err(error) => {
                report.persist_failures += 1;
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "failed persisting load test statistics"
                );
            }
        }

        ControlFlow::Continue(())
    }
}
