//! Wiring of the benchmark engine from configuration.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use faasbench_service::{
    ColdStartEstimator, HttpProbe, InfluxSink, LogSink, MetricsSink, Orchestrator, SamplingPolicy,
    Wrk2,
};
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::report;

/// Creates the orchestrator for the configured gate, load generator and sink.
pub fn orchestrator(config: &Config) -> Result<Orchestrator> {
    let gate = config.gate.build().context("invalid gate limits")?;
    let probe = HttpProbe::new(config.run.request_timeout).context("failed to create HTTP client")?;
    let generator = Wrk2::new(config.load_generator.command.clone());

    let sink: Arc<dyn MetricsSink> = match &config.influx {
        Some(influx) => {
            tracing::info!(url = %influx.url, database = %influx.database, "writing results to InfluxDB");
            Arc::new(InfluxSink::new(influx.options()).context("failed to create InfluxDB client")?)
        }
        None => {
            tracing::info!("no InfluxDB configured, logging results");
            Arc::new(LogSink)
        }
    };

    let orchestrator = Orchestrator::new(
        config.run.clone(),
        gate,
        Arc::new(probe),
        Arc::new(generator),
        sink,
    )
    .context("invalid run parameters")?;

    Ok(orchestrator)
}

/// Runs all configured benchmarks until they complete or termination is requested.
///
/// Prints a summary of all targets afterwards, also when interrupted.
pub async fn run(config: Config) -> Result<()> {
    tracing::info!("Starting benchmarks");
    merni::counter!("runner.start": 1);

    config.validate()?;
    let orchestrator = orchestrator(&config)?;

    tokio::spawn(
        elegant_departure::tokio::depart()
            .on_termination()
            .on_sigint()
            .on_signal(SignalKind::hangup())
            .on_signal(SignalKind::quit()),
    );

    let start = Instant::now();
    let shutdown = CancellationToken::new();
    let guard = elegant_departure::get_shutdown_guard();

    let benchmark = orchestrator.run(config.targets.clone(), shutdown.clone());
    tokio::pin!(benchmark);

    let reports = tokio::select! {
        reports = &mut benchmark => reports?,
        _ = guard.wait() => {
            tracing::info!("Shutting down ...");
            shutdown.cancel();
            benchmark.await?
        }
    };
    drop(guard);

    report::print_reports(&reports, start.elapsed());
    tracing::info!("Benchmarks complete");
    Ok(())
}

/// Estimates the cold start cost of a single endpoint, right away.
///
/// The endpoint must have been idle long enough for the first request to hit a cold instance.
pub async fn estimate(config: Config, url: &str) -> Result<()> {
    config.run.validate().context("invalid run parameters")?;

    let probe = HttpProbe::new(config.run.request_timeout).context("failed to create HTTP client")?;
    let estimator = ColdStartEstimator::new(Arc::new(probe), SamplingPolicy::from(&config.run));

    let cost = estimator
        .estimate(url)
        .await
        .with_context(|| format!("failed to estimate cold start cost of {url}"))?;

    report::print_estimate(url, &cost);
    Ok(())
}

/// Validates the configuration and prints what a run would do.
pub fn validate(config: &Config) -> Result<()> {
    config.validate()?;
    let gate = config.gate.build()?;

    println!("configuration is valid");
    for target in &config.targets {
        let providers: Vec<_> = target.endpoints().map(|(provider, _)| provider.tag()).collect();
        println!("  {}: {}", target.name, providers.join(", "));
    }

    match config
        .run
        .estimated_duration(config.targets.len(), gate.min_concurrency())
    {
        Some(duration) => println!("estimated duration: {duration:.0?}"),
        None => println!("runs until interrupted"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use faasbench_service::{BenchmarkTarget, PermitKind, Provider};

    use super::*;

    fn config() -> Config {
        Config {
            targets: vec![
                BenchmarkTarget::new("resize").with_endpoint(Provider::Google, "http://gcf/resize"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn builds_orchestrator_from_config() {
        let mut config = config();
        config.gate.cold_start = 4;
        config.gate.load_test = 2;

        let orchestrator = orchestrator(&config).unwrap();

        assert!(!orchestrator.gate().is_shared());
        assert_eq!(orchestrator.gate().max_permits(PermitKind::ColdStart), 4);
        assert_eq!(orchestrator.gate().max_permits(PermitKind::LoadTest), 2);
        assert_eq!(orchestrator.config(), &config.run);
    }

    #[test]
    fn rejects_invalid_run() {
        let mut config = config();
        config.run.warm_samples = 0;

        assert!(orchestrator(&config).is_err());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn validates_targets() {
        assert!(validate(&config()).is_ok());
        assert!(validate(&Config::default()).is_err());
    }
}
