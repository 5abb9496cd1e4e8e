//! Benchmark engine measuring cold start costs and load behavior of serverless functions.
//!
//! The [`Orchestrator`] runs one task per [`BenchmarkTarget`]. Every task periodically lets its
//! function go idle, estimates the cold start cost with a [`LatencyProbe`], and afterwards runs
//! a load test with a [`LoadGenerator`]. Results are written to a [`MetricsSink`]. A shared
//! [`ConcurrencyGate`] bounds how much of this work happens at the same time.
//!
//! This crate is used by the `faasbench` binary, which wires up [`HttpProbe`], [`Wrk2`] and
//! [`InfluxSink`] from its configuration.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod estimator;
pub mod gate;
pub mod load;
pub mod orchestrator;
pub mod probe;
pub mod sink;
pub mod target;

#[cfg(test)]
mod testutils;

pub use config::{LoadParams, RunConfig};
pub use error::{ConfigError, EstimateError, LoadTestError, SinkError};
pub use estimator::{ColdStartCost, ColdStartEstimator, SamplingPolicy};
pub use gate::{ConcurrencyGate, GatePermit, PermitKind};
pub use load::{LoadGenerator, LoadStatistics, LoadTestDriver, LoadTestOutcome, Wrk2};
pub use orchestrator::{Orchestrator, ProviderReport, TargetReport};
pub use probe::{HttpProbe, LatencyProbe, LatencySample};
pub use sink::{InfluxOptions, InfluxSink, LogSink, MetricsSink};
pub use target::{BenchmarkTarget, Provider};
