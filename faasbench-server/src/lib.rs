//! The `faasbench` command line runner.
//!
//! This builds on top of [`faasbench_service`], wiring the benchmark engine to an HTTP probe, a
//! `wrk2` load generator and an InfluxDB sink according to the [configuration](config::Config).
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod config;
pub mod observability;
pub mod report;
pub mod runner;
