//! Test utilities for faasbench.
//!
//! This crate provides utilities to facilitate integration testing of the benchmark engine. See
//! the modules for all available utilities.

pub mod server;
pub mod tracing;
