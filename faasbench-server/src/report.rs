//! Human readable output of benchmark results.

use std::time::Duration;

use faasbench_service::{ColdStartCost, ProviderReport, TargetReport};
use sketches_ddsketch::DDSketch;
use yansi::Paint;

/// Average and percentiles of a distribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Summary {
    /// Number of values.
    pub count: usize,
    /// Arithmetic mean.
    pub avg: f64,
    /// Median.
    pub p50: f64,
    /// 90th percentile.
    pub p90: f64,
    /// 99th percentile.
    pub p99: f64,
}

impl Summary {
    /// Summarizes `sketch`, or returns `None` if it is empty.
    pub fn of(sketch: &DDSketch) -> Option<Self> {
        let count = sketch.count();
        if count == 0 {
            return None;
        }

        let quantile = |q| sketch.quantile(q).ok().flatten();
        Some(Self {
            count,
            avg: sketch.sum()? / count as f64,
            p50: quantile(0.5)?,
            p90: quantile(0.9)?,
            p99: quantile(0.99)?,
        })
    }
}

/// Prints the results of all targets.
pub fn print_reports(reports: &[TargetReport], elapsed: Duration) {
    for report in reports {
        println!();
        print!(
            "{} {} ({} cycles",
            "## Target".bold(),
            report.name.bold().blue(),
            report.cycles.bold()
        );
        if report.cancelled {
            print!(", {}", "CANCELLED".bold().yellow());
        }
        println!(")");

        if report.providers.is_empty() {
            println!("  no endpoints");
        }
        for (provider, provider_report) in &report.providers {
            println!("{}", format!("{}:", provider.tag().to_uppercase()).bold().green());
            print_provider(provider_report);
        }
    }

    let cycles: u32 = reports.iter().map(|report| report.cycles).sum();
    println!();
    println!(
        "{} ({} targets, {} cycles in {:.2?})",
        "## TOTALS".bold(),
        reports.len().bold(),
        cycles.bold(),
        elapsed
    );
}

fn print_provider(report: &ProviderReport) {
    match Summary::of(&report.cold_start_ms) {
        Some(summary) => print_summary("cold start", summary),
        None => println!("  cold start: no measurements"),
    }
    match Summary::of(&report.load_latency_ms) {
        Some(summary) => print_summary("load latency", summary),
        None => println!("  load latency: no measurements"),
    }

    let failures = [
        ("failed estimates", report.failed_estimates),
        ("unavailable retries", report.unavailable_retries),
        ("load test repeats", report.load_test_repeats),
        ("persist failures", report.persist_failures),
    ];
    for (label, count) in failures {
        if count > 0 {
            println!("  {}", format!("{count} {label}").bold().red());
        }
    }
}

fn print_summary(label: &str, summary: Summary) {
    let Summary {
        count,
        avg,
        p50,
        p90,
        p99,
    } = summary;
    println!(
        "  {label} ({count}) avg: {}ms; p50: {p50:.2}ms; p90: {p90:.2}ms; p99: {p99:.2}ms",
        format!("{avg:.2}").bold()
    );
}

/// Prints the result of a single cold start estimate.
pub fn print_estimate(url: &str, cost: &ColdStartCost) {
    println!("{} {}", "## Estimate".bold(), url.bold().blue());
    println!("  cold: {:.2?}", cost.cold);
    println!("  warm average: {:.2?}", cost.warm_average);
    println!("  cost: {}", format!("{:.2?}", cost.cost()).bold().green());
    if cost.retries > 0 {
        println!("  {}", format!("{} unavailable retries", cost.retries).bold().red());
    }
}
