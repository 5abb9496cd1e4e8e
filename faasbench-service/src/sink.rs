//! Destinations for benchmark measurements.
//!
//! A [`MetricsSink`] records two kinds of points: the cold start cost of a single cycle and the
//! statistics of a load test. Failing to record a point never aborts a benchmark; the
//! orchestrator logs the error and moves on.

use std::fmt::{self, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::SinkError;
use crate::load::LoadStatistics;
use crate::target::Provider;

/// Measurement name of cold start points.
pub const COLD_START_MEASUREMENT: &str = "cold_start";
/// Measurement name of load test summary points.
pub const LOAD_TEST_MEASUREMENT: &str = "load_test";
/// Measurement name of load test percentile points.
pub const LOAD_PERCENTILE_MEASUREMENT: &str = "load_test_percentile";

/// A time series store receiving benchmark results.
#[async_trait::async_trait]
pub trait MetricsSink: fmt::Debug + Send + Sync + 'static {
    /// Records the cold start cost of `target` on `provider`.
    async fn insert_cold_point(
        &self,
        target: &str,
        provider: Provider,
        latency_ms: f64,
        timestamp: SystemTime,
    ) -> Result<(), SinkError>;

    /// Records the statistics of a load test against `target` on `provider`.
    async fn insert_load_points(
        &self,
        target: &str,
        provider: Provider,
        statistics: &LoadStatistics,
        timestamp: SystemTime,
    ) -> Result<(), SinkError>;
}

/// A [`MetricsSink`] that only logs measurements.
///
/// Used when no time series store is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl MetricsSink for LogSink {
    async fn insert_cold_point(
        &self,
        target: &str,
        provider: Provider,
        latency_ms: f64,
        _timestamp: SystemTime,
    ) -> Result<(), SinkError> {
        tracing::info!(function = target, %provider, latency_ms, "cold start cost");
        Ok(())
    }

    async fn insert_load_points(
        &self,
        target: &str,
        provider: Provider,
        statistics: &LoadStatistics,
        _timestamp: SystemTime,
    ) -> Result<(), SinkError> {
        tracing::info!(
            function = target,
            %provider,
            avg_latency_ms = statistics.avg_latency_ms,
            max_latency_ms = statistics.max_latency_ms,
            requests_per_second = statistics.requests_per_second,
            "load test statistics"
        );
        Ok(())
    }
}

/// Connection settings of an [`InfluxSink`].
#[derive(Clone, Debug)]
pub struct InfluxOptions {
    /// Base URL of the InfluxDB HTTP API, e.g. `http://localhost:8086`.
    pub url: String,
    /// Database receiving the points.
    pub database: String,
    /// Username for basic authentication.
    pub username: Option<String>,
    /// Password for basic authentication.
    pub password: Option<String>,
    /// Timeout of a single write.
    pub timeout: Duration,
}

/// A [`MetricsSink`] writing InfluxDB line protocol over HTTP.
#[derive(Clone)]
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxSink")
            .field("write_url", &self.write_url)
            .field("database", &self.database)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl InfluxSink {
    /// Creates a sink for the given InfluxDB instance.
    pub fn new(options: InfluxOptions) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;

        Ok(Self {
            client,
            write_url: format!("{}/write", options.url.trim_end_matches('/')),
            database: options.database,
            username: options.username,
            password: options.password,
        })
    }

    async fn write(&self, body: String) -> Result<(), SinkError> {
        if body.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.database.as_str()), ("precision", "ms")])
            .body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl MetricsSink for InfluxSink {
    async fn insert_cold_point(
        &self,
        target: &str,
        provider: Provider,
        latency_ms: f64,
        timestamp: SystemTime,
    ) -> Result<(), SinkError> {
        let mut point = Point::new(COLD_START_MEASUREMENT, target, provider);
        point.field("latency", Some(latency_ms));
        self.write(point.finish(timestamp)).await
    }

    async fn insert_load_points(
        &self,
        target: &str,
        provider: Provider,
        statistics: &LoadStatistics,
        timestamp: SystemTime,
    ) -> Result<(), SinkError> {
        self.write(load_lines(target, provider, statistics, timestamp))
            .await
    }
}

/// Renders all points of a load test in line protocol.
fn load_lines(
    target: &str,
    provider: Provider,
    statistics: &LoadStatistics,
    timestamp: SystemTime,
) -> String {
    let mut summary = Point::new(LOAD_TEST_MEASUREMENT, target, provider);
    summary.field("avg_latency", statistics.avg_latency_ms);
    summary.field("stdev_latency", statistics.stdev_latency_ms);
    summary.field("max_latency", statistics.max_latency_ms);
    summary.field("requests_per_second", statistics.requests_per_second);
    summary.field("transfer_per_second", statistics.transfer_per_second);
    summary.integer_field("total_requests", statistics.total_requests);
    summary.integer_field("socket_errors", Some(statistics.socket_errors));
    summary.integer_field("non_2xx_responses", Some(statistics.non_success_responses));
    let mut lines = summary.finish(timestamp);

    for percentile in &statistics.percentiles {
        let mut point = Point::new(LOAD_PERCENTILE_MEASUREMENT, target, provider);
        point.tag("percentile", &percentile.percentile.to_string());
        point.field("latency", Some(percentile.latency_ms));
        lines.push_str(&point.finish(timestamp));
    }

    lines
}

/// Builder for a single line protocol point.
struct Point {
    line: String,
    fields: usize,
}

impl Point {
    fn new(measurement: &str, target: &str, provider: Provider) -> Self {
        let mut point = Self {
            line: escape(measurement, &[',', ' ']),
            fields: 0,
        };
        point.tag("function", target);
        point.tag("provider", provider.tag());
        point
    }

    fn tag(&mut self, key: &str, value: &str) {
        let _ = write!(
            self.line,
            ",{}={}",
            escape(key, TAG_SPECIAL),
            escape(value, TAG_SPECIAL)
        );
    }

    fn field(&mut self, key: &str, value: Option<f64>) {
        if let Some(value) = value.filter(|value| value.is_finite()) {
            self.separator();
            let _ = write!(self.line, "{}={value}", escape(key, TAG_SPECIAL));
        }
    }

    fn integer_field(&mut self, key: &str, value: Option<u64>) {
        if let Some(value) = value {
            self.separator();
            let _ = write!(self.line, "{}={value}i", escape(key, TAG_SPECIAL));
        }
    }

    fn separator(&mut self) {
        self.line.push(if self.fields == 0 { ' ' } else { ',' });
        self.fields += 1;
    }

    /// Returns the terminated line, or an empty string if the point has no fields.
    fn finish(mut self, timestamp: SystemTime) -> String {
        if self.fields == 0 {
            return String::new();
        }
        let millis = timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let _ = writeln!(self.line, " {millis}");
        self.line
    }
}

const TAG_SPECIAL: &[char] = &[',', '=', ' '];

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
