//! Configuration for the faasbench runner.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `FB__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all configuration fields and their defaults.
//!
//! # Environment Variables
//!
//! Environment variables use `FB__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `FB__RUN__ITERATIONS=3` bounds the number of benchmark cycles
//! - `FB__GATE__LOAD_TEST=2` allows two load tests at the same time
//! - `FB__INFLUX__URL=http://influx:8086` enables the InfluxDB sink
//!
//! # YAML Configuration File
//!
//! Targets are most conveniently declared in a YAML file:
//!
//! ```yaml
//! run:
//!   iterations: 3
//!   sleep_interval: 90m
//!   load:
//!     duration: 30s
//!
//! targets:
//!   - name: latency-test
//!     google: https://europe-west1-project.cloudfunctions.net/latency-test
//!     amazon: https://abc123.execute-api.eu-west-1.amazonaws.com/dev/latency-test
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use faasbench_service::config::validate_targets;
use faasbench_service::{BenchmarkTarget, ConcurrencyGate, ConfigError, InfluxOptions, RunConfig};
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "FB__";

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// Returns the secret as string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Runtime configuration for the Tokio async runtime.
///
/// Used in: [`Config::runtime`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads for the runtime.
    ///
    /// Benchmark tasks mostly wait on timers, HTTP responses and the load generator process, so
    /// few threads suffice even for many targets.
    ///
    /// # Default
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `FB__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// [Sentry](https://sentry.io/) error tracking configuration.
///
/// Sentry is disabled by default and only enabled when a DSN is provided.
///
/// Used in: [`Config::sentry`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN (Data Source Name).
    ///
    /// # Default
    ///
    /// `None` (Sentry disabled)
    ///
    /// # Environment Variable
    ///
    /// `FB__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name for this deployment.
    ///
    /// # Environment Variable
    ///
    /// `FB__SENTRY__ENVIRONMENT`
    pub environment: Option<Cow<'static, str>>,

    /// Name of the machine running the benchmarks.
    ///
    /// # Environment Variable
    ///
    /// `FB__SENTRY__SERVER_NAME`
    pub server_name: Option<Cow<'static, str>>,

    /// Error event sampling rate.
    ///
    /// # Default
    ///
    /// `1.0` (send all errors)
    ///
    /// # Environment Variable
    ///
    /// `FB__SENTRY__SAMPLE_RATE`
    pub sample_rate: f32,

    /// Performance trace sampling rate.
    ///
    /// # Default
    ///
    /// `0.01` (send 1% of traces)
    ///
    /// # Environment Variable
    ///
    /// `FB__SENTRY__TRACES_SAMPLE_RATE`
    pub traces_sample_rate: f32,

    /// Enable Sentry SDK debug mode.
    ///
    /// # Environment Variable
    ///
    /// `FB__SENTRY__DEBUG`
    pub debug: bool,

    /// Additional tags to attach to all Sentry events.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually:
    /// - `FB__SENTRY__TAGS__FOO=foo`
    /// - `FB__SENTRY__TAGS__BAR=bar`
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    ///
    /// ```text
    ///  INFO  faasbench_service::orchestrator > starting benchmarks
    /// ```
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2020-12-04T12:10:32Z [faasbench_service::orchestrator] INFO: starting benchmarks
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr, the final summary goes to stdout.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// The `RUST_LOG` environment variable provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `FB__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    ///
    /// # Environment Variable
    ///
    /// `FB__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Metrics configuration.
///
/// Configures submission of internal metrics to Datadog. These describe the runner itself, such
/// as permits in use and retries. Benchmark results go to the [`Influx`] sink instead.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Datadog API key for metrics.
    ///
    /// # Default
    ///
    /// `None` (Datadog metrics disabled)
    ///
    /// # Environment Variable
    ///
    /// `FB__METRICS__DATADOG_KEY`
    pub datadog_key: Option<SecretBox<ConfigSecret>>,

    /// Global tags applied to all metrics.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually:
    /// - `FB__METRICS__TAGS__FOO=foo`
    /// - `FB__METRICS__TAGS__BAR=bar`
    pub tags: BTreeMap<String, String>,
}

/// Limits on concurrent work across all targets.
///
/// Used in: [`Config::gate`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Gate {
    /// A single limit for cold start estimates and load tests together.
    ///
    /// When set, `cold_start` and `load_test` are ignored.
    ///
    /// # Environment Variable
    ///
    /// `FB__GATE__SHARED`
    pub shared: Option<usize>,

    /// Maximum number of concurrent cold start estimates.
    ///
    /// # Default
    ///
    /// `8`
    ///
    /// # Environment Variable
    ///
    /// `FB__GATE__COLD_START`
    pub cold_start: usize,

    /// Maximum number of concurrent load tests.
    ///
    /// Load tests compete for the bandwidth and CPU of the benchmarking machine, which distorts
    /// their results.
    ///
    /// # Default
    ///
    /// `1`
    ///
    /// # Environment Variable
    ///
    /// `FB__GATE__LOAD_TEST`
    pub load_test: usize,
}

impl Default for Gate {
    fn default() -> Self {
        Self {
            shared: None,
            cold_start: 8,
            load_test: 1,
        }
    }
}

impl Gate {
    /// Creates the configured gate, rejecting zero limits.
    pub fn build(&self) -> Result<ConcurrencyGate, ConfigError> {
        if let Some(max) = self.shared {
            if max == 0 {
                return Err(ConfigError::NotPositive("gate.shared"));
            }
            return Ok(ConcurrencyGate::shared(max));
        }

        if self.cold_start == 0 {
            return Err(ConfigError::NotPositive("gate.cold_start"));
        }
        if self.load_test == 0 {
            return Err(ConfigError::NotPositive("gate.load_test"));
        }

        Ok(ConcurrencyGate::split(self.cold_start, self.load_test))
    }
}

/// The external load generator.
///
/// Used in: [`Config::load_generator`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadGenerator {
    /// Command prefix of the `wrk2` invocation, for example `[docker, run, --rm, wrk2]`.
    ///
    /// Load parameters and the URL are appended to this command.
    ///
    /// # Default
    ///
    /// `[wrk]`
    pub command: Vec<String>,
}

impl Default for LoadGenerator {
    fn default() -> Self {
        Self {
            command: vec!["wrk".to_owned()],
        }
    }
}

/// InfluxDB receiving the benchmark results.
///
/// Without this section, results are only logged.
///
/// Used in: [`Config::influx`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Influx {
    /// Base URL of the InfluxDB HTTP API.
    ///
    /// # Default
    ///
    /// `http://localhost:8086`
    ///
    /// # Environment Variable
    ///
    /// `FB__INFLUX__URL`
    pub url: String,

    /// Database receiving the points.
    ///
    /// # Default
    ///
    /// `faasbench`
    ///
    /// # Environment Variable
    ///
    /// `FB__INFLUX__DATABASE`
    pub database: String,

    /// Username for basic authentication.
    ///
    /// # Environment Variable
    ///
    /// `FB__INFLUX__USERNAME`
    pub username: Option<String>,

    /// Password for basic authentication.
    ///
    /// # Environment Variable
    ///
    /// `FB__INFLUX__PASSWORD`
    pub password: Option<SecretBox<ConfigSecret>>,

    /// Timeout of a single write.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for Influx {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_owned(),
            database: "faasbench".to_owned(),
            username: None,
            password: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl Influx {
    /// Connection options for the InfluxDB sink.
    pub fn options(&self) -> InfluxOptions {
        InfluxOptions {
            url: self.url.clone(),
            database: self.database.clone(),
            username: self.username.clone(),
            password: self
                .password
                .as_ref()
                .map(|password| password.expose_secret().as_str().to_owned()),
            timeout: self.timeout,
        }
    }
}

/// Main configuration struct for faasbench.
///
/// Configuration is loaded with the following precedence (highest to lowest):
/// 1. Environment variables (`FB__` prefix)
/// 2. YAML configuration file (if provided via `-c` flag)
/// 3. Default values
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Parameters of the benchmark run. See [`RunConfig`].
    ///
    /// # Environment Variables
    ///
    /// - `FB__RUN__SLEEP_INTERVAL=2h`
    /// - `FB__RUN__REQUEST_TIMEOUT=30m`
    /// - `FB__RUN__ITERATIONS=5`
    /// - `FB__RUN__LOAD__DURATION=60s`
    pub run: RunConfig,

    /// Concurrency limits. See [`Gate`].
    pub gate: Gate,

    /// The external load generator. See [`LoadGenerator`].
    pub load_generator: LoadGenerator,

    /// Destination of benchmark results. See [`Influx`].
    pub influx: Option<Influx>,

    /// Functions to benchmark.
    pub targets: Vec<BenchmarkTarget>,

    /// Configuration of the Tokio runtime. See [`Runtime`].
    pub runtime: Runtime,

    /// Logging configuration. See [`Logging`].
    pub logging: Logging,

    /// Sentry error tracking. See [`Sentry`].
    pub sentry: Sentry,

    /// Internal metrics. See [`Metrics`].
    pub metrics: Metrics,
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided in `args`)
    /// 3. Environment variables (prefixed with `FB__`)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Checks the run parameters, the gate limits and the targets.
    pub fn validate(&self) -> Result<()> {
        self.run.validate().context("invalid run parameters")?;
        self.gate.build().context("invalid gate limits")?;
        validate_targets(&self.targets).context("invalid targets")?;
        Ok(())
    }
}
