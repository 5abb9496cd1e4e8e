//! Load generation through [wrk2](https://github.com/giltene/wrk2).

use std::io;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::config::LoadParams;
use crate::error::LoadTestError;
use crate::load::{LatencyPercentile, LoadGenerator, LoadStatistics};

/// Builds the arguments passed to wrk2 for a single run.
pub fn command_args(url: &str, params: &LoadParams) -> Vec<String> {
    vec![
        format!("-c{}", params.concurrency),
        format!("-t{}", params.threads),
        format!("-d{}s", params.duration.as_secs()),
        format!("-R{}", params.requests_per_second),
        "--latency".to_owned(),
        url.to_owned(),
    ]
}

/// A [`LoadGenerator`] spawning a wrk2 process per load test.
///
/// The command prefix defaults to `wrk`, but can be any invocation that accepts wrk2's
/// arguments, such as `docker run --rm --network host <wrk2 image>`.
#[derive(Clone, Debug)]
pub struct Wrk2 {
    command: Vec<String>,
}

impl Wrk2 {
    /// Creates a generator running the given command prefix.
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Default for Wrk2 {
    fn default() -> Self {
        Self::new(vec!["wrk".to_owned()])
    }
}

#[async_trait::async_trait]
impl LoadGenerator for Wrk2 {
    async fn run(&self, url: &str, params: &LoadParams) -> Result<LoadStatistics, LoadTestError> {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or(LoadTestError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(prefix)
            .args(command_args(url, params))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;

        let mut parser = ReportParser::default();
        let read_stdout = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                parser.parse_line(&line);
            }
            Ok::<_, io::Error>(())
        };
        let read_stderr = async {
            let mut output = String::new();
            BufReader::new(stderr).read_to_string(&mut output).await?;
            Ok::<_, io::Error>(output)
        };

        let (stdout_result, stderr_result) = tokio::join!(read_stdout, read_stderr);
        stdout_result?;
        let errors = stderr_result?;

        let status = child.wait().await?;
        if !status.success() {
            tracing::warn!(%status, stderr = errors.trim(), "load generator exited unsuccessfully");
            return Err(LoadTestError::Exit(status));
        }

        Ok(parser.finish())
    }
}

/// Incremental parser for the textual wrk2 report.
///
/// Lines that are not recognized are ignored, so any unexpected output simply leaves the
/// corresponding statistics empty.
#[derive(Debug, Default)]
pub struct ReportParser {
    statistics: LoadStatistics,
    in_distribution: bool,
}

impl ReportParser {
    /// Feeds a single line of output.
    pub fn parse_line(&mut self, line: &str) {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            self.in_distribution = false;
            return;
        };
        let stats = &mut self.statistics;

        match first {
            "Latency" if line.starts_with("Latency Distribution") => {
                self.in_distribution = true;
            }
            "Latency" => {
                stats.avg_latency_ms = tokens.next().and_then(parse_duration_ms);
                stats.stdev_latency_ms = tokens.next().and_then(parse_duration_ms);
                stats.max_latency_ms = tokens.next().and_then(parse_duration_ms);
            }
            "Req/Sec" => {
                stats.thread_requests_per_second = tokens.next().and_then(parse_count);
            }
            "Requests/sec:" => {
                stats.requests_per_second = tokens.next().and_then(parse_float);
            }
            "Transfer/sec:" => {
                stats.transfer_per_second = tokens.next().and_then(parse_bytes);
            }
            "Socket" => {
                // Socket errors: connect 0, read 0, write 0, timeout 0
                stats.socket_errors = line
                    .split_once(':')
                    .map(|(_, counts)| {
                        counts
                            .split(',')
                            .filter_map(|count| count.split_whitespace().last()?.parse::<u64>().ok())
                            .sum()
                    })
                    .unwrap_or_default();
            }
            "Non-2xx" => {
                stats.non_success_responses = line
                    .rsplit(':')
                    .next()
                    .and_then(|count| count.trim().parse().ok())
                    .unwrap_or_default();
            }
            percentile if self.in_distribution && percentile.ends_with('%') => {
                let percentile = percentile.trim_end_matches('%').parse::<f64>().ok();
                let latency_ms = tokens.next().and_then(parse_duration_ms);
                if let (Some(percentile), Some(latency_ms)) = (percentile, latency_ms) {
                    stats.percentiles.push(LatencyPercentile {
                        percentile,
                        latency_ms,
                    });
                }
            }
            _ if line.contains(" requests in ") => {
                // 60018 requests in 30.00s, 19.46MB read
                stats.total_requests = first.parse().ok();
                stats.bytes_read = line
                    .split(", ")
                    .nth(1)
                    .and_then(|read| read.strip_suffix(" read"))
                    .and_then(parse_bytes)
                    .map(|bytes| bytes as u64);
            }
            _ => {}
        }
    }

    /// Parses a complete report.
    pub fn parse(report: &str) -> LoadStatistics {
        let mut parser = Self::default();
        for line in report.lines() {
            parser.parse_line(line);
        }
        parser.finish()
    }

    /// Returns the statistics collected so far.
    pub fn finish(self) -> LoadStatistics {
        self.statistics
    }
}

fn parse_float(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|value| value.is_finite())
}

/// Parses durations such as `812.00us`, `6.46ms`, `1.20s` or `2.00m` into milliseconds.
fn parse_duration_ms(value: &str) -> Option<f64> {
    if let Some(number) = value.strip_suffix("us") {
        parse_float(number).map(|us| us / 1000.0)
    } else if let Some(number) = value.strip_suffix("ms") {
        parse_float(number)
    } else if let Some(number) = value.strip_suffix('s') {
        parse_float(number).map(|s| s * 1000.0)
    } else if let Some(number) = value.strip_suffix('m') {
        parse_float(number).map(|m| m * 60_000.0)
    } else if let Some(number) = value.strip_suffix('h') {
        parse_float(number).map(|h| h * 3_600_000.0)
    } else {
        None
    }
}

/// Parses sizes such as `664.18KB` or `19.46MB` into bytes.
fn parse_bytes(value: &str) -> Option<f64> {
    const UNITS: [(&str, f64); 5] = [
        ("KB", 1024.0),
        ("MB", 1024.0 * 1024.0),
        ("GB", 1024.0 * 1024.0 * 1024.0),
        ("TB", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("B", 1.0),
    ];

    UNITS.iter().find_map(|(suffix, factor)| {
        let number = value.strip_suffix(suffix)?;
        parse_float(number).map(|number| number * factor)
    })
}

/// Parses counts such as `1.05k` or `120.00`.
fn parse_count(value: &str) -> Option<f64> {
    if let Some(number) = value.strip_suffix('k') {
        parse_float(number).map(|number| number * 1_000.0)
    } else if let Some(number) = value.strip_suffix('M') {
        parse_float(number).map(|number| number * 1_000_000.0)
    } else {
        parse_float(value)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const REPORT: &str = "\
Running 30s test @ http://127.0.0.1:8080/
  2 threads and 100 connections
  Thread calibration: mean lat.: 2.154ms, rate sampling interval: 10ms
  Thread calibration: mean lat.: 2.211ms, rate sampling interval: 10ms
  Thread Stats   Avg      Stdev     Max   +/- Stdev
    Latency     6.46ms    1.93ms  12.34ms   67.66%
    Req/Sec     1.05k     1.12k    2.50k    64.84%
  Latency Distribution (HdrHistogram - Recorded Latency)
 50.000%    6.67ms
 75.000%    7.78ms
 90.000%    9.14ms
 99.000%   11.18ms
 99.900%   12.30ms
100.000%   12.50ms

  Detailed Percentile spectrum:
       Value   Percentile   TotalCount 1/(1-Percentile)

       0.921     0.000000            1         1.00
       6.671     0.500000        24301         2.00
#[Mean    =        6.460, StdDeviation   =        1.928]
#[Max     =       12.496, Total count    =        48493]
----------------------------------------------------------
  60018 requests in 30.00s, 19.46MB read
  Socket errors: connect 0, read 2, write 0, timeout 12
  Non-2xx or 3xx responses: 5
Requests/sec:   1999.91
Transfer/sec:    664.18KB
";

    #[test]
    fn parses_full_report() {
        let stats = ReportParser::parse(REPORT);

        assert_eq!(stats.avg_latency_ms, Some(6.46));
        assert_eq!(stats.stdev_latency_ms, Some(1.93));
        assert_eq!(stats.max_latency_ms, Some(12.34));
        assert_eq!(stats.thread_requests_per_second, Some(1050.0));
        assert_eq!(stats.percentiles.len(), 6);
        assert_eq!(stats.percentile(50.0), Some(6.67));
        assert_eq!(stats.percentile(99.9), Some(12.3));
        assert_eq!(stats.total_requests, Some(60018));
        assert_eq!(stats.bytes_read, Some((19.46 * 1024.0 * 1024.0) as u64));
        assert_eq!(stats.socket_errors, 14);
        assert_eq!(stats.non_success_responses, 5);
        assert_eq!(stats.requests_per_second, Some(1999.91));
        assert_eq!(stats.transfer_per_second, Some(664.18 * 1024.0));
        assert!(stats.is_usable());
    }

    #[test]
    fn report_without_results_is_unusable() {
        let stats = ReportParser::parse(
            "  Thread Stats   Avg      Stdev     Max   +/- Stdev\n    Latency     -nanus    -nanus   0.00us    0.00%\n",
        );

        assert_eq!(stats.avg_latency_ms, None);
        assert_eq!(stats.max_latency_ms, Some(0.0));
        assert!(!stats.is_usable());
    }

    #[test]
    fn normalizes_time_units() {
        assert_eq!(parse_duration_ms("500.00us"), Some(0.5));
        assert_eq!(parse_duration_ms("6.46ms"), Some(6.46));
        assert_eq!(parse_duration_ms("1.50s"), Some(1500.0));
        assert_eq!(parse_duration_ms("2.00m"), Some(120_000.0));
        assert_eq!(parse_duration_ms("1.00h"), Some(3_600_000.0));
        assert_eq!(parse_duration_ms("fast"), None);
    }

    #[test]
    fn normalizes_size_units() {
        assert_eq!(parse_bytes("512.00B"), Some(512.0));
        assert_eq!(parse_bytes("2.00KB"), Some(2048.0));
        assert_eq!(parse_bytes("1.00GB"), Some(1024.0 * 1024.0 * 1024.0));
    }

    #[test]
    fn builds_arguments() {
        let params = LoadParams {
            concurrency: 50,
            threads: 4,
            duration: Duration::from_secs(30),
            requests_per_second: 200,
        };

        assert_eq!(
            command_args("http://fn", &params),
            ["-c50", "-t4", "-d30s", "-R200", "--latency", "http://fn"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_process_and_parses_stdout() {
        let mut report = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut report, REPORT.as_bytes()).unwrap();

        // the generator arguments end up as ignored positional parameters of the script
        let script = format!("cat '{}'", report.path().display());
        let wrk = Wrk2::new(vec!["sh".into(), "-c".into(), script]);

        let stats = wrk.run("http://fn", &LoadParams::default()).await.unwrap();
        assert_eq!(stats.avg_latency_ms, Some(6.46));
        assert_eq!(stats.requests_per_second, Some(1999.91));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_process_is_an_error() {
        let wrk = Wrk2::new(vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()]);

        let result = wrk.run("http://fn", &LoadParams::default()).await;
        assert!(matches!(result, Err(LoadTestError::Exit(status)) if status.code() == Some(3)));
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let wrk = Wrk2::new(Vec::new());

        let result = wrk.run("http://fn", &LoadParams::default()).await;
        assert!(matches!(result, Err(LoadTestError::EmptyCommand)));
    }
}
