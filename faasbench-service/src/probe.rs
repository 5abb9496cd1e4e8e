//! Single-request latency measurements.

use std::fmt;
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::header::{CACHE_CONTROL, PRAGMA};

/// Outcome of a single latency measurement.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LatencySample {
    /// Round-trip time from sending the request until the body was fully read.
    Latency(Duration),
    /// The provider is temporarily unavailable, usually while scaling. Worth retrying.
    Unavailable,
    /// Any other failure.
    Failed,
}

/// Measures the latency of a single request against an endpoint.
#[async_trait::async_trait]
pub trait LatencyProbe: fmt::Debug + Send + Sync + 'static {
    /// Performs one request against `url`, giving up after `timeout`.
    async fn measure(&self, url: &str, timeout: Duration) -> LatencySample;
}

/// A [`LatencyProbe`] issuing plain `GET` requests.
///
/// Every request opens a fresh connection which is closed afterwards, so that warm samples do
/// not benefit from connection reuse that the cold sample did not get.
#[derive(Clone, Debug)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Creates a probe with its own HTTP client.
    ///
    /// Connecting and every read of the response are bounded by `io_timeout`, independently of
    /// the total timeout passed to [`LatencyProbe::measure`].
    pub fn new(io_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .connect_timeout(io_timeout)
            .read_timeout(io_timeout)
            .user_agent(concat!("faasbench/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl LatencyProbe for HttpProbe {
    async fn measure(&self, url: &str, timeout: Duration) -> LatencySample {
        let start = Instant::now();

        let request = self
            .client
            .get(url)
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .timeout(timeout);

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    url,
                    "could not perform HTTP request"
                );
                return LatencySample::Failed;
            }
        };

        let status = response.status();
        if status == StatusCode::BAD_GATEWAY || status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::debug!(url, %status, "service temporarily unavailable");
            return LatencySample::Unavailable;
        }
        if !status.is_success() {
            tracing::error!(url, %status, "unexpected response status");
            return LatencySample::Failed;
        }

        // the body is part of the measurement
        loop {
            match response.chunk().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        url,
                        "could not read response body"
                    );
                    return LatencySample::Failed;
                }
            }
        }

        LatencySample::Latency(start.elapsed())
    }
}
