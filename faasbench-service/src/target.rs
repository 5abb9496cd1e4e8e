//! Benchmark targets and the providers they are deployed to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A cloud platform hosting one deployment of a benchmark target.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Google Cloud Functions.
    Google,
    /// AWS Lambda behind API Gateway.
    Amazon,
    /// Apache OpenWhisk.
    OpenWhisk,
}

impl Provider {
    /// All providers, in the order a target exercises them.
    pub const ALL: [Provider; 3] = [Provider::Google, Provider::Amazon, Provider::OpenWhisk];

    /// The tag attached to every measurement of this provider.
    pub fn tag(self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Amazon => "amazon",
            Provider::OpenWhisk => "openwhisk",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A named function reachable through up to one endpoint per [`Provider`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct BenchmarkTarget {
    /// Unique name of the function, used to label all of its measurements.
    pub name: String,
    /// Endpoint of the Google Cloud Functions deployment.
    #[serde(default)]
    pub google: Option<String>,
    /// Endpoint of the AWS Lambda deployment.
    #[serde(default)]
    pub amazon: Option<String>,
    /// Endpoint of the OpenWhisk deployment.
    #[serde(default)]
    pub openwhisk: Option<String>,
}

impl BenchmarkTarget {
    /// Creates a target without any endpoints.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the endpoint for the given provider.
    pub fn with_endpoint(mut self, provider: Provider, url: impl Into<String>) -> Self {
        let url = Some(url.into());
        match provider {
            Provider::Google => self.google = url,
            Provider::Amazon => self.amazon = url,
            Provider::OpenWhisk => self.openwhisk = url,
        }
        self
    }

    /// Returns the endpoint for the given provider, if deployed there.
    pub fn endpoint(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Google => self.google.as_deref(),
            Provider::Amazon => self.amazon.as_deref(),
            Provider::OpenWhisk => self.openwhisk.as_deref(),
        }
    }

    /// Iterates over all configured endpoints in benchmark order.
    pub fn endpoints(&self) -> impl Iterator<Item = (Provider, &str)> + '_ {
        Provider::ALL
            .into_iter()
            .filter_map(|provider| self.endpoint(provider).map(|url| (provider, url)))
    }
}
