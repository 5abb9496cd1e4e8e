//! Scripted collaborators for unit tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::config::LoadParams;
use crate::error::{LoadTestError, SinkError};
use crate::load::{LoadGenerator, LoadStatistics};
use crate::probe::{LatencyProbe, LatencySample};
use crate::sink::MetricsSink;
use crate::target::Provider;

pub fn usable_statistics(avg_latency_ms: f64) -> LoadStatistics {
    LoadStatistics {
        avg_latency_ms: Some(avg_latency_ms),
        ..Default::default()
    }
}

/// Returns scripted samples in order, then `fallback` forever.
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<LatencySample>>,
    fallback: LatencySample,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = LatencySample>) -> Arc<Self> {
        Self::with_fallback(script, LatencySample::Failed)
    }

    pub fn repeating(sample: LatencySample) -> Arc<Self> {
        Self::with_fallback([], sample)
    }

    pub fn with_fallback(
        script: impl IntoIterator<Item = LatencySample>,
        fallback: LatencySample,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LatencyProbe for ScriptedProbe {
    async fn measure(&self, _url: &str, _timeout: Duration) -> LatencySample {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or(self.fallback)
    }
}

/// Never completes a measurement.
#[derive(Debug, Default)]
pub struct StalledProbe;

#[async_trait::async_trait]
impl LatencyProbe for StalledProbe {
    async fn measure(&self, _url: &str, _timeout: Duration) -> LatencySample {
        std::future::pending().await
    }
}

/// Returns scripted results in order, then a usable result forever.
///
/// `Err(())` in the script turns into a [`LoadTestError`].
#[derive(Debug)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<LoadStatistics, ()>>>,
    duration: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(script: impl IntoIterator<Item = Result<LoadStatistics, ()>>) -> Arc<Self> {
        Self::with_duration(script, Duration::ZERO)
    }

    /// Every run takes `duration` of (virtual) time.
    pub fn with_duration(
        script: impl IntoIterator<Item = Result<LoadStatistics, ()>>,
        duration: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            duration,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The highest number of runs observed at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LoadGenerator for ScriptedGenerator {
    async fn run(&self, _url: &str, _params: &LoadParams) -> Result<LoadStatistics, LoadTestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(statistics)) => Ok(statistics),
            Some(Err(())) => Err(LoadTestError::Io(io::Error::other("scripted failure"))),
            None => Ok(usable_statistics(10.0)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    Cold {
        target: String,
        provider: Provider,
        latency_ms: f64,
    },
    Load {
        target: String,
        provider: Provider,
        avg_latency_ms: Option<f64>,
    },
}

/// Records all points, optionally rejecting every write afterwards.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::default(),
            fail: true,
        })
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: SinkEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        if self.fail {
            return Err(SinkError::Rejected {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: "scripted failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetricsSink for RecordingSink {
    async fn insert_cold_point(
        &self,
        target: &str,
        provider: Provider,
        latency_ms: f64,
        _timestamp: SystemTime,
    ) -> Result<(), SinkError> {
        self.record(SinkEvent::Cold {
            target: target.into(),
            provider,
            latency_ms,
        })
    }

    async fn insert_load_points(
        &self,
        target: &str,
        provider: Provider,
        statistics: &LoadStatistics,
        _timestamp: SystemTime,
    ) -> Result<(), SinkError> {
        self.record(SinkEvent::Load {
            target: target.into(),
            provider,
            avg_latency_ms: statistics.avg_latency_ms,
        })
    }
}
