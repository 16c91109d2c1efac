// Job metrics collected in-process and reported through tracing
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::info;

/// Latency samples kept for percentile estimates
const LATENCY_WINDOW: usize = 1024;

/// Snapshot of the worker's job metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_jobs: u64,
    pub completed: u64,
    pub failed: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub jobs_per_minute: f64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
}

/// Metrics collector shared by the handler and the runtime loop
pub struct JobMetrics {
    metrics: Arc<RwLock<Metrics>>,
    latencies: Arc<RwLock<VecDeque<Duration>>>,
    start_time: Instant,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(Metrics::default())),
            latencies: Arc::new(RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW))),
            start_time: Instant::now(),
        }
    }

    /// Record one finished job; `failure` is the error kind of a failed job
    pub async fn record_job(&self, latency: Duration, failure: Option<ErrorKind>) {
        let mut metrics = self.metrics.write().await;
        metrics.total_jobs += 1;
        match failure {
            None => metrics.completed += 1,
            Some(kind) => {
                metrics.failed += 1;
                *metrics
                    .failures_by_kind
                    .entry(kind.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
        metrics.error_rate = metrics.failed as f64 / metrics.total_jobs as f64;

        let mut latencies = self.latencies.write().await;
        if latencies.len() == LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(latency);

        let total_ms: f64 = latencies.iter().map(|d| d.as_millis() as f64).sum();
        metrics.avg_latency_ms = total_ms / latencies.len() as f64;

        let mut sorted: Vec<Duration> = latencies.iter().copied().collect();
        sorted.sort();
        let p99_idx = ((sorted.len() as f64 * 0.99) as usize).min(sorted.len() - 1);
        metrics.p99_latency_ms = sorted[p99_idx].as_millis() as f64;

        let minutes = self.start_time.elapsed().as_secs_f64() / 60.0;
        if minutes > 0.0 {
            metrics.jobs_per_minute = metrics.total_jobs as f64 / minutes;
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.read().await.clone()
    }

    /// Print metrics to log
    pub async fn print_metrics(&self) {
        let metrics = self.get_metrics().await;
        info!(
            target: "metrics",
            total = metrics.total_jobs,
            completed = metrics.completed,
            failed = metrics.failed,
            jobs_per_minute = %format!("{:.2}", metrics.jobs_per_minute),
            avg_latency_ms = %format!("{:.1}", metrics.avg_latency_ms),
            p99_latency_ms = %format!("{:.1}", metrics.p99_latency_ms),
            error_rate = %format!("{:.2}%", metrics.error_rate * 100.0),
            "Job metrics"
        );
        for (kind, count) in &metrics.failures_by_kind {
            info!(target: "metrics", kind = %kind, count, "Failures by kind");
        }
    }
}

impl Default for JobMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_failures_by_kind() {
        let m = JobMetrics::new();
        m.record_job(Duration::from_millis(100), None).await;
        m.record_job(Duration::from_millis(300), Some(ErrorKind::Fetch)).await;
        m.record_job(Duration::from_millis(200), Some(ErrorKind::Fetch)).await;

        let snap = m.get_metrics().await;
        assert_eq!(snap.total_jobs, 3);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failures_by_kind.get("fetch"), Some(&2));
        assert!((snap.avg_latency_ms - 200.0).abs() < 1e-6);
        assert_eq!(snap.p99_latency_ms, 300.0);
    }
}
