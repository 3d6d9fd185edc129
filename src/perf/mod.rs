//! Performance monitor: per-endpoint ring buffer of recent samples,
//! aggregate queries (`count`, `min`, `max`, `avg`, `p95`), a middleware
//! that records every request, and a `/metrics` route.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use tokio::time::Instant;

use crate::context::Context;
use crate::middleware::{Middleware, Next};
use crate::{Response, StatusCode};

const RING_CAPACITY: usize = 200;

/// One completed request, recorded for later aggregation.
#[derive(Debug, Clone)]
pub struct Sample {
    pub endpoint: String,
    pub method: String,
    pub duration_ms: u64,
    pub status: u16,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointMetrics {
    pub count: usize,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
    pub p95: u64,
}

struct Inner {
    rings: HashMap<String, Vec<Sample>>,
}

/// Process-wide performance monitor. Safe to share behind an `Arc` across
/// the middleware and the `/metrics` route handler.
pub struct PerformanceMonitor {
    inner: Mutex<Inner>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { rings: HashMap::new() }),
        }
    }

    pub fn record(&self, endpoint: &str, method: &str, duration_ms: u64, status: u16) {
        let mut inner = self.inner.lock().unwrap();
        let ring = inner.rings.entry(endpoint.to_string()).or_default();
        if ring.len() == RING_CAPACITY {
            ring.remove(0);
        }
        ring.push(Sample {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            duration_ms,
            status,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Aggregates per endpoint, recomputed from the current ring snapshot on
    /// every call so concurrent readers see a consistent snapshot.
    pub fn get_metrics(&self) -> HashMap<String, EndpointMetrics> {
        let inner = self.inner.lock().unwrap();
        inner
            .rings
            .iter()
            .map(|(endpoint, samples)| (endpoint.clone(), aggregate(samples)))
            .collect()
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn aggregate(samples: &[Sample]) -> EndpointMetrics {
    let mut durations: Vec<u64> = samples.iter().map(|s| s.duration_ms).collect();
    durations.sort_unstable();
    let count = durations.len();
    let min = durations.first().copied().unwrap_or(0);
    let max = durations.last().copied().unwrap_or(0);
    let avg = if count == 0 {
        0.0
    } else {
        durations.iter().sum::<u64>() as f64 / count as f64
    };
    let p95 = if count == 0 {
        0
    } else {
        let idx = ((count as f64) * 0.95).ceil() as usize;
        durations[idx.saturating_sub(1).min(count - 1)]
    };
    EndpointMetrics { count, min, max, avg, p95 }
}

/// Wraps `next`, measures duration, and records it against the monitor.
pub struct PerformanceMiddleware {
    monitor: std::sync::Arc<PerformanceMonitor>,
}

impl PerformanceMiddleware {
    pub fn new(monitor: std::sync::Arc<PerformanceMonitor>) -> Self {
        Self { monitor }
    }
}

impl Middleware for PerformanceMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let monitor = self.monitor.clone();
        let endpoint = ctx.request().path().to_string();
        let method = ctx.request().method().clone();
        Box::pin(async move {
            let start = Instant::now();
            let resp = next.run(ctx).await;
            let duration_ms = start.elapsed().as_millis() as u64;
            monitor.record(&endpoint, method.as_str(), duration_ms, resp.status().as_u16());
            resp
        })
    }
}

/// Route handler for `GET /metrics`: serialises [`PerformanceMonitor::get_metrics`]
/// plus a rolling process memory snapshot (RSS, best-effort via `/proc/self/status`
/// on Linux; `None` elsewhere).
pub async fn metrics_handler(monitor: std::sync::Arc<PerformanceMonitor>, _ctx: Context) -> Response {
    let metrics = monitor.get_metrics();
    let body = serde_json::json!({
        "endpoints": metrics,
        "memory": memory_snapshot(),
    });
    Response::new(StatusCode::Ok)
        .header("Content-Type", "application/json")
        .body(body.to_string())
}

#[cfg(target_os = "linux")]
fn memory_snapshot() -> Option<serde_json::Value> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let rss_kb: u64 = status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())?;
    Some(serde_json::json!({ "rssKb": rss_kb }))
}

#[cfg(not(target_os = "linux"))]
fn memory_snapshot() -> Option<serde_json::Value> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_computes_min_max_avg() {
        let samples: Vec<Sample> = [10u64, 20, 30]
            .iter()
            .map(|d| Sample {
                endpoint: "/x".into(),
                method: "GET".into(),
                duration_ms: *d,
                status: 200,
                timestamp: chrono::Utc::now(),
            })
            .collect();
        let m = aggregate(&samples);
        assert_eq!(m.count, 3);
        assert_eq!(m.min, 10);
        assert_eq!(m.max, 30);
        assert_eq!(m.avg, 20.0);
    }

    #[test]
    fn ring_is_bounded() {
        let monitor = PerformanceMonitor::new();
        for i in 0..(RING_CAPACITY + 10) {
            monitor.record("/x", "GET", i as u64, 200);
        }
        let metrics = monitor.get_metrics();
        assert_eq!(metrics["/x"].count, RING_CAPACITY);
    }

    #[test]
    fn p95_is_near_top_of_distribution() {
        let monitor = PerformanceMonitor::new();
        for i in 1..=100u64 {
            monitor.record("/x", "GET", i, 200);
        }
        let metrics = monitor.get_metrics();
        assert_eq!(metrics["/x"].p95, 95);
    }
}
