//! Remote log sink: batches log entries per destination, flushes on a
//! size/time trigger, retries with exponential backoff, and trips a circuit
//! breaker after repeated failures.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use super::LogEntry;

/// Configuration for one remote destination.
#[derive(Clone)]
pub struct Destination {
    pub name: String,
    pub url: String,
    pub api_key: Option<String>,
    pub headers: Vec<(String, String)>,
    pub method: String,
    pub timeout: Duration,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
}

impl Destination {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            api_key: None,
            headers: Vec::new(),
            method: "POST".to_string(),
            timeout: Duration::from_secs(5),
            batch_size: 50,
            flush_interval: Duration::from_secs(5),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    version: &'a str,
    timestamp: String,
    count: usize,
    logs: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-destination health counters.
#[derive(Debug, Clone, Default)]
pub struct HealthStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
}

impl HealthStats {
    /// Unhealthy when the observed failure rate is at least 50%.
    pub fn healthy(&self) -> bool {
        if self.total == 0 {
            return true;
        }
        (self.failures as f64 / self.total as f64) < 0.5
    }
}

struct DestinationState {
    destination: Destination,
    buffer: Vec<LogEntry>,
    breaker: Mutex<BreakerInner>,
    stats: Mutex<HealthStats>,
}

/// Buffers entries per destination and flushes them over HTTP, honoring the
/// per-destination circuit breaker and retry policy.
pub struct RemoteSink {
    client: reqwest::Client,
    destinations: Vec<DestinationState>,
}

impl RemoteSink {
    pub fn new(destinations: Vec<Destination>) -> Self {
        Self {
            client: reqwest::Client::new(),
            destinations: destinations
                .into_iter()
                .map(|d| DestinationState {
                    destination: d,
                    buffer: Vec::new(),
                    breaker: Mutex::new(BreakerInner {
                        state: BreakerState::Closed,
                        consecutive_failures: 0,
                        opened_at: None,
                    }),
                    stats: Mutex::new(HealthStats::default()),
                })
                .collect(),
        }
    }

    /// Appends `entry` to every destination's buffer, flushing any that
    /// reach `batch_size`.
    pub async fn enqueue(&mut self, entry: LogEntry) {
        let indices: Vec<usize> = (0..self.destinations.len()).collect();
        for i in indices {
            self.destinations[i].buffer.push(entry.clone());
            if self.destinations[i].buffer.len() >= self.destinations[i].destination.batch_size {
                self.flush_one(i).await;
            }
        }
    }

    /// Flushes every destination's buffer regardless of size, e.g. on the
    /// `flush_interval` timer tick.
    pub async fn flush_all(&mut self) {
        for i in 0..self.destinations.len() {
            if !self.destinations[i].buffer.is_empty() {
                self.flush_one(i).await;
            }
        }
    }

    async fn flush_one(&mut self, index: usize) {
        let batch = std::mem::take(&mut self.destinations[index].buffer);
        if batch.is_empty() {
            return;
        }

        let state = &self.destinations[index];
        if !self.breaker_allows(state) {
            return;
        }

        let payload = Payload {
            version: "1",
            timestamp: chrono::Utc::now().to_rfc3339(),
            count: batch.len(),
            logs: batch
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "timestamp": e.timestamp.to_rfc3339(),
                        "level": e.level.tag(),
                        "message": e.message,
                        "metadata": e.metadata,
                    })
                })
                .collect(),
        };

        let result = self.send_with_retry(index, &payload).await;
        self.record_outcome(index, result.is_ok());
    }

    fn breaker_allows(&self, state: &DestinationState) -> bool {
        let mut breaker = state.breaker.lock().unwrap();
        match breaker.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= state.destination.circuit_breaker_timeout {
                    breaker.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => true,
        }
    }

    async fn send_with_retry(&self, index: usize, payload: &Payload<'_>) -> Result<(), ()> {
        let destination = &self.destinations[index].destination;
        let mut last_err = Err(());

        for attempt in 1..=destination.retry_attempts {
            let mut req = self
                .client
                .request(
                    reqwest::Method::from_bytes(destination.method.as_bytes()).unwrap_or(reqwest::Method::POST),
                    destination.url.as_str(),
                )
                .timeout(destination.timeout)
                .json(payload);

            if let Some(key) = &destination.api_key {
                req = req.bearer_auth(key);
            }
            for (name, value) in &destination.headers {
                req = req.header(name, value);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                _ => {
                    last_err = Err(());
                    if attempt < destination.retry_attempts {
                        let delay = backoff_delay(destination.retry_base_delay, attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        last_err
    }

    fn record_outcome(&self, index: usize, success: bool) {
        let state = &self.destinations[index];
        let mut stats = state.stats.lock().unwrap();
        stats.total += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        drop(stats);

        let mut breaker = state.breaker.lock().unwrap();
        if success {
            breaker.consecutive_failures = 0;
            breaker.state = BreakerState::Closed;
            breaker.opened_at = None;
        } else {
            breaker.consecutive_failures += 1;
            if breaker.consecutive_failures >= state.destination.circuit_breaker_threshold {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn health(&self) -> HashMap<String, HealthStats> {
        self.destinations
            .iter()
            .map(|d| (d.destination.name.clone(), d.stats.lock().unwrap().clone()))
            .collect()
    }
}

/// `baseDelay * 2^(attempt-1)` plus jitter, capped at 30s.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << (attempt.saturating_sub(1)).min(20));
    let capped = exp.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=capped.min(250) as u64);
    Duration::from_millis(capped as u64 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Level;

    fn entry(msg: &str) -> LogEntry {
        LogEntry {
            timestamp: chrono::Utc::now(),
            level: Level::Info,
            message: msg.to_string(),
            metadata: None,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let base = Duration::from_millis(500);
        assert!(backoff_delay(base, 1).as_millis() >= 500);
        assert!(backoff_delay(base, 10).as_millis() <= 30_250);
    }

    #[tokio::test]
    async fn enqueue_buffers_until_batch_size() {
        let mut sink = RemoteSink::new(vec![Destination::new("test", "http://127.0.0.1:0/ingest")]);
        sink.destinations[0].destination.batch_size = 3;
        sink.enqueue(entry("a")).await;
        sink.enqueue(entry("b")).await;
        assert_eq!(sink.destinations[0].buffer.len(), 2);
    }

    #[test]
    fn health_is_healthy_with_no_traffic() {
        let sink = RemoteSink::new(vec![Destination::new("test", "http://example.invalid")]);
        let health = sink.health();
        assert!(health.get("test").unwrap().healthy());
    }
}
