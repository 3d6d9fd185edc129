//! Process-wide error analytics: a bounded sample of recent errors plus
//! running counts, queried by the operator-facing `/errors` surface.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::TypedError;

const SAMPLE_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub is_operational: bool,
    pub client_ip: Option<String>,
}

#[derive(Default)]
struct Inner {
    total: u64,
    by_type: HashMap<String, u64>,
    recent: VecDeque<ErrorRecord>,
}

/// Thread-safe running tally of errors the [`super::ErrorMiddleware`] /
/// [`super::wrap_fallible`] sink has seen, bounded to the last
/// [`SAMPLE_CAPACITY`] entries for the detailed sample.
pub struct ErrorAnalytics {
    inner: Mutex<Inner>,
}

impl ErrorAnalytics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record(&self, err: &TypedError, client_ip: Option<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.total += 1;
        *inner.by_type.entry(err.kind.type_name().to_string()).or_insert(0) += 1;

        if inner.recent.len() == SAMPLE_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(ErrorRecord {
            kind: err.kind.type_name().to_string(),
            message: err.message.clone(),
            timestamp: err.timestamp,
            status_code: err.kind.http_status().as_u16(),
            is_operational: err.kind.is_operational(),
            client_ip,
        });
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().unwrap().total
    }

    pub fn last_24h(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        inner.recent.iter().filter(|r| r.timestamp >= cutoff).count() as u64
    }

    pub fn by_type(&self) -> HashMap<String, u64> {
        self.inner.lock().unwrap().by_type.clone()
    }

    /// The 5 most frequent error types, most-frequent first, ties broken by
    /// first-seen order (`HashMap` iteration order is otherwise unstable, so
    /// the tie-break is re-derived from insertion order recorded on `recent`).
    pub fn top5(&self) -> Vec<(String, u64)> {
        let inner = self.inner.lock().unwrap();
        let mut seen_order: Vec<String> = Vec::new();
        for record in &inner.recent {
            if !seen_order.contains(&record.kind) {
                seen_order.push(record.kind.clone());
            }
        }
        let mut counts: Vec<(String, u64)> = inner
            .by_type
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        counts.sort_by(|a, b| {
            b.1.cmp(&a.1).then_with(|| {
                let pos_a = seen_order.iter().position(|k| k == &a.0).unwrap_or(usize::MAX);
                let pos_b = seen_order.iter().position(|k| k == &b.0).unwrap_or(usize::MAX);
                pos_a.cmp(&pos_b)
            })
        });
        counts.truncate(5);
        counts
    }

    /// The full 100-entry ring buffer backing [`Self::record`].
    pub fn ring_buffer(&self) -> Vec<ErrorRecord> {
        self.inner.lock().unwrap().recent.iter().cloned().collect()
    }

    /// Sample of the 10 most recent errors.
    pub fn recent_sample(&self) -> Vec<ErrorRecord> {
        let inner = self.inner.lock().unwrap();
        inner.recent.iter().rev().take(10).cloned().collect()
    }

    /// Operator-facing hints from a fixed set of rules:
    /// - more than 50 errors in the last 24h → "high error rate"
    /// - Authentication/Authorization errors exceed 30% of total → "auth issues"
    /// - Validation errors exceed 40% of total → "validation issues"
    /// - any Database error recorded → "database issues"
    pub fn insights(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        if inner.total == 0 {
            return out;
        }

        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let last_24h = inner.recent.iter().filter(|r| r.timestamp >= cutoff).count();
        if last_24h > 50 {
            out.push("high error rate".to_string());
        }

        let auth_count = inner
            .by_type
            .iter()
            .filter(|(k, _)| k.as_str() == "AuthenticationError" || k.as_str() == "AuthorizationError")
            .map(|(_, v)| v)
            .sum::<u64>();
        if auth_count as f64 / inner.total as f64 > 0.3 {
            out.push("auth issues".to_string());
        }

        let validation_count = inner.by_type.get("ValidationError").copied().unwrap_or(0);
        if validation_count as f64 / inner.total as f64 > 0.4 {
            out.push("validation issues".to_string());
        }

        if inner.by_type.contains_key("DatabaseError") {
            out.push("database issues".to_string());
        }

        out
    }
}

impl Default for ErrorAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TypedError;

    #[test]
    fn counts_total_and_by_type() {
        let analytics = ErrorAnalytics::new();
        analytics.record(&TypedError::not_found("user"), None);
        analytics.record(&TypedError::not_found("order"), None);
        analytics.record(&TypedError::authentication(), None);

        assert_eq!(analytics.total(), 3);
        assert_eq!(analytics.by_type().get("NotFound"), Some(&2));
    }

    #[test]
    fn ring_buffer_is_bounded_but_total_is_not() {
        let analytics = ErrorAnalytics::new();
        for _ in 0..(SAMPLE_CAPACITY + 10) {
            analytics.record(&TypedError::not_found("x"), None);
        }
        assert_eq!(analytics.ring_buffer().len(), SAMPLE_CAPACITY);
        assert_eq!(analytics.recent_sample().len(), 10);
        assert_eq!(analytics.total(), (SAMPLE_CAPACITY + 10) as u64);
    }

    #[test]
    fn insights_flag_database_errors() {
        let analytics = ErrorAnalytics::new();
        analytics.record(&TypedError::database("insert", None), None);
        assert!(analytics.insights().contains(&"database issues".to_string()));
    }

    #[test]
    fn top5_orders_by_frequency() {
        let analytics = ErrorAnalytics::new();
        for _ in 0..3 {
            analytics.record(&TypedError::not_found("x"), None);
        }
        analytics.record(&TypedError::authentication(), None);
        let top = analytics.top5();
        assert_eq!(top[0].0, "NotFound");
        assert_eq!(top[0].1, 3);
    }
}
