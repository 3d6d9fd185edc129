//! Request/response logging subsystem: level hierarchy, log line formats,
//! header/object sanitisers, a bounded history ring, and slow-request
//! detection.
//!
//! This is a distinct product feature from the crate's own `tracing`
//! diagnostics (accept-loop events, restart events): `tracing` covers the
//! machinery's own operation, this module is the request/response logger with
//! its own sinks (console, `./logs/*.log`, remote HTTP via [`remote`]).

pub mod remote;

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;

use crate::context::Context;
use crate::error::extract_client_ip;
use crate::{Method, StatusCode};

/// `debug < info < warn < error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn tag(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "x-access-token",
    "proxy-authorization",
    "www-authenticate",
];

const SENSITIVE_KEY_SUBSTRINGS: &[&str] = &["password", "token", "secret", "key", "auth"];

const OBJECT_SANITIZE_MAX_DEPTH: usize = 3;
const NON_SENSITIVE_HEADER_TRUNCATE: usize = 200;
const HISTORY_CAPACITY: usize = 100;
const SLOW_REQUEST_THRESHOLD_MS: u64 = 1000;

/// Redacts a single header value: sensitive header names are
/// either fully hidden (value length ≤ 10) or revealed as `first4…last4`
/// (length > 10); non-sensitive values are passed through truncated to 200
/// chars. The header name is normalised to lowercase either way.
pub fn sanitize_header(name: &str, value: &str) -> (String, String) {
    let lower = name.to_ascii_lowercase();
    if SENSITIVE_HEADERS.contains(&lower.as_str()) {
        let redacted = if value.len() <= 10 {
            "[HIDDEN]".to_string()
        } else {
            format!("{}…{}", &value[..4], &value[value.len() - 4..])
        };
        (lower, redacted)
    } else {
        let truncated = if value.len() > NON_SENSITIVE_HEADER_TRUNCATE {
            format!("{}...", &value[..NON_SENSITIVE_HEADER_TRUNCATE])
        } else {
            value.to_string()
        };
        (lower, truncated)
    }
}

/// Sanitises every header in `headers`, returning `{lowercased-name: value}` pairs.
pub fn sanitize_headers(headers: &crate::Headers) -> serde_json::Map<String, serde_json::Value> {
    headers
        .iter()
        .map(|(name, value)| {
            let (name, value) = sanitize_header(name, value);
            (name, serde_json::Value::String(value))
        })
        .collect()
}

/// Recursively redacts any object key containing a case-insensitive substring
/// of `password`/`token`/`secret`/`key`/`auth`, up to `max_depth`. Beyond the
/// depth limit, nested values are left untouched — the depth limit is the
/// only cycle guard.
pub fn sanitize_object(value: &serde_json::Value, max_depth: usize) -> serde_json::Value {
    sanitize_object_at(value, max_depth)
}

fn sanitize_object_at(value: &serde_json::Value, depth_remaining: usize) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            if depth_remaining == 0 {
                return value.clone();
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                let lower = key.to_ascii_lowercase();
                if SENSITIVE_KEY_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
                    out.insert(key.clone(), serde_json::Value::String("[HIDDEN]".to_string()));
                } else {
                    out.insert(key.clone(), sanitize_object_at(v, depth_remaining - 1));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            if depth_remaining == 0 {
                return value.clone();
            }
            serde_json::Value::Array(items.iter().map(|v| sanitize_object_at(v, depth_remaining - 1)).collect())
        }
        other => other.clone(),
    }
}

/// One entry in the bounded history ring.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<Utc>,
    pub level: Level,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

/// Runtime configuration surface: environment, minimum level, and whether to
/// log request/response bodies.
#[derive(Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub log_requests: bool,
    pub log_responses: bool,
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let level = match std::env::var("LOG_LEVEL").unwrap_or_default().to_ascii_lowercase().as_str() {
            "debug" => Level::Debug,
            "warn" => Level::Warn,
            "error" => Level::Error,
            _ => Level::Info,
        };
        Self {
            level,
            log_requests: true,
            log_responses: true,
        }
    }
}

/// The request/response logger: level-filtered emission, a bounded history
/// ring, and slow-request detection.
pub struct Logger {
    config: LoggingConfig,
    history: Mutex<VecDeque<LogEntry>>,
}

impl Logger {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self, level: Level, message: String, metadata: Option<serde_json::Value>) {
        if level < self.config.level {
            return;
        }
        let timestamp = Utc::now();
        let line = format_line(timestamp, level, &message, metadata.as_ref());
        match level {
            Level::Error => tracing::error!("{line}"),
            Level::Warn => tracing::warn!("{line}"),
            Level::Info => tracing::info!("{line}"),
            Level::Debug => tracing::debug!("{line}"),
        }

        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(LogEntry { timestamp, level, message, metadata });
    }

    pub fn history(&self) -> Vec<LogEntry> {
        self.history.lock().unwrap().iter().cloned().collect()
    }

    /// Emits the `REQ` line plus, at debug level, a structured "Request
    /// Details" entry with sanitised headers/client IP/user-agent/query.
    pub fn log_request(&self, ctx: &Context) {
        if !self.config.log_requests {
            return;
        }
        let req = ctx.request();
        let path_and_query = match req.query_string() {
            Some(q) => format!("{}?{q}", req.path()),
            None => req.path().to_string(),
        };
        self.record(
            Level::Info,
            format!("REQ {:<6} {}", req.method().as_str(), path_and_query),
            None,
        );

        if self.config.level == Level::Debug {
            let details = serde_json::json!({
                "headers": sanitize_headers(req.headers()),
                "clientIp": extract_client_ip(ctx),
                "userAgent": req.headers().get("user-agent"),
                "query": req.query_string(),
            });
            self.record(Level::Debug, "Request Details".to_string(), Some(details));
        }
    }

    /// Emits the `RES` line and, if the request took longer than 1000ms, an
    /// additional warn-level slow-request entry.
    pub fn log_response(&self, method: &Method, path: &str, status: StatusCode, duration_ms: u64, request_id: Option<&str>) {
        if !self.config.log_responses {
            return;
        }
        self.record(
            Level::Info,
            format!(
                "RES {:<6} {} {} {}ms [{}]",
                method.as_str(),
                path,
                status.as_u16(),
                duration_ms,
                request_id.unwrap_or("-")
            ),
            None,
        );

        if duration_ms > SLOW_REQUEST_THRESHOLD_MS {
            self.record(
                Level::Warn,
                format!(
                    "slow request: {} {} took {}ms [{}]",
                    method.as_str(),
                    path,
                    duration_ms,
                    request_id.unwrap_or("-")
                ),
                None,
            );
        }
    }
}

fn format_line(
    timestamp: chrono::DateTime<Utc>,
    level: Level,
    message: &str,
    metadata: Option<&serde_json::Value>,
) -> String {
    let ts = timestamp.format("%Y-%m-%d %H:%M:%S");
    match metadata {
        Some(meta) => format!("[{ts}] {} {message} {meta}", level.tag()),
        None => format!("[{ts}] {} {message}", level.tag()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_short_header_fully_hidden() {
        let (_, v) = sanitize_header("Authorization", "short");
        assert_eq!(v, "[HIDDEN]");
    }

    #[test]
    fn sensitive_long_header_partially_revealed() {
        let (name, v) = sanitize_header("X-API-Key", "abcdefghijklmnop");
        assert_eq!(name, "x-api-key");
        assert_eq!(v, "abcd…mnop");
    }

    #[test]
    fn non_sensitive_header_truncated_at_200() {
        let long = "x".repeat(250);
        let (_, v) = sanitize_header("X-Custom", &long);
        assert_eq!(v.len(), 203); // 200 chars + "..."
    }

    #[test]
    fn object_sanitiser_redacts_key_substrings() {
        let input = serde_json::json!({"password": "hunter2", "name": "ok"});
        let out = sanitize_object(&input, OBJECT_SANITIZE_MAX_DEPTH);
        assert_eq!(out["password"], "[HIDDEN]");
        assert_eq!(out["name"], "ok");
    }

    #[test]
    fn object_sanitiser_respects_depth_limit() {
        let input = serde_json::json!({"a": {"b": {"c": {"token": "secretvalue"}}}});
        let out = sanitize_object(&input, 2);
        // depth 2 means "a"(1) -> "b"(2) -> "c" object untouched
        assert!(out["a"]["b"]["c"].get("token").is_some());
        assert_eq!(out["a"]["b"]["c"]["token"], "secretvalue");
    }

    #[test]
    fn level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn history_is_bounded() {
        let logger = Logger::new(LoggingConfig { level: Level::Debug, log_requests: true, log_responses: true });
        for i in 0..(HISTORY_CAPACITY + 5) {
            logger.record(Level::Info, format!("entry {i}"), None);
        }
        assert_eq!(logger.history().len(), HISTORY_CAPACITY);
    }
}
