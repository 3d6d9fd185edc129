//! Health-check middleware: intercepts a configured path (default
//! `/health`) and reports aggregate health from a set of pluggable checks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use chrono::Utc;

use crate::{
    context::Context,
    middleware::{Middleware, Next},
    Response, StatusCode,
};

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub ok: bool,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

/// A pluggable liveness/readiness probe, e.g. "can we reach the database".
pub type HealthCheck = Arc<dyn Fn() -> CheckResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Intercepts `path` and returns `{status, uptimeSeconds, timestamp, checks}`.
///
/// `status` is `unhealthy` if any check fails, `degraded` if a check is slow
/// (>200ms) without failing, `healthy` otherwise.
pub struct HealthCheckMiddleware {
    path: String,
    checks: Vec<(String, HealthCheck)>,
    started_at: StdInstant,
}

impl HealthCheckMiddleware {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            checks: Vec::new(),
            started_at: StdInstant::now(),
        }
    }

    #[must_use]
    pub fn check(mut self, name: impl Into<String>, check: HealthCheck) -> Self {
        self.checks.push((name.into(), check));
        self
    }
}

impl Default for HealthCheckMiddleware {
    fn default() -> Self {
        Self::new("/health")
    }
}

impl Middleware for HealthCheckMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        if ctx.request().path() != self.path {
            return Box::pin(next.run(ctx));
        }

        let uptime = self.started_at.elapsed().as_secs();
        let results: Vec<(String, CheckResult)> = self
            .checks
            .iter()
            .map(|(name, check)| (name.clone(), check()))
            .collect();

        Box::pin(async move {
            let any_failed = results.iter().any(|(_, r)| !r.ok);
            let any_slow = results.iter().any(|(_, r)| r.ok && r.latency_ms > 200);
            let status = if any_failed {
                HealthStatus::Unhealthy
            } else if any_slow {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            };

            let checks_json: serde_json::Map<String, serde_json::Value> = results
                .into_iter()
                .map(|(name, result)| (name, serde_json::to_value(result).unwrap()))
                .collect();

            let body = serde_json::json!({
                "status": status,
                "uptimeSeconds": uptime,
                "timestamp": Utc::now().to_rfc3339(),
                "checks": checks_json,
            });

            let http_status = if status == HealthStatus::Unhealthy {
                StatusCode::ServiceUnavailable
            } else {
                StatusCode::Ok
            };

            Response::new(http_status)
                .header("Content-Type", "application/json")
                .body(body.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;
    use crate::middleware::{compose, from_middleware, terminal};

    fn make_request(path: &str) -> Context {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Context::new(Request::parse(raw.as_bytes()).unwrap().0)
    }

    #[tokio::test]
    async fn healthy_with_no_checks() {
        let mw = HealthCheckMiddleware::new("/health");
        let chain = vec![from_middleware(Arc::new(mw))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Ok) }));
        let resp = composed(make_request("/health")).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        let text = String::from_utf8(resp.into_bytes().to_vec()).unwrap();
        assert!(text.contains("\"status\":\"healthy\""));
    }

    #[tokio::test]
    async fn unhealthy_when_a_check_fails() {
        let mw = HealthCheckMiddleware::new("/health").check(
            "db",
            Arc::new(|| CheckResult { ok: false, latency_ms: 5, detail: Some("connection refused".into()) }),
        );
        let chain = vec![from_middleware(Arc::new(mw))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Ok) }));
        let resp = composed(make_request("/health")).await;
        assert_eq!(resp.status(), StatusCode::ServiceUnavailable);
    }

    #[tokio::test]
    async fn passes_through_other_paths() {
        let mw = HealthCheckMiddleware::new("/health");
        let chain = vec![from_middleware(Arc::new(mw))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Created) }));
        let resp = composed(make_request("/other")).await;
        assert_eq!(resp.status(), StatusCode::Created);
    }
}
