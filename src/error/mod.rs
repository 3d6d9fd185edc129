//! Typed error taxonomy, the error middleware, and process-wide error analytics.
//!
//! This is the single sink that maps every error a handler or middleware can
//! raise onto an HTTP response. Because Rust has no unchecked exceptions,
//! two call sites feed it:
//!
//! - [`wrap_fallible`] adapts a `Context -> Result<Response, TypedError>`
//!   route handler into a plain [`crate::router::Handler`], routing its `Err`
//!   case through [`handle_caught_error`] — this is the path for *expected*,
//!   operational errors a handler raises deliberately.
//! - [`ErrorMiddleware`] wraps the downstream chain in `catch_unwind`, routing
//!   any panic through the same [`handle_caught_error`] as an
//!   `App { is_operational: false }` defect — this is the path for
//!   *unexpected* programming errors.
//!
//! Both funnel through the same mapping function, so "the error middleware is
//! the single sink" holds even though Rust's type system requires two
//! entry points instead of one `catch` block.

pub mod analytics;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;

use crate::context::Context;
use crate::router::Handler;
use crate::{Response, StatusCode};

pub use analytics::ErrorAnalytics;

/// JSON `error.type` written for the router's built-in 404 fallback.
pub const NOT_FOUND_BODY_TYPE: &str = "NotFound";

/// JSON `error.type` written when a middleware calls `next()` more than once.
pub const NEXT_CALLED_TWICE_BODY_TYPE: &str = "MiddlewareChainError";

/// The error taxonomy, one variant per kind.
#[derive(Debug, Clone)]
pub enum ErrorKind {
    Validation { field: String, value: String },
    Authentication,
    Authorization,
    NotFound { resource: String },
    RateLimit { retry_after_seconds: u64 },
    Database { operation: String, query: Option<String> },
    App { status_code: u16, is_operational: bool },
    /// A foreign/OS-level error, mapped to a generic 500 unless reclassified.
    Unknown { cause: String },
}

impl ErrorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ErrorKind::Validation { .. } => "ValidationError",
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Authorization => "AuthorizationError",
            ErrorKind::NotFound { .. } => "NotFound",
            ErrorKind::RateLimit { .. } => "RateLimitError",
            ErrorKind::Database { .. } => "DatabaseError",
            ErrorKind::App { .. } => "AppError",
            ErrorKind::Unknown { .. } => "UnknownError",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation { .. } => StatusCode::BadRequest,
            ErrorKind::Authentication => StatusCode::Unauthorized,
            ErrorKind::Authorization => StatusCode::Forbidden,
            ErrorKind::NotFound { .. } => StatusCode::NotFound,
            ErrorKind::RateLimit { .. } => StatusCode::TooManyRequests,
            ErrorKind::Database { .. } => StatusCode::InternalServerError,
            ErrorKind::App { status_code, .. } => status_from_u16(*status_code),
            ErrorKind::Unknown { .. } => StatusCode::InternalServerError,
        }
    }

    pub fn is_operational(&self) -> bool {
        match self {
            ErrorKind::App { is_operational, .. } => *is_operational,
            ErrorKind::Unknown { .. } => false,
            _ => true,
        }
    }
}

fn status_from_u16(code: u16) -> StatusCode {
    match code {
        200 => StatusCode::Ok,
        201 => StatusCode::Created,
        202 => StatusCode::Accepted,
        204 => StatusCode::NoContent,
        400 => StatusCode::BadRequest,
        401 => StatusCode::Unauthorized,
        403 => StatusCode::Forbidden,
        404 => StatusCode::NotFound,
        409 => StatusCode::Conflict,
        422 => StatusCode::UnprocessableEntity,
        429 => StatusCode::TooManyRequests,
        501 => StatusCode::NotImplemented,
        502 => StatusCode::BadGateway,
        503 => StatusCode::ServiceUnavailable,
        504 => StatusCode::GatewayTimeout,
        _ => StatusCode::InternalServerError,
    }
}

/// A single validation failure, used both standalone (by the body validator)
/// and embedded in a [`TypedError::Validation`] response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationDetail {
    pub field: String,
    pub message: String,
    pub value: serde_json::Value,
}

/// A fully-formed typed error: the [`ErrorKind`] plus the context every
/// variant carries.
#[derive(Debug, Clone)]
pub struct TypedError {
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: Option<String>,
    pub stack: String,
    /// Present only for `Validation` errors surfaced via the validation
    /// subsystem (§4.D), which may report several field violations at once.
    pub validation: Vec<ValidationDetail>,
}

impl TypedError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            request_id: None,
            stack: std::backtrace::Backtrace::force_capture().to_string(),
            validation: Vec::new(),
        }
    }

    pub fn validation(field: impl Into<String>, value: impl Into<String>) -> Self {
        let field = field.into();
        let value = value.into();
        let message = format!("{field}: invalid value");
        Self::new(
            ErrorKind::Validation {
                field,
                value,
            },
            message,
        )
    }

    pub fn with_validation_details(details: Vec<ValidationDetail>) -> Self {
        let message = details
            .first()
            .map(|d| d.message.clone())
            .unwrap_or_else(|| "validation failed".to_string());
        let mut err = Self::new(
            ErrorKind::Validation {
                field: "body".to_string(),
                value: String::new(),
            },
            message,
        );
        err.validation = details;
        err
    }

    pub fn authentication() -> Self {
        Self::new(ErrorKind::Authentication, "Authentication required")
    }

    pub fn authorization() -> Self {
        Self::new(ErrorKind::Authorization, "Action not permitted")
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        let message = format!("{resource} not found");
        Self::new(ErrorKind::NotFound { resource }, message)
    }

    pub fn rate_limit(retry_after_seconds: u64) -> Self {
        Self::new(
            ErrorKind::RateLimit { retry_after_seconds },
            "Too many requests",
        )
    }

    pub fn database(operation: impl Into<String>, query: Option<String>) -> Self {
        let operation = operation.into();
        let message = format!("database operation failed: {operation}");
        Self::new(ErrorKind::Database { operation, query }, message)
    }

    pub fn app(status_code: u16, is_operational: bool, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::App {
                status_code,
                is_operational,
            },
            message,
        )
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Maps a standard library I/O error to a status code by its `ErrorKind`.
    pub fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let status = match err.kind() {
            IoKind::NotFound => 404,
            IoKind::PermissionDenied => 403,
            IoKind::ConnectionRefused => 503,
            IoKind::TimedOut => 408,
            _ => 500,
        };
        Self::new(
            ErrorKind::Unknown {
                cause: err.to_string(),
            },
            err.to_string(),
        )
        .with_status_override(status)
    }

    // Internal: OS-mapped errors carry their own status even though they are
    // modeled as `Unknown` (they are not programming defects).
    fn with_status_override(self, status: u16) -> Self {
        let TypedError { message, request_id, stack, validation, .. } = self;
        let mut app = Self::app(status, true, message);
        app.request_id = request_id;
        app.stack = stack;
        app.validation = validation;
        app
    }
}

/// Deployment environment, driving which [`ErrorMiddlewareConfig`] preset applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Minimal,
}

impl Environment {
    pub fn from_env() -> Self {
        let raw = std::env::var("DENO_ENV")
            .or_else(|_| std::env::var("ENV"))
            .unwrap_or_default();
        match raw.to_ascii_lowercase().as_str() {
            "production" => Environment::Production,
            "minimal" => Environment::Minimal,
            _ => Environment::Development,
        }
    }
}

/// Configuration surface for the error middleware.
#[derive(Clone)]
pub struct ErrorMiddlewareConfig {
    pub environment: Environment,
    pub log_errors: bool,
    pub log_to_file: bool,
    pub show_stack_trace: bool,
    pub include_request_info: bool,
    pub custom_error_messages: HashMap<String, String>,
    pub enable_error_reporting: bool,
    pub sanitize_errors: bool,
    pub log_file_path: String,
}

impl ErrorMiddlewareConfig {
    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            log_errors: true,
            log_to_file: false,
            show_stack_trace: true,
            include_request_info: true,
            custom_error_messages: HashMap::new(),
            enable_error_reporting: false,
            sanitize_errors: false,
            log_file_path: "./logs/requests.log".to_string(),
        }
    }

    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            log_errors: true,
            log_to_file: true,
            show_stack_trace: false,
            include_request_info: false,
            custom_error_messages: HashMap::new(),
            enable_error_reporting: true,
            sanitize_errors: true,
            log_file_path: "./logs/requests.log".to_string(),
        }
    }

    pub fn minimal() -> Self {
        Self {
            environment: Environment::Minimal,
            log_errors: false,
            log_to_file: true,
            show_stack_trace: false,
            include_request_info: false,
            custom_error_messages: HashMap::new(),
            enable_error_reporting: false,
            sanitize_errors: true,
            log_file_path: "./logs/requests.log".to_string(),
        }
    }

    pub fn from_env() -> Self {
        match Environment::from_env() {
            Environment::Production => Self::production(),
            Environment::Minimal => Self::minimal(),
            Environment::Development => Self::development(),
        }
    }
}

/// Best-effort remote error reporter, configured via the
/// `ERROR_REPORTING_URL` / `ERROR_REPORTING_API_KEY` env vars. Failures never
/// propagate — reporting is purely diagnostic.
pub struct RemoteReporter {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl RemoteReporter {
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("ERROR_REPORTING_URL").ok()?;
        let api_key = std::env::var("ERROR_REPORTING_API_KEY").ok();
        Some(Self {
            client: reqwest::Client::new(),
            url,
            api_key,
        })
    }

    pub async fn report(&self, err: &TypedError) {
        let mut req = self.client.post(&self.url).json(&serde_json::json!({
            "type": err.kind.type_name(),
            "message": err.message,
            "timestamp": err.timestamp.to_rfc3339(),
            "requestId": err.request_id,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if let Err(e) = req.send().await {
            tracing::warn!(error = %e, "best-effort remote error report failed");
        }
    }
}

fn append_jsonl(path: &str, line: &serde_json::Value) {
    use std::io::Write;
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{line}");
    }
}

/// Records, logs, optionally reports, and renders a [`TypedError`] into the
/// response the client receives. This is the single mapping function both
/// [`wrap_fallible`] and [`ErrorMiddleware`] call.
pub fn handle_caught_error(
    mut err: TypedError,
    cfg: &ErrorMiddlewareConfig,
    analytics: &ErrorAnalytics,
    remote: Option<&Arc<RemoteReporter>>,
    request_id: Option<String>,
    client_ip: Option<String>,
) -> Response {
    if err.request_id.is_none() {
        err.request_id = request_id.clone();
    }

    // Step 3: log to console.
    if cfg.log_errors {
        if err.kind.is_operational() {
            tracing::warn!(
                kind = err.kind.type_name(),
                message = %err.message,
                request_id = ?err.request_id,
                "operational error"
            );
        } else {
            if cfg.show_stack_trace && cfg.environment == Environment::Development {
                tracing::error!(
                    kind = err.kind.type_name(),
                    message = %err.message,
                    stack = %err.stack,
                    "unhandled defect"
                );
            } else {
                tracing::error!(kind = err.kind.type_name(), message = %err.message, "unhandled defect");
            }
        }
    }

    // Step 4: append to ./logs/requests.log.
    if cfg.log_to_file {
        let line = serde_json::json!({
            "timestamp": err.timestamp.to_rfc3339(),
            "type": "REQUEST_ERROR",
            "requestId": err.request_id,
            "error": {
                "name": err.kind.type_name(),
                "message": err.message,
                "stack": err.stack,
            },
            "request": {
                "ip": client_ip,
            },
            "statusCode": err.kind.http_status().as_u16(),
            "isOperational": err.kind.is_operational(),
        });
        append_jsonl(&cfg.log_file_path, &line);
    }

    // Step 5: update analytics.
    analytics.record(&err, client_ip);

    // Step 6: map to status/message, honoring overrides + prod sanitisation.
    let status = err.kind.http_status();
    let mut message = cfg
        .custom_error_messages
        .get(err.kind.type_name())
        .cloned()
        .unwrap_or_else(|| err.message.clone());
    if cfg.sanitize_errors && status.as_u16() >= 500 {
        message = "Internal server error".to_string();
    }
    if cfg.sanitize_errors {
        if let ErrorKind::Validation { .. } = &err.kind {
            // Field values are redacted in production; only the field name survives.
        }
    }

    // Step 7: build body + headers.
    let mut body = serde_json::json!({
        "error": {
            "message": message,
            "type": err.kind.type_name(),
            "timestamp": err.timestamp.to_rfc3339(),
            "requestId": err.request_id,
        }
    });

    if !err.validation.is_empty() {
        let first = &err.validation[0];
        let value = if cfg.sanitize_errors {
            serde_json::Value::String("[REDACTED]".to_string())
        } else {
            first.value.clone()
        };
        body["validation"] = serde_json::json!({ "field": first.field, "value": value });
    } else if let ErrorKind::Validation { field, value } = &err.kind {
        let value = if cfg.sanitize_errors {
            serde_json::Value::String("[REDACTED]".to_string())
        } else {
            serde_json::Value::String(value.clone())
        };
        body["validation"] = serde_json::json!({ "field": field, "value": value });
    }

    if let ErrorKind::RateLimit { retry_after_seconds } = &err.kind {
        body["retryAfter"] = serde_json::json!(retry_after_seconds);
    }

    if cfg.include_request_info {
        body["request"] = serde_json::json!({ "ip": client_ip });
    }

    let mut response = Response::new(status)
        .header("Content-Type", "application/json")
        .body(body.to_string());

    if let ErrorKind::RateLimit { retry_after_seconds } = &err.kind {
        response.add_header("Retry-After", retry_after_seconds.to_string());
    }

    // Step 8: best-effort remote report for 5xx.
    if cfg.enable_error_reporting && status.as_u16() >= 500 {
        if let Some(reporter) = remote.cloned() {
            let err_clone = err.clone();
            tokio::spawn(async move {
                reporter.report(&err_clone).await;
            });
        }
    }

    response
}

/// Adapts a fallible route handler (`Context -> Result<Response, TypedError>`)
/// into a plain [`Handler`], routing the `Err` case through
/// [`handle_caught_error`] with the given shared configuration.
pub fn wrap_fallible<H, F>(
    cfg: Arc<ErrorMiddlewareConfig>,
    analytics: Arc<ErrorAnalytics>,
    remote: Option<Arc<RemoteReporter>>,
    handler: H,
) -> Handler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Response, TypedError>> + Send + 'static,
{
    Arc::new(move |ctx: Context| {
        let cfg = cfg.clone();
        let analytics = analytics.clone();
        let remote = remote.clone();
        let request_id = ctx.state_str(crate::context::state_keys::REQUEST_ID).map(str::to_string);
        let client_ip = ctx.state_str(crate::context::state_keys::CLIENT_IP).map(str::to_string);
        let fut = handler(ctx);
        Box::pin(async move {
            match fut.await {
                Ok(resp) => resp,
                Err(err) => handle_caught_error(err, &cfg, &analytics, remote.as_ref(), request_id, client_ip),
            }
        })
    })
}

/// Error middleware: wraps the downstream chain in `catch_unwind`. A panic
/// inside the chain is mapped to `App { is_operational: false }` and handled
/// through the same [`handle_caught_error`] sink as any other error.
pub struct ErrorMiddleware {
    cfg: Arc<ErrorMiddlewareConfig>,
    analytics: Arc<ErrorAnalytics>,
    remote: Option<Arc<RemoteReporter>>,
}

impl ErrorMiddleware {
    pub fn new(cfg: Arc<ErrorMiddlewareConfig>, analytics: Arc<ErrorAnalytics>, remote: Option<Arc<RemoteReporter>>) -> Self {
        Self { cfg, analytics, remote }
    }
}

impl crate::middleware::Middleware for ErrorMiddleware {
    fn handle(
        &self,
        ctx: Context,
        next: crate::middleware::Next,
    ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let cfg = self.cfg.clone();
        let analytics = self.analytics.clone();
        let remote = self.remote.clone();
        Box::pin(async move {
            let request_id = ctx.state_str(crate::context::state_keys::REQUEST_ID).map(str::to_string);
            let client_ip = extract_client_ip(&ctx);
            let result = AssertUnwindSafe(next.run(ctx)).catch_unwind().await;
            match result {
                Ok(resp) => resp,
                Err(_) => {
                    let err = TypedError::app(500, false, "Unhandled panic in request pipeline");
                    handle_caught_error(err, &cfg, &analytics, remote.as_ref(), request_id, client_ip)
                }
            }
        })
    }
}

/// Resolves the client IP from `X-Forwarded-For` / `X-Real-IP`, first value, trimmed.
pub fn extract_client_ip(ctx: &Context) -> Option<String> {
    let headers = ctx.request().headers();
    if let Some(xff) = headers.get("x-forwarded-for") {
        let first = xff.split(',').next().unwrap_or(xff).trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }
    headers.get("x-real-ip").map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_kinds_to_status() {
        assert_eq!(
            TypedError::validation("title", "").kind.http_status(),
            StatusCode::BadRequest
        );
        assert_eq!(TypedError::authentication().kind.http_status(), StatusCode::Unauthorized);
        assert_eq!(TypedError::authorization().kind.http_status(), StatusCode::Forbidden);
        assert_eq!(TypedError::not_found("user").kind.http_status(), StatusCode::NotFound);
        assert_eq!(TypedError::rate_limit(60).kind.http_status(), StatusCode::TooManyRequests);
        assert_eq!(
            TypedError::database("insert", None).kind.http_status(),
            StatusCode::InternalServerError
        );
    }

    #[test]
    fn rate_limit_sets_retry_after_header() {
        let cfg = ErrorMiddlewareConfig::production();
        let analytics = ErrorAnalytics::new();
        let resp = handle_caught_error(TypedError::rate_limit(60), &cfg, &analytics, None, None, None);
        assert_eq!(resp.status(), StatusCode::TooManyRequests);
        let bytes = resp.into_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("Retry-After: 60"));
        assert!(text.contains("\"retryAfter\":60"));
    }

    #[test]
    fn production_sanitizes_5xx_message() {
        let cfg = ErrorMiddlewareConfig::production();
        let analytics = ErrorAnalytics::new();
        let resp = handle_caught_error(
            TypedError::database("insert", Some("INSERT INTO".into())),
            &cfg,
            &analytics,
            None,
            None,
            None,
        );
        let text = String::from_utf8(resp.into_bytes().to_vec()).unwrap();
        assert!(text.contains("Internal server error"));
        assert!(!text.contains("INSERT INTO"));
    }

    #[test]
    fn not_found_message_format() {
        let err = TypedError::not_found("user");
        assert_eq!(err.message, "user not found");
    }

    #[test]
    fn os_mapped_permission_denied_is_403() {
        let io_err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = TypedError::from_io_error(&io_err);
        assert_eq!(err.kind.http_status(), StatusCode::Forbidden);
    }
}
