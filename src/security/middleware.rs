//! Security middleware — authentication, authorization, CORS, and rate limiting.
//!
//! This module provides middleware implementations for common HTTP security concerns.
//! Currently implemented:
//!
//! - [`CorsMiddleware`] — Cross-Origin Resource Sharing header injection and
//!   preflight (`OPTIONS`) short-circuiting.
//!
//! ## Planned Features
//!
//! - JWT authentication middleware
//! - API key validation
//! - Per-route rate limiting (token bucket / sliding window)
//! - CSRF protection
//! - Secure header injection (HSTS, CSP, X-Frame-Options)

use std::pin::Pin;

use crate::{
    Response,
    context::Context,
    middleware::{Middleware, Next},
};

/// CORS middleware — validates the `Origin` header, handles preflight requests,
/// and injects `Access-Control-*` headers on actual responses.
///
/// Constructed via [`CorsMiddleware::new`] and further configured through the
/// builder methods [`allow_origin`](Self::allow_origin),
/// [`allow_method`](Self::allow_method), and [`allow_header`](Self::allow_header).
///
/// # Behavior
///
/// - If no `Origin` header is present the request passes through unmodified.
/// - If the origin is not in the allow-list the request passes through unmodified.
/// - `OPTIONS` preflight requests are short-circuited with `204 No Content` and the
///   appropriate `Access-Control-*` headers; the downstream handler is **not** called.
/// - For all other requests the handler runs normally and the CORS headers are appended
///   to the response.
/// - When the wildcard origin `"*"` is used, a `Vary: Origin` header is **not** added;
///   for specific origins it is added to ensure correct cache behavior.
///
/// # Examples
///
/// ```rust,no_run
/// use genesis_kernel::security::CorsMiddleware;
///
/// let cors = CorsMiddleware::new()
///     .allow_origin("https://example.com")
///     .allow_method("PATCH")
///     .allow_header("X-Custom-Header");
/// ```
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
    exposed_headers: Vec<String>,
    credentials: bool,
    max_age: u64,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl CorsMiddleware {
    /// Creates a new `CorsMiddleware` with permissive defaults:
    /// all origins (`*`), common methods, and common headers.
    ///
    /// The defaults are:
    ///
    /// | Setting          | Default value                          |
    /// |------------------|----------------------------------------|
    /// | Allowed origins  | `*` (all origins)                      |
    /// | Allowed methods  | `GET`, `POST`, `PUT`, `DELETE`         |
    /// | Allowed headers  | `Content-Type`, `Authorization`        |
    ///
    /// # Examples
    ///
    /// ```rust
    /// use genesis_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new();
    /// ```
    pub fn new() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec![
                "GET".to_string(),
                "POST".to_string(),
                "PUT".to_string(),
                "DELETE".to_string(),
            ],
            allowed_headers: vec!["Content-Type".to_string(), "Authorization".to_string()],
            exposed_headers: Vec::new(),
            credentials: false,
            max_age: 3600,
        }
    }

    /// Adds an allowed origin.
    ///
    /// Pass `"*"` to permit all origins. When the allow-list contains `"*"`,
    /// every `Origin` value is accepted and the response carries
    /// `Access-Control-Allow-Origin: *`.
    ///
    /// # Arguments
    ///
    /// - `origin` — a URL origin string (e.g. `"https://example.com"`) or `"*"`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use genesis_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new()
    ///     .allow_origin("https://app.example.com")
    ///     .allow_origin("https://staging.example.com");
    /// ```
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Adds an allowed HTTP method.
    ///
    /// The method string is sent verbatim in the
    /// `Access-Control-Allow-Methods` response header. Use standard uppercase
    /// method names such as `"PATCH"` or `"OPTIONS"`.
    ///
    /// # Arguments
    ///
    /// - `method` — an HTTP method name (e.g. `"PATCH"`).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use genesis_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new().allow_method("PATCH");
    /// ```
    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    /// Adds an allowed request header.
    ///
    /// The header name is sent verbatim in the
    /// `Access-Control-Allow-Headers` response header.
    ///
    /// # Arguments
    ///
    /// - `header` — an HTTP header name (e.g. `"X-Request-ID"`).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use genesis_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new().allow_header("X-Request-ID");
    /// ```
    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Adds a header name to `Access-Control-Expose-Headers`, making it
    /// readable from client-side script on an actual (non-preflight) response.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use genesis_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new().expose_header("X-Request-ID");
    /// ```
    #[must_use]
    pub fn expose_header(mut self, header: impl Into<String>) -> Self {
        self.exposed_headers.push(header.into());
        self
    }

    /// Enables `Access-Control-Allow-Credentials: true`. Per the CORS
    /// protocol, a credentialed response can never carry a wildcard
    /// `Access-Control-Allow-Origin`, so enabling this always echoes the
    /// request's actual `Origin` back instead of `*`, even when `"*"` is in
    /// the allow-list.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use genesis_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new().allow_credentials(true);
    /// ```
    #[must_use]
    pub fn allow_credentials(mut self, credentials: bool) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets the `Access-Control-Max-Age` value (seconds) sent on preflight
    /// responses. Defaults to `3600`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use genesis_kernel::security::CorsMiddleware;
    ///
    /// let cors = CorsMiddleware::new().max_age(600);
    /// ```
    #[must_use]
    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = seconds;
        self
    }

    /// Builds a `CorsMiddleware` from the `ALLOWED_ORIGINS` environment
    /// variable: development permits `*` when it is unset, production
    /// requires the comma-separated allowlist.
    pub fn from_env(environment: crate::error::Environment) -> Self {
        let allowed = std::env::var("ALLOWED_ORIGINS").ok();
        match (environment, allowed) {
            (_, Some(origins)) => {
                let mut cors = Self::new();
                cors.allowed_origins.clear();
                cors.allowed_origins
                    .extend(origins.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()));
                cors
            }
            (crate::error::Environment::Production, None) => {
                tracing::warn!("ALLOWED_ORIGINS not set in production; no origins will be permitted");
                let mut cors = Self::new();
                cors.allowed_origins.clear();
                cors
            }
            (_, None) => Self::new(),
        }
    }
}

impl Middleware for CorsMiddleware {
    /// Process a request through the CORS policy and return the appropriate response.
    ///
    /// Inspects the `Origin` request header and applies one of three strategies:
    ///
    /// 1. **No origin / rejected origin** — passes the request to the next handler
    ///    unchanged.
    /// 2. **Preflight (`OPTIONS`)** — short-circuits with `204 No Content` and the
    ///    `Access-Control-Allow-Origin`, `Access-Control-Allow-Methods`,
    ///    `Access-Control-Allow-Headers`, and `Access-Control-Max-Age` headers set,
    ///    plus `Access-Control-Allow-Credentials` when enabled.
    ///    The downstream handler is **not** called.
    /// 3. **Actual request** — calls the next handler and appends
    ///    `Access-Control-Allow-Origin`, `Access-Control-Allow-Methods`,
    ///    `Access-Control-Allow-Headers`, and (when configured)
    ///    `Access-Control-Allow-Credentials` / `Access-Control-Expose-Headers`
    ///    to its response. A `Vary: Origin` header is added when a specific
    ///    (non-wildcard) origin is echoed back.
    /// 4. **Credentials** — when enabled, the wildcard origin is never sent;
    ///    the request's actual `Origin` is echoed back instead, since a
    ///    credentialed response cannot carry `Access-Control-Allow-Origin: *`.
    ///
    /// # Arguments
    ///
    /// - `ctx` — the per-request [`Context`] carrying the HTTP method, headers, path,
    ///   and extensions.
    /// - `next` — the remainder of the middleware chain; invoke [`Next::run`] to
    ///   forward the request to the next layer.
    ///
    /// # Returns
    ///
    /// A [`Response`] with CORS headers applied, or the unmodified downstream
    /// response when the origin check does not pass.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let allowed_origins = self.allowed_origins.clone();
        let allowed_methods = self.allowed_methods.clone();
        let allowed_headers = self.allowed_headers.clone();
        let exposed_headers = self.exposed_headers.clone();
        let credentials = self.credentials;
        let max_age = self.max_age;

        Box::pin(async move {
            let request_origin = ctx.request().headers().get("origin").map(str::to_owned);
            let is_preflight = ctx.request().method() == &crate::Method::Options;
            let Some(origin) = request_origin else {
                return next.run(ctx).await;
            };

            let wildcard_allowed = allowed_origins.iter().any(|o| o == "*");
            // A credentialed response can never carry a wildcard origin, so
            // credentials forces the actual `Origin` to be echoed back.
            let allow_origin = if wildcard_allowed && !credentials {
                "*".to_owned()
            } else if wildcard_allowed || allowed_origins.contains(&origin) {
                origin.clone()
            } else {
                return next.run(ctx).await;
            };

            let methods_str = allowed_methods.join(", ");
            let headers_str = allowed_headers.join(", ");
            let exposed_str = exposed_headers.join(", ");
            let is_wildcard = allow_origin == "*";

            if is_preflight {
                let mut resp = Response::new(crate::StatusCode::NoContent)
                    .header("Access-Control-Allow-Origin", &allow_origin)
                    .header("Access-Control-Allow-Methods", &methods_str)
                    .header("Access-Control-Allow-Headers", &headers_str)
                    .header("Access-Control-Max-Age", max_age.to_string());
                if !is_wildcard {
                    resp.add_header("Vary", "Origin");
                }
                if credentials {
                    resp.add_header("Access-Control-Allow-Credentials", "true");
                }
                return resp;
            }

            let mut resp = next.run(ctx).await;
            resp.add_header("Access-Control-Allow-Origin", &allow_origin);
            resp.add_header("Access-Control-Allow-Methods", &methods_str);
            resp.add_header("Access-Control-Allow-Headers", &headers_str);
            if !is_wildcard {
                resp.add_header("Vary", "Origin");
            }
            if credentials {
                resp.add_header("Access-Control-Allow-Credentials", "true");
            }
            if !exposed_str.is_empty() {
                resp.add_header("Access-Control-Expose-Headers", &exposed_str);
            }
            resp
        })
    }
}
