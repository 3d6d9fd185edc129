//! Secure response headers: a fixed baseline plus an optional
//! `Content-Security-Policy` built from a directive→sources configuration.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::{
    context::Context,
    middleware::{Middleware, Next},
    Response,
};

/// Directive→sources mapping for the `Content-Security-Policy` header.
/// `BTreeMap` keeps directive order deterministic when the header is built.
#[derive(Debug, Clone, Default)]
pub struct ContentSecurityPolicy {
    directives: BTreeMap<String, Vec<String>>,
}

impl ContentSecurityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn directive(mut self, name: impl Into<String>, sources: impl IntoIterator<Item = &'static str>) -> Self {
        self.directives
            .insert(name.into(), sources.into_iter().map(str::to_string).collect());
        self
    }

    fn render(&self) -> Option<String> {
        if self.directives.is_empty() {
            return None;
        }
        Some(
            self.directives
                .iter()
                .map(|(name, sources)| format!("{name} {}", sources.join(" ")))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Sets a fixed security header baseline, plus a `Content-Security-Policy`
/// derived from the configured directives, plus `Strict-Transport-Security`
/// when running in production.
pub struct SecurityHeadersMiddleware {
    csp: ContentSecurityPolicy,
    is_production: bool,
}

impl SecurityHeadersMiddleware {
    pub fn new(csp: ContentSecurityPolicy, is_production: bool) -> Self {
        Self { csp, is_production }
    }

    pub fn from_env() -> Self {
        let is_production = crate::error::Environment::from_env() == crate::error::Environment::Production;
        let csp = ContentSecurityPolicy::new()
            .directive("default-src", ["'self'"])
            .directive("object-src", ["'none'"]);
        Self::new(csp, is_production)
    }
}

impl Middleware for SecurityHeadersMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let csp = self.csp.render();
        let is_production = self.is_production;
        Box::pin(async move {
            let mut resp = next.run(ctx).await;
            resp.add_header("X-Content-Type-Options", "nosniff");
            resp.add_header("X-Frame-Options", "DENY");
            resp.add_header("X-XSS-Protection", "1; mode=block");
            resp.add_header("Referrer-Policy", "strict-origin-when-cross-origin");
            if is_production {
                resp.add_header("Strict-Transport-Security", "max-age=31536000; includeSubDomains");
            }
            if let Some(csp) = &csp {
                resp.add_header("Content-Security-Policy", csp.clone());
            }
            resp
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;
    use crate::middleware::{compose, terminal};
    use crate::StatusCode;
    use std::sync::Arc;

    fn make_request() -> Context {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        Context::new(Request::parse(raw).unwrap().0)
    }

    #[tokio::test]
    async fn baseline_headers_always_present() {
        let mw = SecurityHeadersMiddleware::new(ContentSecurityPolicy::new(), false);
        let chain = vec![crate::middleware::from_middleware(Arc::new(mw))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Ok) }));
        let resp = composed(make_request()).await;
        let bytes = resp.into_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("X-Content-Type-Options: nosniff"));
        assert!(text.contains("X-Frame-Options: DENY"));
        assert!(!text.contains("Strict-Transport-Security"));
    }

    #[tokio::test]
    async fn hsts_only_in_production() {
        let mw = SecurityHeadersMiddleware::new(ContentSecurityPolicy::new(), true);
        let chain = vec![crate::middleware::from_middleware(Arc::new(mw))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Ok) }));
        let resp = composed(make_request()).await;
        let text = String::from_utf8(resp.into_bytes().to_vec()).unwrap();
        assert!(text.contains("Strict-Transport-Security"));
    }

    #[test]
    fn csp_renders_directives_in_order() {
        let csp = ContentSecurityPolicy::new()
            .directive("default-src", ["'self'"])
            .directive("img-src", ["'self'", "data:"]);
        assert_eq!(csp.render().unwrap(), "default-src 'self'; img-src 'self' data:");
    }
}
