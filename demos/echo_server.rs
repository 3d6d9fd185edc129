//! Standalone HTTP server demo: a router with a couple of routes and the
//! full middleware stack (request IDs, security headers, timing, error
//! handling, performance sampling), bound directly with [`Server`] — no
//! kernel, no supervision. Useful for exercising the HTTP half in isolation.

use std::sync::Arc;

use genesis_kernel::body::{parse_body, schema, validate, Rule};
use genesis_kernel::context::{state_keys, Context};
use genesis_kernel::error::{
    handle_caught_error, ErrorAnalytics, ErrorMiddleware, ErrorMiddlewareConfig, TypedError,
};
use genesis_kernel::middleware::from_middleware;
use genesis_kernel::perf::{metrics_handler, PerformanceMiddleware, PerformanceMonitor};
use genesis_kernel::router::Router;
use genesis_kernel::security::{RequestIdMiddleware, SecurityHeadersMiddleware, TimingMiddleware};
use genesis_kernel::{Response, Server, StatusCode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let monitor = Arc::new(PerformanceMonitor::new());
    let error_cfg = Arc::new(ErrorMiddlewareConfig::from_env());
    let analytics = Arc::new(ErrorAnalytics::new());

    let mut router = Router::new();
    router.use_mw(from_middleware(Arc::new(ErrorMiddleware::new(
        error_cfg.clone(),
        analytics.clone(),
        None,
    ))));
    router.use_mw(from_middleware(Arc::new(RequestIdMiddleware)));
    router.use_mw(from_middleware(Arc::new(SecurityHeadersMiddleware::from_env())));
    router.use_mw(from_middleware(Arc::new(TimingMiddleware)));
    router.use_mw(from_middleware(Arc::new(PerformanceMiddleware::new(monitor.clone()))));

    router.get("/", |_ctx: Context| async { Response::new(StatusCode::Ok).body("Hello, World!") });

    router.post("/echo", {
        let error_cfg = error_cfg.clone();
        let analytics = analytics.clone();
        move |mut ctx: Context| {
            let error_cfg = error_cfg.clone();
            let analytics = analytics.clone();
            async move {
                if let Err(err) = parse_body(&mut ctx) {
                    return handle_caught_error(err, &error_cfg, &analytics, None, None, None);
                }

                let echo_schema = schema([("message", Rule::required_string().min_length(1))]);
                let body_value = ctx
                    .state()
                    .get(state_keys::BODY)
                    .and_then(|v| v.as_json())
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                let violations = validate(&body_value, &echo_schema);
                if !violations.is_empty() {
                    let err = TypedError::with_validation_details(violations);
                    return handle_caught_error(err, &error_cfg, &analytics, None, None, None);
                }

                Response::new(StatusCode::Ok)
                    .header("Content-Type", "application/json")
                    .body(body_value.to_string())
            }
        }
    });

    router.get("/metrics", move |ctx: Context| {
        let monitor = monitor.clone();
        async move { metrics_handler(monitor, ctx).await }
    });

    let router = Arc::new(router);
    let addr = std::env::var("ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let server = Server::bind(&addr).await?;
    println!("listening on http://{addr}");
    server.serve(router).await?;
    Ok(())
}
