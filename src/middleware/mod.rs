//! Middleware pipeline — composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] — converts a [`Middleware`] trait object into a
//!   [`MiddlewareHandler`].
//! - [`LoggerMiddleware`] — built-in request/response logger.
//!
//! ## Planned Features
//!
//! - Ordered middleware stack execution
//! - Request transformation (header injection, body modification)
//! - Response transformation (compression, caching headers)
//! - Short-circuit responses (auth checks, rate limiting)
//! - Async-first middleware trait

use std::{
    future::Future,
    pin::Pin,
    sync::{atomic::{AtomicBool, Ordering}, Arc},
};
use tokio::time::Instant;

use crate::error::NEXT_CALLED_TWICE_BODY_TYPE;
use crate::{Response, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware (or returns a fallback `500` response when the chain is exhausted
/// without any middleware generating a response).
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation without first cloning it. A clone
/// shares the original's invocation flag, so a second `run()` call — whether
/// on the original or on a clone taken before the first call — is detected and
/// fails with a `500` "next() called multiple times" response rather than
/// silently replaying the remainder of the chain.
///
/// # Examples
///
/// ```rust,no_run
/// use std::pin::Pin;
/// use genesis_kernel::{Response, context::Context, middleware::{Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(
///         &self,
///         ctx: Context,
///         next: Next,
///     ) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    // Shared across clones: flips to `true` on the first `run()`, so a second
    // call on a clone taken before that point is caught instead of replaying
    // the chain.
    invoked: Arc<AtomicBool>,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
///
/// Construct one with [`from_middleware`] or by wrapping a closure directly:
///
/// ```rust,no_run
/// use std::{pin::Pin, sync::Arc};
/// use genesis_kernel::{Response, context::Context, middleware::{MiddlewareHandler, Next}};
///
/// let handler: MiddlewareHandler = Arc::new(|ctx: Context, next: Next| {
///     Box::pin(async move { next.run(ctx).await })
/// });
/// ```
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Arguments
///
/// - `middleware` — a reference-counted [`Middleware`] to wrap.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use genesis_kernel::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    ///
    /// # Arguments
    ///
    /// - `middlewares` — the ordered list of handlers that make up the pipeline.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use genesis_kernel::middleware::Next;
    ///
    /// let next = Next::new(vec![]);
    /// ```
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
            invoked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// Advances the internal cursor by one, clones the handler at the current
    /// position, and awaits it. If no handler remains (i.e. the chain is
    /// exhausted without producing a response), a `500 Internal Server Error`
    /// response is returned as a safe fallback.
    ///
    /// The first call flips this cursor's `invoked` flag. Any further call on
    /// the same cursor or on a clone of it taken before that point observes
    /// the flag already set and fails deterministically instead of re-running
    /// the remainder of the chain.
    ///
    /// # Arguments
    ///
    /// - `ctx` — the per-request [`Context`] to pass to the next middleware.
    ///
    /// # Returns
    ///
    /// The [`Response`] produced by the next middleware or handler in the chain.
    pub async fn run(self, ctx: Context) -> Response {
        if self.invoked.swap(true, Ordering::SeqCst) {
            return next_called_twice_response();
        }

        let Next { middlewares, index, .. } = self;
        if index < middlewares.len() {
            let handler = middlewares[index].clone();
            let next = Next {
                middlewares,
                index: index + 1,
                invoked: Arc::new(AtomicBool::new(false)),
            };
            handler(ctx, next).await
        } else {
            Response::new(crate::StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// Standard JSON body returned when a middleware invokes `next()` more than once.
fn next_called_twice_response() -> Response {
    let body = serde_json::json!({
        "error": {
            "message": "next() called multiple times",
            "type": NEXT_CALLED_TWICE_BODY_TYPE,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "requestId": serde_json::Value::Null,
        }
    });
    Response::new(crate::StatusCode::InternalServerError)
        .header("Content-Type", "application/json")
        .body(body.to_string())
}

/// The core trait for all genesis-kernel middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through** — call `next.run(ctx).await` without modification.
/// - **Short-circuit** — return a [`Response`] directly without calling `next`.
/// - **Decorate** — call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold `&mut` references to shared state across
///   an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    ///
    /// # Arguments
    ///
    /// - `ctx` — the per-request [`Context`] carrying the HTTP method, headers,
    ///   path, path parameters, and extensions.
    /// - `next` — cursor into the remainder of the middleware chain; call
    ///   [`Next::run`] to forward the request.
    ///
    /// # Returns
    ///
    /// A [`Response`] — either produced by this middleware directly (short-circuit)
    /// or forwarded from a downstream handler.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// A type-erased handler taking only a [`Context`] — the shape a composed
/// middleware chain reduces to once there is no more `next` to pass along.
pub type ComposedHandler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Wraps a plain `Fn(Context) -> Future<Output = Response>` handler as the
/// terminal [`MiddlewareHandler`] of a chain — it ignores the `next` it is
/// handed because there is nothing left to delegate to.
pub fn terminal<H, F>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |ctx: Context, _next: Next| Box::pin(handler(ctx)))
}

/// Composes an ordered list of middleware into a single [`ComposedHandler`].
///
/// `compose(middlewares, final_handler)` returns a handler that, given a
/// [`Context`], invokes `middlewares[0]` with a [`Next`] that dispatches
/// `middlewares[1]`, and so on, terminating in `final_handler`.
///
/// Calling `next()` more than once is rejected: [`Next::run`] takes `self` by
/// value, so a second call requires cloning the cursor first, and the clone
/// shares the original's invocation flag. Whichever call reaches `run()`
/// second — original or clone — observes the flag already set and gets back
/// a `500` "next() called multiple times" response instead of re-running the
/// remainder of the chain.
pub fn compose(middlewares: Vec<MiddlewareHandler>, final_handler: MiddlewareHandler) -> ComposedHandler {
    let mut chain = middlewares;
    chain.push(final_handler);
    Arc::new(move |ctx: Context| {
        let next = Next::new(chain.clone());
        Box::pin(async move { next.run(ctx).await })
    })
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Emits a single `tracing::info!` line after the downstream handler completes,
/// in the format:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
///
/// `LoggerMiddleware` does not short-circuit; it always delegates to the next
/// middleware and decorates the response timing after the fact.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use genesis_kernel::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    /// Log the request method, path, response status, and elapsed time.
    ///
    /// Captures the start time before delegating to the next middleware, then
    /// emits a `tracing::info!` record once the response is available.
    ///
    /// # Arguments
    ///
    /// - `ctx` — the per-request [`Context`]; method and path are extracted
    ///   before `next` consumes it.
    /// - `next` — the remainder of the middleware chain.
    ///
    /// # Returns
    ///
    /// The unmodified [`Response`] returned by the downstream handler.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();

            tracing::info!("{} {} - {} ({:?})", method, path, status, duration);

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;
    use crate::{Response, StatusCode};
    use std::sync::Mutex;

    fn make_request() -> Context {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        Context::new(Request::parse(raw).unwrap().0)
    }

    fn tracing_mw(name: &'static str, trace: Arc<Mutex<Vec<String>>>) -> MiddlewareHandler {
        Arc::new(move |ctx: Context, next: Next| {
            let trace = trace.clone();
            Box::pin(async move {
                trace.lock().unwrap().push(format!("{name}-in"));
                let resp = next.run(ctx).await;
                trace.lock().unwrap().push(format!("{name}-out"));
                resp
            })
        })
    }

    #[tokio::test]
    async fn onion_order_in_then_reverse_out() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let trace_handler = trace.clone();
        let handler = terminal(move |_ctx| {
            let trace = trace_handler.clone();
            async move {
                trace.lock().unwrap().push("handler".to_string());
                Response::new(StatusCode::Ok)
            }
        });

        let chain = vec![
            tracing_mw("A", trace.clone()),
            tracing_mw("B", trace.clone()),
            tracing_mw("C", trace.clone()),
        ];
        let composed = compose(chain, handler);
        composed(make_request()).await;

        let recorded = trace.lock().unwrap().clone();
        assert_eq!(
            recorded,
            vec!["A-in", "B-in", "C-in", "handler", "C-out", "B-out", "A-out"]
        );
    }

    #[tokio::test]
    async fn exhausted_chain_yields_500() {
        let next = Next::new(vec![]);
        let resp = next.run(make_request()).await;
        assert_eq!(resp.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn compose_with_no_middleware_runs_handler_directly() {
        let handler = terminal(|_ctx| async { Response::new(StatusCode::Created) });
        let composed = compose(vec![], handler);
        let resp = composed(make_request()).await;
        assert_eq!(resp.status(), StatusCode::Created);
    }

    /// A misbehaving middleware that clones its `Next` before the first
    /// `run()` consumes it, then calls `run` on both. The clone shares the
    /// original's invocation flag, so the second call is rejected instead of
    /// replaying the chain.
    struct DoubleNextGuard;

    impl Middleware for DoubleNextGuard {
        fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(async move {
                let replay = next.clone();
                let first = next.run(ctx).await;
                let second = replay.run(make_request()).await;
                assert_eq!(second.status(), StatusCode::InternalServerError);
                first
            })
        }
    }

    #[tokio::test]
    async fn calling_next_twice_fails_instead_of_replaying_the_chain() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let trace_handler = trace.clone();
        let handler = terminal(move |_ctx| {
            let trace = trace_handler.clone();
            async move {
                trace.lock().unwrap().push("handler".to_string());
                Response::new(StatusCode::Ok)
            }
        });

        let chain = vec![from_middleware(Arc::new(DoubleNextGuard))];
        let composed = compose(chain, handler);
        let resp = composed(make_request()).await;

        // Only the first `run()` call reached the terminal handler; the
        // second was rejected before the handler ever ran again.
        assert_eq!(trace.lock().unwrap().as_slice(), ["handler"]);
        assert_eq!(resp.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn whichever_clone_runs_first_succeeds_the_other_fails() {
        let handler = terminal(|_ctx| async { Response::new(StatusCode::Created) });
        let next = Next::new(vec![handler]);
        let clone = next.clone();

        let first = clone.run(make_request()).await;
        let second = next.run(make_request()).await;

        assert_eq!(first.status(), StatusCode::Created);
        assert_eq!(second.status(), StatusCode::InternalServerError);
    }
}
