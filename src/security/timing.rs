//! Timing middleware: records a monotonic start time, runs `next`, and
//! appends `X-Response-Time: Nms`.

use std::future::Future;
use std::pin::Pin;

use tokio::time::Instant;

use crate::{
    context::Context,
    middleware::{Middleware, Next},
    Response,
};

pub struct TimingMiddleware;

impl Middleware for TimingMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let mut resp = next.run(ctx).await;
            let elapsed_ms = start.elapsed().as_millis();
            resp.add_header("X-Response-Time", format!("{elapsed_ms}ms"));
            resp
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;
    use crate::middleware::{compose, from_middleware, terminal};
    use crate::StatusCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn appends_response_time_header() {
        let req = Request::parse(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap().0;
        let chain = vec![from_middleware(Arc::new(TimingMiddleware))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Ok) }));
        let resp = composed(Context::new(req)).await;
        let text = String::from_utf8(resp.into_bytes().to_vec()).unwrap();
        assert!(text.contains("X-Response-Time:"));
    }
}
