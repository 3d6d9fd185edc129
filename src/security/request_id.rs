//! Request-ID middleware: generates a UUIDv4 when no inbound `X-Request-ID`
//! is provided, stashes it in scoped state, and always echoes it back as a
//! response header.

use std::future::Future;
use std::pin::Pin;

use uuid::Uuid;

use crate::{
    context::{state_keys, Context, StateValue},
    middleware::{Middleware, Next},
    Response,
};

pub struct RequestIdMiddleware;

impl Middleware for RequestIdMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let request_id = ctx
                .request()
                .headers()
                .get("x-request-id")
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());

            ctx.state_mut()
                .insert(state_keys::REQUEST_ID.to_string(), StateValue::Str(request_id.clone()));

            let mut resp = next.run(ctx).await;
            resp.add_header("X-Request-ID", request_id);
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

    fn make_request() -> Request {
        Request::parse(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap().0
    }

    #[tokio::test]
    async fn generates_uuid_when_absent() {
        let chain = vec![from_middleware(Arc::new(RequestIdMiddleware))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Ok) }));
        let resp = composed(Context::new(make_request())).await;
        let text = String::from_utf8(resp.into_bytes().to_vec()).unwrap();
        let header_line = text.lines().find(|l| l.starts_with("X-Request-ID")).unwrap();
        let id = header_line.split(": ").nth(1).unwrap();
        assert_eq!(Uuid::parse_str(id).unwrap().get_version_num(), 4);
    }

    #[tokio::test]
    async fn echoes_inbound_request_id() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\nX-Request-ID: fixed-id\r\n\r\n";
        let req = Request::parse(raw).unwrap().0;
        let chain = vec![from_middleware(Arc::new(RequestIdMiddleware))];
        let composed = compose(chain, terminal(|_ctx| async { Response::new(StatusCode::Ok) }));
        let resp = composed(Context::new(req)).await;
        let text = String::from_utf8(resp.into_bytes().to_vec()).unwrap();
        assert!(text.contains("X-Request-ID: fixed-id"));
    }
}
