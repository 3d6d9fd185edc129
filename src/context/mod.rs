//! Per-request context — path params, typed scoped state, and staged response.
//!
//! A [`Context`] is created once per inbound request and owned exclusively by
//! the task handling it. Middleware mutate the staged [`Response`] inside the
//! context incrementally; [`Context::finalize`] turns the staging area into a
//! real [`crate::Response`] when the chain unwinds.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use chrono::{DateTime, Utc};

use crate::http::{Headers, Request, StatusCode};

/// Type-erased request extensions map — used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a value into the extensions map.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Get a value from the extensions map.
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Get a mutable reference to a value from the extensions map.
    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    /// Remove a value from the extensions map.
    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Path parameters extracted from the matched route (`:name` captures, `*` wildcard).
#[derive(Default, Debug, Clone)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    /// Create a new empty parameters map.
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Insert a captured value into the parameters map.
    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    /// Get a captured value by name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }
}

/// A value middleware can stash under a string key in [`Context::state`].
///
/// This is the typed replacement for a duck-typed `ctx.state: Record<string, any>`:
/// a closed tagged union instead of `Any`, since the concrete values middleware
/// pass around (request id, client ip, parsed body, timers) are known ahead of
/// time.
#[derive(Debug, Clone)]
pub enum StateValue {
    Str(String),
    Json(serde_json::Value),
    Bool(bool),
    I64(i64),
    /// Nanoseconds since an arbitrary process-local epoch — used by
    /// `TimingMiddleware` to compute elapsed duration through the state map
    /// without re-exposing `std::time::Instant`.
    MonotonicNanos(u128),
}

impl StateValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            StateValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::I64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_monotonic_nanos(&self) -> Option<u128> {
        match self {
            StateValue::MonotonicNanos(n) => Some(*n),
            _ => None,
        }
    }
}

/// Free-form, typed scoped state a middleware stack accumulates for one request.
pub type StateMap = HashMap<String, StateValue>;

/// Well-known state keys, so call sites don't repeat string literals.
pub mod state_keys {
    pub const REQUEST_ID: &str = "requestId";
    pub const CLIENT_IP: &str = "clientIp";
    pub const BODY: &str = "body";
    pub const TIMING_START: &str = "timingStart";
    pub const USER: &str = "user";
}

/// The staged response under construction inside a [`Context`].
///
/// Middleware accumulate status/headers/body incrementally via
/// [`Context::commit`] without forcing a final [`crate::Response`] to exist;
/// [`Context::finalize`] decides what to emit. `committed` is monotonic:
/// `false -> true`, never back.
#[derive(Debug)]
pub struct StagedResponse {
    pub status: StatusCode,
    pub status_text: Option<String>,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub committed: bool,
}

impl StagedResponse {
    fn new() -> Self {
        Self {
            status: StatusCode::Ok,
            status_text: None,
            headers: Headers::new(),
            body: None,
            committed: false,
        }
    }

    fn is_dirty(&self) -> bool {
        self.committed
            || !self.headers.is_empty()
            || self.body.is_some()
            || self.status != StatusCode::Ok
            || self.status_text.is_some()
    }
}

/// Fields a middleware may set when staging a response. Any field left `None`
/// leaves the corresponding staged field untouched.
#[derive(Default)]
pub struct Commit {
    pub status: Option<StatusCode>,
    pub status_text: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl Commit {
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status_text(mut self, text: impl Into<String>) -> Self {
        self.status_text = Some(text.into());
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Per-request entity: the immutable inbound request, captured path params,
/// typed scoped state, and the staged response.
///
/// Exactly one `Context` exists per request. It is created by the HTTP server
/// when a request arrives and dropped after the final response is written.
pub struct Context {
    request: Request,
    params: PathParams,
    extensions: Extensions,
    state: StateMap,
    response: StagedResponse,
    created_at: DateTime<Utc>,
}

impl Context {
    /// Create a new context for `request` with no captured path params.
    pub fn new(request: Request) -> Self {
        Self::with_params(request, PathParams::new())
    }

    /// Create a new context for `request` with path params captured by the router.
    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self {
            request,
            params,
            extensions: Extensions::new(),
            state: StateMap::new(),
            response: StagedResponse::new(),
            created_at: Utc::now(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn state(&self) -> &StateMap {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut StateMap {
        &mut self.state
    }

    /// Convenience accessor for a string-valued state entry.
    pub fn state_str(&self, key: &str) -> Option<&str> {
        self.state.get(key).and_then(StateValue::as_str)
    }

    pub fn response(&self) -> &StagedResponse {
        &self.response
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Stage response fields and flip `committed` to `true`.
    pub fn commit(&mut self, fields: Commit) {
        if let Some(status) = fields.status {
            self.response.status = status;
        }
        if let Some(status_text) = fields.status_text {
            self.response.status_text = Some(status_text);
        }
        if let Some(body) = fields.body {
            self.response.body = Some(body);
        }
        self.response.committed = true;
    }

    /// Append a header to the staged response without committing.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.response.headers.insert(name, value);
    }

    /// Emit the staged response, or `fallback` if nothing was staged, or a bare
    /// `204 No Content` if no fallback was given either.
    ///
    /// A response is considered "staged" when any of `{committed, non-empty
    /// headers, non-null body, status != 200, statusText set}` holds.
    pub fn finalize(mut self, fallback: Option<crate::Response>) -> crate::Response {
        if self.response.is_dirty() {
            let mut resp = crate::Response::new(self.response.status);
            if let Some(text) = self.response.status_text {
                resp = resp.status_text(text);
            }
            for (name, value) in self.response.headers.iter() {
                resp.add_header(name.to_string(), value.to_string());
            }
            if let Some(body) = self.response.body.take() {
                resp = resp.body_bytes(body);
            }
            return resp;
        }

        fallback.unwrap_or_else(|| crate::Response::new(StatusCode::NoContent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request;

    fn make_request() -> Request {
        let raw = b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n";
        Request::parse(raw).unwrap().0
    }

    #[test]
    fn finalize_default_is_204() {
        let ctx = Context::new(make_request());
        let resp = ctx.finalize(None);
        assert_eq!(resp.status(), StatusCode::NoContent);
    }

    #[test]
    fn finalize_with_header_only_keeps_200() {
        let mut ctx = Context::new(make_request());
        ctx.set_header("X-Trace", "1");
        let resp = ctx.finalize(None);
        assert_eq!(resp.status(), StatusCode::Ok);
    }

    #[test]
    fn finalize_with_commit_status() {
        let mut ctx = Context::new(make_request());
        ctx.commit(Commit::default().status(StatusCode::Created));
        let resp = ctx.finalize(None);
        assert_eq!(resp.status(), StatusCode::Created);
    }

    #[test]
    fn finalize_falls_back_when_untouched() {
        let ctx = Context::new(make_request());
        let fallback = crate::Response::new(StatusCode::Accepted);
        let resp = ctx.finalize(Some(fallback));
        assert_eq!(resp.status(), StatusCode::Accepted);
    }

    #[test]
    fn state_round_trip() {
        let mut ctx = Context::new(make_request());
        ctx.state_mut()
            .insert(state_keys::REQUEST_ID.to_string(), StateValue::Str("abc".into()));
        assert_eq!(ctx.state_str(state_keys::REQUEST_ID), Some("abc"));
    }
}
