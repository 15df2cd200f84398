//! Maps the HTTP routes onto [`Gauge`] operations.
//!
//! | Route | Operation | Body |
//! |---|---|---|
//! | `GET /` | none | `Hello World!` |
//! | `GET /get` | [`Gauge::value`] | current value |
//! | `GET /add` | [`Gauge::inc`] | new value |
//! | `GET /remove` | [`Gauge::dec`] | new value |
//! | `GET /set/{value}` | [`Gauge::set`] | new value |
//! | `GET <metrics path>` | gather + encode | exposition text |
//!
//! Literal segments match case-insensitively and a single trailing slash is ignored.
use std::collections::BTreeMap;

use hyper::{
    Method, Request, Response, StatusCode,
    header::{ALLOW, CONTENT_TYPE, HeaderValue},
};
use serde::Serialize;

use crate::{Gauge, server::Exposition};

/// Body of `GET /`.
pub const GREETING: &str = "Hello World!";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json; charset=utf-8";
const PROBLEM_JSON: &str = "application/problem+json; charset=utf-8";

/// A recognised route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Greeting,
    Get,
    Add,
    Remove,
    Set(i64),
    Metrics,
}

/// Why a request could not be mapped to a [`Route`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    NotFound,
    MethodNotAllowed,
    /// The `{value}` segment of `/set/{value}` is not an integer. Holds the decoded segment, or the
    /// raw one if it does not decode to UTF-8.
    InvalidValue(String),
}

/// Path match before the method is checked and the value is parsed.
enum Target<'a> {
    Route(Route),
    Set(&'a str),
}

/// Resolve a request method and path into a [`Route`].
///
/// The method is checked before the `{value}` segment is parsed, so `POST /set/abc` is
/// [`RouteError::MethodNotAllowed`] rather than [`RouteError::InvalidValue`]. The segment is
/// percent-decoded before parsing.
pub fn resolve(method: &Method, path: &str, metrics_path: &str) -> Result<Route, RouteError> {
    let target = match_path(path, metrics_path).ok_or(RouteError::NotFound)?;

    if *method != Method::GET {
        return Err(RouteError::MethodNotAllowed);
    }

    match target {
        Target::Route(route) => Ok(route),
        Target::Set(raw) => {
            let value =
                urlencoding::decode(raw).map_err(|_| RouteError::InvalidValue(raw.to_owned()))?;
            value
                .parse::<i64>()
                .map(Route::Set)
                .map_err(|_| RouteError::InvalidValue(value.into_owned()))
        }
    }
}

fn match_path<'a>(path: &'a str, metrics_path: &str) -> Option<Target<'a>> {
    let path = normalize(path);

    if path.eq_ignore_ascii_case(metrics_path) {
        return Some(Target::Route(Route::Metrics));
    }

    match_application_path(path)
}

/// Whether a path would be answered by one of the gauge routes (or the greeting).
pub(crate) fn is_application_path(path: &str) -> bool {
    match_application_path(normalize(path)).is_some()
}

fn match_application_path(path: &str) -> Option<Target<'_>> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return Some(Target::Route(Route::Greeting));
    }

    let mut segments = rest.split('/');
    let first = segments.next()?;
    let second = segments.next();
    if segments.next().is_some() {
        return None;
    }

    let route = match (first.to_ascii_lowercase().as_str(), second) {
        ("get", None) => Target::Route(Route::Get),
        ("add", None) => Target::Route(Route::Add),
        ("remove", None) => Target::Route(Route::Remove),
        ("set", Some(value)) if !value.is_empty() => Target::Set(value),
        _ => return None,
    };

    Some(route)
}

/// Strip a single trailing slash, keeping the root path intact.
pub(crate) fn normalize(path: &str) -> &str {
    if path.len() > 1 { path.strip_suffix('/').unwrap_or(path) } else { path }
}

/// Render a gauge value as a JSON number. Whole values have no fractional part.
pub fn render_value(value: f64) -> String {
    // `Display` for `f64` prints `1` for `1.0` and never uses exponent notation.
    if value.is_finite() { value.to_string() } else { "null".to_owned() }
}

/// The body of a `400 Bad Request` answer, shaped as an RFC 9457 problem document.
#[derive(Debug, Serialize)]
struct ValidationProblem {
    #[serde(rename = "type")]
    kind: &'static str,
    title: &'static str,
    status: u16,
    errors: BTreeMap<&'static str, Vec<String>>,
}

impl ValidationProblem {
    fn invalid_value(raw: &str) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert("value", vec![format!("The value '{raw}' is not valid.")]);

        Self {
            kind: "https://tools.ietf.org/html/rfc9110#section-15.5.1",
            title: "One or more validation errors occurred.",
            status: StatusCode::BAD_REQUEST.as_u16(),
            errors,
        }
    }
}

/// The router's answer, turned into an HTTP response by [`Reply::into_response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: String,
}

impl Reply {
    fn ok(content_type: &'static str, body: String) -> Self {
        Self { status: StatusCode::OK, content_type: Some(content_type), body }
    }

    fn value(value: f64) -> Self {
        Self::ok(APPLICATION_JSON, render_value(value))
    }

    fn empty(status: StatusCode) -> Self {
        Self { status, content_type: None, body: String::new() }
    }

    pub fn into_response(self) -> Response<String> {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;

        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        if self.status == StatusCode::METHOD_NOT_ALLOWED {
            response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET"));
        }

        response
    }
}

impl From<RouteError> for Reply {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::NotFound => Self::empty(StatusCode::NOT_FOUND),
            RouteError::MethodNotAllowed => Self::empty(StatusCode::METHOD_NOT_ALLOWED),
            RouteError::InvalidValue(raw) => {
                let problem = ValidationProblem::invalid_value(&raw);
                match serde_json::to_string(&problem) {
                    Ok(body) => {
                        Self { status: StatusCode::BAD_REQUEST, content_type: Some(PROBLEM_JSON), body }
                    }
                    Err(_) => Self::empty(StatusCode::BAD_REQUEST),
                }
            }
        }
    }
}

/// Dispatches requests to the gauge and to the scrape endpoint.
#[derive(Debug, Clone)]
pub struct Router {
    gauge: Gauge,
    exposition: Exposition,
    metrics_path: String,
}

impl Router {
    /// Create a router around an existing gauge. `metrics_path` must already be normalized (see
    /// [`crate::server::ServerBuilder::with_path`]).
    pub fn new(gauge: Gauge, exposition: Exposition, metrics_path: impl Into<String>) -> Self {
        Self { gauge, exposition, metrics_path: metrics_path.into() }
    }

    pub fn gauge(&self) -> &Gauge {
        &self.gauge
    }

    pub fn metrics_path(&self) -> &str {
        &self.metrics_path
    }

    /// Answer a request. Only the method and path are inspected; the body is ignored.
    pub fn handle<B>(&self, req: &Request<B>) -> Response<String> {
        let path = req.uri().path();
        let reply = match resolve(req.method(), path, &self.metrics_path) {
            Ok(route) => self.dispatch(route),
            Err(err) => Reply::from(err),
        };

        tracing::debug!(method = %req.method(), path, status = reply.status.as_u16(), "handled request");

        reply.into_response()
    }

    /// Perform the operation of a route and build the reply.
    pub fn dispatch(&self, route: Route) -> Reply {
        match route {
            Route::Greeting => Reply::ok(TEXT_PLAIN, GREETING.to_owned()),
            Route::Get => Reply::value(self.gauge.value()),
            Route::Add => {
                self.gauge.inc();
                Reply::value(self.gauge.value())
            }
            Route::Remove => {
                self.gauge.dec();
                Reply::value(self.gauge.value())
            }
            Route::Set(value) => {
                self.gauge.set(value);
                Reply::value(self.gauge.value())
            }
            Route::Metrics => match self.exposition.render() {
                Ok(body) => Reply::ok(prometheus::TEXT_FORMAT, body),
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode metrics");
                    Reply::empty(StatusCode::INTERNAL_SERVER_ERROR)
                }
            },
        }
    }
}
