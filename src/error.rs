//! Error taxonomy for the routing engine.
//!
//! Following the split the teacher draws between a launch-time `Error` and
//! a request-time catcher-routed failure, this module distinguishes a
//! synchronous, structural [`ConfigError`] (thrown from the engine factory)
//! from the per-navigation [`RouteErrorValue`] that ends up keyed into
//! [`crate::state::RouterState::errors`].

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

/// Thrown synchronously by the engine factory when the route tree or
/// factory options are structurally invalid. See spec §7.4.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The route tree contains no routes at all.
    EmptyRouteTree,
    /// Two routes were declared with the same id.
    DuplicateRouteId(String),
    /// An index route also declared children.
    IndexRouteWithChildren(String),
    /// The supplied basename could not be reconciled with any matched path.
    UnknownBasename(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyRouteTree => {
                write!(f, "cannot create a router with an empty route tree")
            }
            ConfigError::DuplicateRouteId(id) => {
                write!(f, "duplicate route id: `{}`", id)
            }
            ConfigError::IndexRouteWithChildren(id) => {
                write!(f, "index route `{}` must not declare children", id)
            }
            ConfigError::UnknownBasename(base) => {
                write!(f, "basename `{}` does not prefix any route", base)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// The sentinel error shape synthesized for 4xx/5xx, per spec §6. Mirrors
/// the public `isRouteErrorResponse(value)` detection by being a distinct,
/// matchable variant of [`RouteErrorValue`] rather than a plain error.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub status_text: String,
    /// Parsed per response content type: JSON when `application/json*`,
    /// otherwise the raw text body, carried as a JSON value either way so
    /// callers have one type to match on.
    pub data: serde_json::Value,
    /// True for responses synthesized by the engine itself (404/405/400)
    /// rather than thrown by application code.
    #[serde(default)]
    pub internal: bool,
    /// Response headers attached by the loader/action that threw this
    /// response, exposed by the static handler as `actionHeaders`/
    /// `loaderHeaders` (spec §4.7). Empty for engine-synthesized responses.
    #[serde(default)]
    pub headers: IndexMap<String, String>,
}

impl ErrorResponse {
    pub fn internal(status: u16, status_text: impl Into<String>, data: impl Into<serde_json::Value>) -> Self {
        ErrorResponse { status, status_text: status_text.into(), data: data.into(), internal: true, headers: IndexMap::new() }
    }

    pub fn thrown(status: u16, status_text: impl Into<String>, data: serde_json::Value) -> Self {
        ErrorResponse { status, status_text: status_text.into(), data, internal: false, headers: IndexMap::new() }
    }

    pub fn thrown_with_headers(
        status: u16,
        status_text: impl Into<String>,
        data: serde_json::Value,
        headers: IndexMap<String, String>,
    ) -> Self {
        ErrorResponse { status, status_text: status_text.into(), data, internal: false, headers }
    }

    pub fn not_found(pathname: &str) -> Self {
        ErrorResponse::internal(
            404,
            "Not Found",
            serde_json::json!(format!("No route matches URL \"{}\"", pathname)),
        )
    }

    pub fn no_action(pathname: &str) -> Self {
        ErrorResponse::internal(
            405,
            "Method Not Allowed",
            serde_json::json!(format!("No action found for [{}]", pathname)),
        )
    }

    pub fn binary_in_get() -> Self {
        ErrorResponse::internal(
            400,
            "Bad Request",
            serde_json::json!("Cannot submit binary form data using GET"),
        )
    }
}

/// An arbitrary application error thrown from a loader/action. Boxed behind
/// a trait object, same as the teacher wraps arbitrary fairing/IO failures
/// rather than closing the enum over every possible cause.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// What ends up keyed at a boundary in `RouterState.errors`.
#[derive(Debug, Clone)]
pub enum RouteErrorValue {
    Response(ErrorResponse),
    App(BoxError),
}

impl RouteErrorValue {
    pub fn is_route_error_response(&self) -> bool {
        matches!(self, RouteErrorValue::Response(_))
    }

    pub fn as_error_response(&self) -> Option<&ErrorResponse> {
        match self {
            RouteErrorValue::Response(r) => Some(r),
            RouteErrorValue::App(_) => None,
        }
    }
}

impl fmt::Display for RouteErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteErrorValue::Response(r) => write!(f, "{} {}: {}", r.status, r.status_text, r.data),
            RouteErrorValue::App(e) => write!(f, "{}", e),
        }
    }
}

/// A `BoxError` can't derive `Serialize`, so this is hand-written rather
/// than `#[derive]`d, matching the tagged shape SSR hydration expects
/// (spec §6): `{"__type": "RouteErrorResponse" | "Error", ...}`.
impl Serialize for RouteErrorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = match self {
            RouteErrorValue::Response(r) => serde_json::json!({
                "__type": "RouteErrorResponse",
                "status": r.status,
                "statusText": r.status_text,
                "data": r.data,
                "internal": r.internal,
                "headers": r.headers,
            }),
            RouteErrorValue::App(e) => serde_json::json!({
                "__type": "Error",
                "message": e.to_string(),
            }),
        };
        value.serialize(serializer)
    }
}

/// Free function matching the spec's public `isRouteErrorResponse(value)`.
pub fn is_route_error_response(value: &RouteErrorValue) -> bool {
    value.is_route_error_response()
}

/// Distinguishes a cancelled operation from a real rejection (spec §5, §10.2
/// of `SPEC_FULL.md`). Never surfaced through `RouterState.errors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortKind {
    /// A loader/action call was aborted because a newer navigation or
    /// fetcher submission superseded it.
    Navigation,
    /// A tracked deferred promise was aborted.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct AbortError(pub AbortKind);

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            AbortKind::Navigation => write!(f, "call aborted"),
            AbortKind::Deferred => write!(f, "aborted deferred"),
        }
    }
}

impl std::error::Error for AbortError {}
