//! Route tree: the immutable description of what can be matched and what
//! runs once it is. See spec §3 ("Route") and §9 ("routes form a tree; the
//! engine never mutates them after creation").

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::{ConfigError, RouteErrorValue};
use crate::request::RouterRequest;

/// A route's identity. Cheap to clone and to use as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct RouteId(pub Arc<str>);

impl RouteId {
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        RouteId(s.into())
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        RouteId(Arc::from(s))
    }
}

static AUTO_ID: AtomicU64 = AtomicU64::new(0);

fn next_auto_id() -> RouteId {
    let n = AUTO_ID.fetch_add(1, Ordering::Relaxed);
    RouteId(Arc::from(format!("__auto_{n}__")))
}

/// Response metadata a loader/action can attach to a successful result:
/// an explicit status (used by the static handler's deepest-2xx rule) and
/// response headers (`actionHeaders`/`loaderHeaders`, spec §4.7). Absent
/// for calls that don't care, which is the common case for client-side
/// navigation.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub status: Option<u16>,
    pub headers: IndexMap<String, String>,
}

impl ResponseMeta {
    /// `X-Remix-Revalidate` forces full revalidation on the following
    /// navigation (spec §6 "Headers of note").
    pub fn forces_revalidate(&self) -> bool {
        self.headers.keys().any(|k| k.eq_ignore_ascii_case("x-remix-revalidate"))
    }
}

/// The three outcomes a loader/action/shouldRevalidate call produces,
/// mirroring the teacher's `Success`/`Failure`/`Forward` trichotomy in
/// spirit: a loader either produces data, redirects, or throws.
#[derive(Debug, Clone)]
pub enum Outcome {
    Data(crate::deferred::LoaderValue, ResponseMeta),
    Redirect(Redirect),
    Error(RouteErrorValue),
}

impl Outcome {
    /// Convenience constructor for the common case of plain data with no
    /// response metadata.
    pub fn data(value: crate::deferred::LoaderValue) -> Self {
        Outcome::Data(value, ResponseMeta::default())
    }
}

/// A redirect produced by a loader or action (spec §4.5).
#[derive(Debug, Clone)]
pub struct Redirect {
    pub status: u16,
    pub location: String,
    /// `X-Remix-Revalidate` was present on the response.
    pub force_revalidate: bool,
    /// The redirect was thrown (aborts sibling loaders) rather than
    /// returned (does not). See spec §5's asymmetry note.
    pub thrown: bool,
    /// The response asked the follow-up navigation to replace history.
    pub replace: bool,
}

/// A loader: the read side of a route. Always called with `GET` semantics
/// (including GET submissions serialized into the URL).
#[async_trait]
pub trait Loader: Send + Sync {
    async fn call(&self, req: RouterRequest) -> Outcome;
}

/// An action: the write side of a route, invoked for non-GET navigations
/// and fetcher submissions.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, req: RouterRequest) -> Outcome;
}

/// Arguments passed to a route's `shouldRevalidate` override, spec §4.4.
#[derive(Debug, Clone)]
pub struct ShouldRevalidateArgs {
    pub current_params: IndexMap<String, String>,
    pub current_url: String,
    pub next_params: IndexMap<String, String>,
    pub next_url: String,
    pub form_method: Option<http::Method>,
    pub form_data: Option<crate::request::FormData>,
    pub form_enc_type: Option<crate::request::FormEncType>,
    pub form_action: Option<String>,
    pub action_result: Option<ActionResultSummary>,
    pub default_should_revalidate: bool,
}

/// What actually happened at the action phase, handed to `shouldRevalidate`
/// so it can distinguish success/error/redirect without seeing full state.
#[derive(Debug, Clone)]
pub enum ActionResultSummary {
    Data(crate::deferred::LoaderValue),
    Error(RouteErrorValue),
}

/// A route's revalidation override. Only a strict `Some(false)` opts out of
/// a default-true decision and only `Some(true)` opts into a default-false
/// one; `None` defers to the default (spec §4.4).
#[async_trait]
pub trait ShouldRevalidate: Send + Sync {
    async fn call(&self, args: ShouldRevalidateArgs) -> Option<bool>;
}

/// A node in the immutable route tree.
pub struct Route {
    pub id: RouteId,
    pub path: Option<String>,
    pub index: bool,
    pub loader: Option<Arc<dyn Loader>>,
    pub action: Option<Arc<dyn Action>>,
    pub has_error_boundary: bool,
    pub should_revalidate: Option<Arc<dyn ShouldRevalidate>>,
    pub children: Vec<Route>,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("index", &self.index)
            .field("has_loader", &self.loader.is_some())
            .field("has_action", &self.action.is_some())
            .field("has_error_boundary", &self.has_error_boundary)
            .field("children", &self.children)
            .finish()
    }
}

impl Route {
    pub fn builder(path: impl Into<String>) -> RouteBuilder {
        RouteBuilder::new(Some(path.into()))
    }

    pub fn index_builder() -> RouteBuilder {
        RouteBuilder::new(None).index()
    }
}

/// Builds a [`Route`]. A route with no explicit `path` and `index(true)` is
/// an index route; a route with no path and `index(false)` is a pathless
/// layout route (owns no URL segment of its own, only groups children).
pub struct RouteBuilder {
    id: Option<RouteId>,
    path: Option<String>,
    index: bool,
    loader: Option<Arc<dyn Loader>>,
    action: Option<Arc<dyn Action>>,
    has_error_boundary: bool,
    should_revalidate: Option<Arc<dyn ShouldRevalidate>>,
    children: Vec<Route>,
}

impl RouteBuilder {
    fn new(path: Option<String>) -> Self {
        RouteBuilder {
            id: None,
            path,
            index: false,
            loader: None,
            action: None,
            has_error_boundary: false,
            should_revalidate: None,
            children: Vec::new(),
        }
    }

    pub fn id(mut self, id: impl Into<Arc<str>>) -> Self {
        self.id = Some(RouteId(id.into()));
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn loader(mut self, loader: impl Loader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    pub fn action(mut self, action: impl Action + 'static) -> Self {
        self.action = Some(Arc::new(action));
        self
    }

    pub fn error_boundary(mut self) -> Self {
        self.has_error_boundary = true;
        self
    }

    pub fn should_revalidate(mut self, f: impl ShouldRevalidate + 'static) -> Self {
        self.should_revalidate = Some(Arc::new(f));
        self
    }

    pub fn child(mut self, route: Route) -> Self {
        self.children.push(route);
        self
    }

    pub fn children(mut self, routes: impl IntoIterator<Item = Route>) -> Self {
        self.children.extend(routes);
        self
    }

    pub fn build(self) -> Route {
        Route {
            id: self.id.unwrap_or_else(next_auto_id),
            path: self.path,
            index: self.index,
            loader: self.loader,
            action: self.action,
            has_error_boundary: self.has_error_boundary,
            should_revalidate: self.should_revalidate,
            children: self.children,
        }
    }
}

/// A validated, immutable route tree. Construction enforces the invariants
/// from spec §3: globally unique ids, index routes never carry children.
#[derive(Debug)]
pub struct RouteTree {
    pub roots: Vec<Route>,
}

impl RouteTree {
    pub fn new(roots: Vec<Route>) -> Result<Self, ConfigError> {
        if roots.is_empty() {
            return Err(ConfigError::EmptyRouteTree);
        }
        let mut seen = std::collections::HashSet::new();
        for root in &roots {
            validate(root, &mut seen)?;
        }
        Ok(RouteTree { roots })
    }

    /// The nearest ancestor of `id` with `has_error_boundary`, falling back
    /// to the root per spec §3's invariant ("if none exists the root route
    /// is used and is implicitly treated as a boundary").
    pub fn boundary_for<'a>(&'a self, matches: &[crate::matcher::Match<'a>], from: usize) -> &'a Route {
        for m in matches[..=from].iter().rev() {
            if m.route.has_error_boundary {
                return m.route;
            }
        }
        matches[0].route
    }
}

fn validate(route: &Route, seen: &mut std::collections::HashSet<RouteId>) -> Result<(), ConfigError> {
    if !seen.insert(route.id.clone()) {
        return Err(ConfigError::DuplicateRouteId(route.id.to_string()));
    }
    if route.index && !route.children.is_empty() {
        return Err(ConfigError::IndexRouteWithChildren(route.id.to_string()));
    }
    for child in &route.children {
        validate(child, seen)?;
    }
    Ok(())
}
