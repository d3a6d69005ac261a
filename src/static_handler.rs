//! Static Handler. Spec §4.7.
//!
//! A stateless counterpart to [`crate::navigation::Engine`]: instead of
//! owning a history adapter and a long-lived subscriber list, it services
//! one request at a time by reusing the matcher, request builder, and
//! deferred tracker directly. There is no prior navigation to diff against,
//! so every matched route with a loader runs (mirroring `Engine::initialize`'s
//! "nothing to compare to" plan, not the revalidation planner's diffing).

use std::fmt;
use std::sync::Arc;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::deferred::LoaderValue;
use crate::error::{ConfigError, ErrorResponse, RouteErrorValue};
use crate::location::Location;
use crate::matcher::{match_routes, strip_basename};
use crate::request::{build_loader_request, RequestBody, RouterRequest};
use crate::route::{Outcome, Redirect, RouteId, RouteTree};
use crate::state::{snapshot_matches, MatchSnapshot};

/// A single incoming request to service, the static-handler equivalent of
/// the browser-originated `href`/`Submission` pair the engine builds from
/// history events. Form-body parsing is the caller's responsibility (spec
/// Non-goals: transport is out of scope); `body` is already structured.
pub struct StaticRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: http::HeaderMap,
    pub body: RequestBody,
    /// Required precondition (spec §4.7): "requests must carry an abort
    /// signal." `None` is rejected by [`StaticHandler::query`] before any
    /// matching occurs.
    pub signal: Option<CancellationToken>,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum StaticHandlerError {
    /// The request carried no abort signal.
    MissingSignal,
    /// HEAD and OPTIONS are rejected outright (spec §4.7).
    MethodNotAllowed(http::Method),
    /// The signal was aborted before or during the call.
    Aborted,
}

impl fmt::Display for StaticHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticHandlerError::MissingSignal => write!(f, "request must carry an abort signal"),
            StaticHandlerError::MethodNotAllowed(m) => write!(f, "method {} is not supported", m),
            StaticHandlerError::Aborted => write!(f, "call aborted"),
        }
    }
}

impl std::error::Error for StaticHandlerError {}

/// The serializable context produced by [`StaticHandler::query`], suitable
/// for both an HTTP response body and client hydration (spec §6's "SSR
/// hydration payload" / §8's "query(request) followed by client hydration
/// ... yields a state matching the server's matches, status, and error
/// shape").
#[derive(Debug, Clone, serde::Serialize)]
pub struct StaticContext {
    pub location: Location,
    pub matches: Vec<MatchSnapshot>,
    pub loader_data: IndexMap<RouteId, serde_json::Value>,
    pub action_data: Option<IndexMap<RouteId, serde_json::Value>>,
    pub errors: Option<IndexMap<RouteId, RouteErrorValue>>,
    pub status_code: u16,
    pub loader_headers: IndexMap<RouteId, IndexMap<String, String>>,
    pub action_headers: IndexMap<RouteId, IndexMap<String, String>>,
}

/// What [`StaticHandler::query`] produces: either a fully-resolved context,
/// or a redirect that short-circuited the pipeline (spec §4.7: "A redirect
/// Response returned from any loader/action short-circuits and is returned
/// to the caller as-is").
#[derive(Debug, Clone)]
pub enum QueryResult {
    Context(StaticContext),
    Redirect(Redirect),
}

fn error_status(e: &RouteErrorValue) -> u16 {
    match e {
        RouteErrorValue::Response(r) => r.status,
        RouteErrorValue::App(_) => 500,
    }
}

fn parse_url(url: &str) -> Location {
    let (before_hash, hash) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    let (path, search) = match before_hash.find('?') {
        Some(i) => (&before_hash[..i], &before_hash[i..]),
        None => (before_hash, ""),
    };
    let mut loc = Location::new(path);
    loc.search = search.to_string();
    loc.hash = hash.to_string();
    loc
}

/// Finds the nearest ancestor (inclusive) of `matches[from]` with an error
/// boundary, returning its index so callers can slice `loaderData` down to
/// ancestors of it.
fn boundary_index(tree: &RouteTree, matches: &[crate::matcher::Match<'_>], from: usize) -> usize {
    let boundary = tree.boundary_for(matches, from);
    matches.iter().position(|m| m.route.id == boundary.id).unwrap_or(0)
}

/// A stateless factory over a validated route tree, producing `query`/
/// `queryRoute` closures over a single request each (spec §9: "the static
/// handler is a separate factory producing stateless-per-call query/
/// queryRoute closures over a route tree").
pub struct StaticHandler {
    tree: Arc<RouteTree>,
    basename: String,
}

impl StaticHandler {
    pub fn create(routes: Vec<crate::route::Route>, basename: Option<String>) -> Result<Self, ConfigError> {
        Ok(StaticHandler { tree: Arc::new(RouteTree::new(routes)?), basename: basename.unwrap_or_default() })
    }

    fn precondition(&self, request: &StaticRequest) -> Result<CancellationToken, StaticHandlerError> {
        if request.method == http::Method::HEAD || request.method == http::Method::OPTIONS {
            return Err(StaticHandlerError::MethodNotAllowed(request.method.clone()));
        }
        let signal = request.signal.clone().ok_or(StaticHandlerError::MissingSignal)?;
        if signal.is_cancelled() {
            return Err(StaticHandlerError::Aborted);
        }
        Ok(signal)
    }

    fn not_found_context(&self, location: Location, pathname: &str) -> StaticContext {
        let mut errors = IndexMap::new();
        errors.insert(self.tree.roots[0].id.clone(), RouteErrorValue::Response(ErrorResponse::not_found(pathname)));
        StaticContext {
            location,
            matches: Vec::new(),
            loader_data: IndexMap::new(),
            action_data: None,
            errors: Some(errors),
            status_code: 404,
            loader_headers: IndexMap::new(),
            action_headers: IndexMap::new(),
        }
    }

    /// Runs the full matching + action (if a submission) + loading
    /// pipeline for `request`, awaiting every tracked promise before
    /// returning (spec §4.7).
    pub async fn query(&self, request: StaticRequest) -> Result<QueryResult, StaticHandlerError> {
        let signal = self.precondition(&request)?;

        let location = parse_url(&request.url);
        let pathname = strip_basename(&location.pathname, &self.basename).unwrap_or(&location.pathname).to_string();
        let Some(matches) = match_routes(&self.tree, &pathname) else {
            return Ok(QueryResult::Context(self.not_found_context(location, &pathname)));
        };

        let mut loader_data = IndexMap::new();
        let mut action_data = None;
        let mut errors: IndexMap<RouteId, RouteErrorValue> = IndexMap::new();
        let mut loader_headers = IndexMap::new();
        let mut action_headers = IndexMap::new();
        let mut action_status = None;
        let mut submission_succeeded = false;
        // Index at or after which loaders are skipped because an action
        // phase error placed the boundary there (spec §7's "action errors
        // skip the leaf loader; ancestor loaders above the boundary still
        // run").
        let mut skip_from: Option<usize> = None;

        if request.method != http::Method::GET {
            let leaf_idx = matches.len() - 1;
            let leaf = &matches[leaf_idx];
            match &leaf.route.action {
                None => {
                    let boundary_idx = boundary_index(&self.tree, &matches, leaf_idx);
                    errors.insert(matches[boundary_idx].route.id.clone(), RouteErrorValue::Response(ErrorResponse::no_action(&pathname)));
                    skip_from = Some(boundary_idx);
                }
                Some(action) => {
                    let req = RouterRequest {
                        method: request.method.clone(),
                        url: location.href(),
                        headers: request.headers.clone(),
                        body: request.body.clone(),
                        signal: signal.child_token(),
                    };
                    let outcome = action.call(req).await;
                    if signal.is_cancelled() {
                        return Err(StaticHandlerError::Aborted);
                    }
                    match outcome {
                        Outcome::Redirect(r) => return Ok(QueryResult::Redirect(r)),
                        Outcome::Error(e) => {
                            let boundary_idx = boundary_index(&self.tree, &matches, leaf_idx);
                            errors.insert(matches[boundary_idx].route.id.clone(), e);
                            skip_from = Some(boundary_idx);
                        }
                        Outcome::Data(value, meta) => {
                            value.await_all().await;
                            action_status = meta.status;
                            action_headers.insert(leaf.route.id.clone(), meta.headers);
                            submission_succeeded = true;
                            let mut m = IndexMap::new();
                            match &value {
                                LoaderValue::Plain(v) => {
                                    m.insert(leaf.route.id.clone(), v.clone());
                                }
                                LoaderValue::Deferred(d) => {
                                    m.insert(leaf.route.id.clone(), serde_json::Value::Object(d.sync_snapshot()));
                                }
                            }
                            action_data = Some(m);
                        }
                    }
                }
            }
        }

        let mut futs = FuturesUnordered::new();
        for (idx, m) in matches.iter().enumerate() {
            if m.route.loader.is_none() || skip_from.map(|b| idx >= b).unwrap_or(false) {
                continue;
            }
            let loader = m.route.loader.clone().unwrap();
            let mut loc = Location::new(&m.pathname);
            loc.search = location.search.clone();
            loc.hash = location.hash.clone();
            let req = build_loader_request(&loc, signal.child_token());
            futs.push(async move { (idx, loader.call(req).await) });
        }

        let mut results: IndexMap<usize, Outcome> = IndexMap::new();
        while let Some((idx, outcome)) = futs.next().await {
            if let Outcome::Redirect(r) = outcome {
                return Ok(QueryResult::Redirect(r));
            }
            results.insert(idx, outcome);
        }
        drop(futs);

        if signal.is_cancelled() {
            return Err(StaticHandlerError::Aborted);
        }

        let mut deepest_ok_status = None;
        let mut first_error_idx = None;
        for (idx, m) in matches.iter().enumerate() {
            if m.route.loader.is_none() || skip_from.map(|b| idx >= b).unwrap_or(false) {
                continue;
            }
            match results.shift_remove(&idx) {
                Some(Outcome::Data(value, meta)) => {
                    value.await_all().await;
                    loader_headers.insert(m.route.id.clone(), meta.headers);
                    if let Some(status) = meta.status {
                        if (200..300).contains(&status) {
                            deepest_ok_status = Some(status);
                        }
                    }
                    match &value {
                        LoaderValue::Plain(v) => {
                            loader_data.insert(m.route.id.clone(), v.clone());
                        }
                        LoaderValue::Deferred(d) => {
                            loader_data.insert(m.route.id.clone(), serde_json::Value::Object(d.sync_snapshot()));
                        }
                    }
                }
                Some(Outcome::Error(e)) => {
                    if first_error_idx.is_none() {
                        first_error_idx = Some(idx);
                    }
                    errors.insert(m.route.id.clone(), e);
                }
                Some(Outcome::Redirect(_)) | None => {}
            }
        }

        if let Some(idx) = first_error_idx {
            let boundary_idx = boundary_index(&self.tree, &matches, idx);
            let boundary_id = matches[boundary_idx].route.id.clone();
            // Inclusive of the boundary itself: it's an ancestor of (or
            // identical to) the route that actually errored, and its own
            // loaderData must survive, matching the same fix in
            // navigation.rs's `run_navigation`.
            loader_data.retain(|id, _| matches[..=boundary_idx].iter().any(|m| &m.route.id == id));
            if let Some(err) = errors.shift_remove(&matches[idx].route.id) {
                errors.insert(boundary_id, err);
            }
        }

        let status_code = if submission_succeeded {
            action_status.unwrap_or(200)
        } else if !errors.is_empty() {
            matches
                .iter()
                .find_map(|m| errors.get(&m.route.id).map(error_status))
                .unwrap_or(500)
        } else {
            deepest_ok_status.unwrap_or(200)
        };

        Ok(QueryResult::Context(StaticContext {
            location,
            matches: snapshot_matches(&matches),
            loader_data,
            action_data,
            errors: if errors.is_empty() { None } else { Some(errors) },
            status_code,
            loader_headers,
            action_headers,
        }))
    }

    /// Returns the raw loader/action value for `route_id` without
    /// unwrapping a returned Response, so the caller can stream binary
    /// payloads (spec §4.7). Unlike `query`, tracked promises are not
    /// awaited — the caller observes them directly through the returned
    /// [`Outcome::Data`].
    pub async fn query_route(&self, request: StaticRequest, route_id: &RouteId) -> Result<Outcome, StaticHandlerError> {
        let signal = self.precondition(&request)?;

        let location = parse_url(&request.url);
        let pathname = strip_basename(&location.pathname, &self.basename).unwrap_or(&location.pathname).to_string();
        let Some(matches) = match_routes(&self.tree, &pathname) else {
            return Ok(Outcome::Error(RouteErrorValue::Response(ErrorResponse::not_found(&pathname))));
        };
        let Some(m) = matches.iter().find(|m| &m.route.id == route_id) else {
            return Ok(Outcome::Error(RouteErrorValue::Response(ErrorResponse::not_found(&pathname))));
        };

        let outcome = if request.method == http::Method::GET {
            match &m.route.loader {
                Some(loader) => {
                    let mut loc = Location::new(&m.pathname);
                    loc.search = location.search.clone();
                    loc.hash = location.hash.clone();
                    loader.call(build_loader_request(&loc, signal.child_token())).await
                }
                None => Outcome::Error(RouteErrorValue::Response(ErrorResponse::no_action(&pathname))),
            }
        } else {
            match &m.route.action {
                Some(action) => {
                    let req = RouterRequest {
                        method: request.method.clone(),
                        url: location.href(),
                        headers: request.headers.clone(),
                        body: request.body.clone(),
                        signal: signal.child_token(),
                    };
                    action.call(req).await
                }
                None => Outcome::Error(RouteErrorValue::Response(ErrorResponse::no_action(&pathname))),
            }
        };

        if signal.is_cancelled() {
            return Err(StaticHandlerError::Aborted);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::route::Route;
    use async_trait::async_trait;

    struct RootLoader;
    #[async_trait]
    impl crate::route::Loader for RootLoader {
        async fn call(&self, _req: RouterRequest) -> Outcome {
            Outcome::data(LoaderValue::Plain(serde_json::json!("ROOT")))
        }
    }

    struct ChildLoader;
    #[async_trait]
    impl crate::route::Loader for ChildLoader {
        async fn call(&self, _req: RouterRequest) -> Outcome {
            Outcome::data(LoaderValue::Plain(serde_json::json!("CHILD")))
        }
    }

    struct FailingLoader;
    #[async_trait]
    impl crate::route::Loader for FailingLoader {
        async fn call(&self, _req: RouterRequest) -> Outcome {
            Outcome::Error(RouteErrorValue::Response(ErrorResponse::thrown(500, "Internal Server Error", serde_json::json!("boom"))))
        }
    }

    struct CreatePost;
    #[async_trait]
    impl crate::route::Action for CreatePost {
        async fn call(&self, _req: RouterRequest) -> Outcome {
            Outcome::data(LoaderValue::Plain(serde_json::json!({"ok": true})))
        }
    }

    fn req(method: http::Method, url: &str) -> StaticRequest {
        StaticRequest { method, url: url.to_string(), headers: http::HeaderMap::new(), body: RequestBody::Empty, signal: Some(CancellationToken::new()) }
    }

    #[tokio::test]
    async fn query_runs_matched_loaders() {
        let handler = StaticHandler::create(
            vec![Route::builder("/posts")
                .id("posts")
                .loader(RootLoader)
                .child(Route::builder("/:id").id("post").loader(ChildLoader).build())
                .build()],
            None,
        )
        .unwrap();
        let result = handler.query(req(http::Method::GET, "/posts/1")).await.unwrap();
        let QueryResult::Context(ctx) = result else { panic!("expected context") };
        assert_eq!(ctx.status_code, 200);
        assert_eq!(ctx.loader_data.get(&RouteId::from("posts")), Some(&serde_json::json!("ROOT")));
        assert_eq!(ctx.loader_data.get(&RouteId::from("post")), Some(&serde_json::json!("CHILD")));
    }

    #[tokio::test]
    async fn query_unmatched_pathname_yields_404() {
        let handler = StaticHandler::create(vec![Route::builder("/a").id("a").build()], None).unwrap();
        let result = handler.query(req(http::Method::GET, "/nope")).await.unwrap();
        let QueryResult::Context(ctx) = result else { panic!("expected context") };
        assert_eq!(ctx.status_code, 404);
    }

    #[tokio::test]
    async fn query_loader_error_bubbles_to_boundary_and_preserves_ancestor_data() {
        let handler = StaticHandler::create(
            vec![Route::builder("/a")
                .id("a")
                .loader(RootLoader)
                .error_boundary()
                .child(Route::builder("/b").id("b").loader(FailingLoader).build())
                .build()],
            None,
        )
        .unwrap();
        let result = handler.query(req(http::Method::GET, "/a/b")).await.unwrap();
        let QueryResult::Context(ctx) = result else { panic!("expected context") };
        assert_eq!(ctx.status_code, 500);
        assert!(ctx.errors.unwrap().contains_key(&RouteId::from("a")));
        assert_eq!(ctx.loader_data.get(&RouteId::from("a")), Some(&serde_json::json!("ROOT")));
        assert!(!ctx.loader_data.contains_key(&RouteId::from("b")));
    }

    #[tokio::test]
    async fn post_without_action_yields_405_but_still_runs_ancestor_loaders() {
        let handler = StaticHandler::create(
            vec![Route::builder("/a")
                .id("a")
                .loader(RootLoader)
                .error_boundary()
                .child(Route::builder("/b").id("b").build())
                .build()],
            None,
        )
        .unwrap();
        let result = handler.query(req(http::Method::POST, "/a/b")).await.unwrap();
        let QueryResult::Context(ctx) = result else { panic!("expected context") };
        assert_eq!(ctx.status_code, 405);
        assert_eq!(ctx.loader_data.get(&RouteId::from("a")), Some(&serde_json::json!("ROOT")));
    }

    #[tokio::test]
    async fn successful_submission_status_wins_over_default() {
        let handler = StaticHandler::create(vec![Route::builder("/posts").id("posts").action(CreatePost).build()], None).unwrap();
        let result = handler.query(req(http::Method::POST, "/posts")).await.unwrap();
        let QueryResult::Context(ctx) = result else { panic!("expected context") };
        assert_eq!(ctx.status_code, 200);
        assert_eq!(ctx.action_data.unwrap().get(&RouteId::from("posts")), Some(&serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn missing_signal_is_rejected() {
        let handler = StaticHandler::create(vec![Route::builder("/a").id("a").build()], None).unwrap();
        let mut request = req(http::Method::GET, "/a");
        request.signal = None;
        let err = handler.query(request).await.unwrap_err();
        assert!(matches!(err, StaticHandlerError::MissingSignal));
    }

    #[tokio::test]
    async fn head_is_rejected() {
        let handler = StaticHandler::create(vec![Route::builder("/a").id("a").build()], None).unwrap();
        let err = handler.query(req(http::Method::HEAD, "/a")).await.unwrap_err();
        assert!(matches!(err, StaticHandlerError::MethodNotAllowed(_)));
    }

    #[tokio::test]
    async fn query_route_returns_raw_outcome() {
        let handler = StaticHandler::create(vec![Route::builder("/a").id("a").loader(RootLoader).build()], None).unwrap();
        let outcome = handler.query_route(req(http::Method::GET, "/a"), &RouteId::from("a")).await.unwrap();
        assert!(matches!(outcome, Outcome::Data(LoaderValue::Plain(v), _) if v == serde_json::json!("ROOT")));
    }
}
