//! A framework-agnostic, data-aware client routing engine.
//!
//! The crate is organized the way the problem decomposes (spec §2): a pure
//! [`matcher`], a [`request`] builder, a [`deferred`] tracker for streamed
//! loader values, a [`revalidate`] planner, a [`navigation`] orchestrator
//! (the state machine), and a [`fetcher`] registry for keyed operations
//! independent of the active navigation. [`static_handler`] reuses the
//! matching and data pipeline to service a single server-side request.
//!
//! This crate ships no logger backend; install one (e.g. `env_logger`) in
//! the host application to see the `debug`/`trace` points emitted on
//! navigation start/settle, redirect chasing, revalidation decisions,
//! fetcher transitions, and deferred cancellation.

#![warn(rust_2018_idioms)]

pub mod deferred;
pub mod error;
pub mod fetcher;
pub mod location;
pub mod matcher;
pub mod navigation;
pub mod request;
pub mod revalidate;
pub mod route;
pub mod state;
pub mod static_handler;
pub mod testing;

use std::sync::Arc;

use indexmap::IndexMap;

pub use error::{is_route_error_response, AbortError, AbortKind, ConfigError, ErrorResponse, RouteErrorValue};
pub use fetcher::Fetcher;
pub use location::{History, HistoryAction, Location, LocationKey};
pub use matcher::Match;
pub use navigation::{NavigateOpts, Navigation, Relative};
pub use request::{FormData, FormEncType, FormValue, Submission};
pub use route::{Action, Loader, Outcome, Redirect, Route, RouteBuilder, RouteId, RouteTree, ShouldRevalidate, ShouldRevalidateArgs};
pub use state::{MatchSnapshot, RestoreScrollPosition, RevalidationState, RouterState};

use navigation::Engine;
use state::{snapshot_matches, Subscriber};

/// Hydration payload handed to [`CreateOptions`], spec §6. If `errors` is
/// present or any matched route's id appears in `loader_data`, the router
/// is immediately `initialized` and [`Router::initialize`] skips loaders
/// for those routes; other matched routes with loaders still run.
#[derive(Debug, Clone, Default)]
pub struct HydrationData {
    pub loader_data: IndexMap<RouteId, serde_json::Value>,
    pub action_data: Option<IndexMap<RouteId, serde_json::Value>>,
    pub errors: Option<IndexMap<RouteId, RouteErrorValue>>,
}

/// Input to the engine factory, spec §6 (`create({ routes, history,
/// basename?, hydrationData? })`). Validation happens once, synchronously,
/// in [`Router::create`] — mirroring the teacher's `ignite()` finalize step
/// that rejects a colliding route table before the server ever orbits.
pub struct CreateOptions {
    pub routes: Vec<Route>,
    pub history: Arc<dyn History>,
    pub basename: Option<String>,
    pub hydration_data: Option<HydrationData>,
}

/// The engine handle returned by [`Router::create`]. Cloning is cheap (an
/// `Arc` to the shared [`Engine`]); every clone observes the same state.
#[derive(Clone)]
pub struct Router {
    engine: Arc<Engine>,
}

/// Returned by [`Router::subscribe`]; dropping or calling it removes the
/// subscriber.
pub struct Unsubscribe {
    engine: Arc<Engine>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        self.engine.unsubscribe(self.id);
    }
}

impl Router {
    /// Builds a router from a validated route tree and history adapter.
    /// Spec §7.4's structural errors (empty tree, duplicate ids) surface
    /// here as a [`ConfigError`], synchronously, before any navigation can
    /// occur.
    pub fn create(opts: CreateOptions) -> Result<Router, ConfigError> {
        let tree = Arc::new(RouteTree::new(opts.routes)?);
        let basename = opts.basename.unwrap_or_default();

        let raw_location = opts.history.location();
        let pathname = matcher::strip_basename(&raw_location.pathname, &basename)
            .ok_or_else(|| ConfigError::UnknownBasename(basename.clone()))?;
        let matches = matcher::match_routes(&tree, pathname);

        let mut initial = state::RouterState::initial(
            raw_location.clone(),
            matches.as_deref().map(snapshot_matches).unwrap_or_default(),
        );

        if let Some(hydration) = opts.hydration_data {
            initial.loader_data = hydration.loader_data;
            initial.action_data = hydration.action_data;
            let has_root_loader_data = matches
                .as_deref()
                .map(|ms| ms.iter().any(|m| initial.loader_data.contains_key(&m.route.id)))
                .unwrap_or(false);
            initial.initialized = hydration.errors.is_some() || has_root_loader_data;
            initial.errors = hydration.errors;
        } else if matches.is_none() {
            // An unmatched initial URL is itself a (synthesized) 404 and
            // needs no further loader work to be "initialized".
            initial.initialized = true;
            let mut errors = IndexMap::new();
            errors.insert(tree.roots[0].id.clone(), RouteErrorValue::Response(ErrorResponse::not_found(pathname)));
            initial.errors = Some(errors);
        }

        let engine = Engine::new(tree, opts.history.clone(), basename, initial);

        let weak = Arc::downgrade(&engine);
        let unsub = opts.history.listen(Box::new(move |action, location| {
            let Some(engine) = weak.upgrade() else { return };
            tokio::spawn(async move {
                engine.navigate_to(location, action).await;
            });
        }));
        engine.set_history_unsub(unsub);

        Ok(Router { engine })
    }

    /// Runs the initial round of loaders for matched routes not already
    /// covered by hydration data, then marks the router initialized.
    pub async fn initialize(&self) {
        self.engine.initialize().await;
    }

    pub fn state(&self) -> Arc<RouterState> {
        self.engine.state()
    }

    pub fn routes(&self) -> &RouteTree {
        self.engine.tree()
    }

    /// Subscribes to every committed state snapshot. Spec §5: "subscribers
    /// are notified synchronously after each commit."
    pub fn subscribe(&self, f: impl Fn(&RouterState) + Send + Sync + 'static) -> Unsubscribe {
        let id = self.engine.subscribe(Box::new(f) as Subscriber);
        Unsubscribe { engine: self.engine.clone(), id }
    }

    fn resolve(&self, to: &str, relative: Relative) -> String {
        let current = self.engine.state();
        let pathname = matcher::strip_basename(&current.location.pathname, self.engine.basename())
            .unwrap_or(&current.location.pathname);
        let current_matches: Vec<Match<'_>> = matcher::match_routes(self.engine.tree(), pathname).unwrap_or_default();
        navigation::resolve_to(to, relative, pathname, &current_matches)
    }

    /// Navigates to `to`, a possibly-relative path. GET navigations
    /// (`opts.submission` absent, or present with a GET method) enter
    /// `loading`; any other method enters `submitting` (spec §3).
    pub async fn navigate(&self, to: &str, opts: NavigateOpts) {
        let href = self.resolve(to, opts.relative);
        let history_action = if opts.replace { HistoryAction::Replace } else { HistoryAction::Push };
        self.engine.navigate(&href, history_action, opts).await;
    }

    /// `navigate(delta)`: delegates to the history adapter's `go`. The
    /// resulting POP is picked up by the listener registered in
    /// [`Router::create`].
    pub fn navigate_delta(&self, delta: i32) {
        self.engine.history_go(delta);
    }

    pub async fn revalidate(&self) {
        self.engine.revalidate().await;
    }

    /// A keyed, UI-independent data operation (spec §4.6). `to` is
    /// resolved the same way `navigate`'s `to` is.
    pub async fn fetch(&self, key: &str, route_id: RouteId, to: &str, opts: NavigateOpts) {
        let href = self.resolve(to, opts.relative);
        self.engine.fetch(key, route_id, &href, opts.submission).await;
    }

    pub fn get_fetcher(&self, key: &str) -> Arc<Fetcher> {
        self.engine.get_fetcher(key)
    }

    pub fn delete_fetcher(&self, key: &str) {
        self.engine.delete_fetcher(key);
    }

    pub fn create_href(&self, location: &Location) -> String {
        self.engine.create_href(location)
    }

    /// Registers scroll restoration bookkeeping, spec §6 /
    /// `SPEC_FULL.md` §10.6.
    pub fn enable_scroll_restoration(
        &self,
        positions: IndexMap<LocationKey, f64>,
        get_scroll_y: impl Fn() -> f64 + Send + Sync + 'static,
        get_key: Option<Box<dyn Fn(&Location, &[MatchSnapshot]) -> String + Send + Sync>>,
    ) {
        self.engine.enable_scroll_restoration(positions, get_scroll_y, get_key);
    }

    /// Releases every internal resource (abort controllers, tracked
    /// deferreds, subscribers). Spec §9: "must be released on dispose()."
    pub fn dispose(&self) {
        self.engine.dispose();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::route::Outcome;
    use async_trait::async_trait;

    struct RootLoader;
    #[async_trait]
    impl Loader for RootLoader {
        async fn call(&self, _req: request::RouterRequest) -> Outcome {
            Outcome::data(deferred::LoaderValue::Plain(serde_json::json!("ROOT")))
        }
    }

    fn memory_history(pathname: &str) -> Arc<dyn History> {
        crate::testing::MemoryHistory::new(pathname)
    }

    #[tokio::test]
    async fn create_rejects_empty_tree() {
        let err = Router::create(CreateOptions {
            routes: vec![],
            history: memory_history("/"),
            basename: None,
            hydration_data: None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyRouteTree));
    }

    #[tokio::test]
    async fn initializes_and_runs_root_loader() {
        let router = Router::create(CreateOptions {
            routes: vec![Route::builder("/").id("root").loader(RootLoader).build()],
            history: memory_history("/"),
            basename: None,
            hydration_data: None,
        })
        .unwrap();
        router.initialize().await;
        let state = router.state();
        assert!(state.initialized);
        assert_eq!(state.loader_data.get(&RouteId::from("root")), Some(&serde_json::json!("ROOT")));
    }

    #[tokio::test]
    async fn hydration_data_skips_initial_loader_run() {
        let mut loader_data = IndexMap::new();
        loader_data.insert(RouteId::from("root"), serde_json::json!("HYDRATED"));
        let router = Router::create(CreateOptions {
            routes: vec![Route::builder("/").id("root").loader(RootLoader).build()],
            history: memory_history("/"),
            basename: None,
            hydration_data: Some(HydrationData { loader_data, action_data: None, errors: None }),
        })
        .unwrap();
        assert!(router.state().initialized);
        assert_eq!(router.state().loader_data.get(&RouteId::from("root")), Some(&serde_json::json!("HYDRATED")));
    }
}
