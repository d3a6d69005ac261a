//! Navigation Orchestrator. Spec §4.5.
//!
//! Owns the full transition lifecycle: action phase, loading phase,
//! redirect chasing, error bubbling to the nearest boundary, and the
//! history commit. [`crate::fetcher::FetcherRegistry`] tracks fetcher
//! *state*; the call execution and revalidation machinery that drives both
//! navigations and fetcher operations lives here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::deferred::{DeferredRegistry, LoaderValue};
use crate::error::{ErrorResponse, RouteErrorValue};
use crate::fetcher::{Fetcher, FetcherOutcome, FetcherRegistry, FetcherState};
use crate::location::{History, HistoryAction, Location, LocationKey};
use crate::matcher::{match_routes, strip_basename, Match};
use crate::request::{build_loader_request, build_submission_request, FormData, Submission};
use crate::revalidate::{fetcher_should_revalidate, plan_revalidation, RevalidationContext};
use crate::route::{ActionResultSummary, Outcome, RouteId, RouteTree, ShouldRevalidateArgs};
use crate::state::{snapshot_matches, MatchSnapshot, RestoreScrollPosition, RevalidationState, RouterState, Subscriber, Subscribers};

/// Whether a relative `to` in `navigate`/`fetch` resolves against the
/// matched route's `pathnameBase` or the literal current URL. Spec
/// `SPEC_FULL.md` §10.6 ("Relative path resolution").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Relative {
    #[default]
    Route,
    Path,
}

/// Resolves a possibly-relative `to` against the current location and
/// matches. Absolute paths (leading `/`) pass through unchanged; `.` and
/// `..` segments are collapsed the way a browser resolves a relative URL.
pub fn resolve_to(to: &str, relative: Relative, current_pathname: &str, current_matches: &[Match<'_>]) -> String {
    if to.starts_with('/') {
        return to.to_string();
    }
    let base = match relative {
        Relative::Path => current_pathname,
        Relative::Route => current_matches.last().map(|m| m.pathname_base.as_str()).unwrap_or(current_pathname),
    };
    let mut segs: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for seg in to.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segs.pop();
            }
            other => segs.push(other),
        }
    }
    if segs.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segs.join("/"))
    }
}

/// Options accepted by `navigate`/`fetch`, spec §6's "Submission opts".
#[derive(Debug, Clone, Default)]
pub struct NavigateOpts {
    pub submission: Option<Submission>,
    pub replace: bool,
    pub prevent_scroll_reset: bool,
    pub relative: Relative,
}

/// The in-flight transition, mirrored in [`RouterState::navigation`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Navigation {
    Idle,
    Loading(NavigationLoad),
    Submitting(NavigationSubmit),
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigationLoad {
    pub location: Location,
    pub form_method: Option<String>,
    pub form_enc_type: Option<String>,
    #[serde(skip)]
    pub form_data: Option<FormData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigationSubmit {
    pub location: Location,
    pub form_method: String,
    pub form_enc_type: String,
    #[serde(skip)]
    pub form_data: FormData,
}

fn boundary_index(matches: &[Match], from: usize) -> usize {
    for i in (0..=from).rev() {
        if matches[i].route.has_error_boundary {
            return i;
        }
    }
    0
}

/// The key a committed `Location` should carry. A POP reuses the real key
/// of the history entry being returned to (threaded in from the history
/// adapter's own `Location`, not re-derived from a bare href string); any
/// other transition mints a fresh one (spec §4.5 "Key preservation").
fn resolve_key(history_action: HistoryAction, existing_key: &Option<LocationKey>) -> LocationKey {
    match (history_action, existing_key) {
        (HistoryAction::Pop, Some(key)) => key.clone(),
        _ => crate::location::new_key(),
    }
}

fn parse_href(href: &str) -> Location {
    let (before_hash, hash) = match href.find('#') {
        Some(i) => (&href[..i], &href[i..]),
        None => (href, ""),
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

/// What kind of call to make against the matched leaf route.
enum CallKind {
    Loader,
    Action(Submission),
}

type GetScrollY = Box<dyn Fn() -> f64 + Send + Sync>;
type GetRestorationKey = Box<dyn Fn(&Location, &[MatchSnapshot]) -> String + Send + Sync>;

/// Registration for `enableScrollRestoration` (spec `SPEC_FULL.md` §10.6):
/// a positions map keyed by restoration key, a scroll-y accessor, and an
/// optional key deriver (defaults to the location's own `key`).
struct ScrollRestoration {
    positions: Mutex<IndexMap<String, f64>>,
    get_scroll_y: GetScrollY,
    get_key: Option<GetRestorationKey>,
}

impl ScrollRestoration {
    fn key_for(&self, loc: &Location, matches: &[MatchSnapshot]) -> String {
        match &self.get_key {
            Some(f) => f(loc, matches),
            None => loc.key.clone(),
        }
    }
}

/// The engine: owns the route tree, the history adapter, fetcher and
/// deferred bookkeeping, and the single observable state snapshot.
pub struct Engine {
    tree: Arc<RouteTree>,
    history: Arc<dyn History>,
    basename: String,
    pub(crate) deferred: Arc<DeferredRegistry>,
    pub(crate) fetchers: Arc<FetcherRegistry>,
    state: RwLock<Arc<RouterState>>,
    subscribers: Subscribers,
    nav_id: AtomicU64,
    nav_token: Mutex<Option<CancellationToken>>,
    /// Set while a non-GET submission's action call is in flight, cleared
    /// once it settles. A navigation that supersedes another still sitting
    /// on this flag forces a full revalidation of its own matches, per
    /// spec §8 ("interrupted submission forces full revalidation").
    action_in_flight: AtomicBool,
    scroll: Mutex<Option<ScrollRestoration>>,
    history_unsub: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Engine {
    pub fn new(tree: Arc<RouteTree>, history: Arc<dyn History>, basename: String, initial: RouterState) -> Arc<Self> {
        Arc::new(Engine {
            tree,
            history,
            basename,
            deferred: Arc::new(DeferredRegistry::new()),
            fetchers: Arc::new(FetcherRegistry::new()),
            state: RwLock::new(Arc::new(initial)),
            subscribers: Subscribers::new(),
            nav_id: AtomicU64::new(0),
            nav_token: Mutex::new(None),
            action_in_flight: AtomicBool::new(false),
            scroll: Mutex::new(None),
            history_unsub: Mutex::new(None),
        })
    }

    /// Stores the unsubscribe handle for the POP listener registered by
    /// the caller (typically `Router::create`), so `dispose()` can release
    /// it along with every other process-local resource.
    pub fn set_history_unsub(&self, unsub: Box<dyn FnOnce() + Send>) {
        *self.history_unsub.lock().unwrap() = Some(unsub);
    }

    /// Registers scroll restoration bookkeeping. Spec `SPEC_FULL.md` §10.6.
    pub fn enable_scroll_restoration(
        &self,
        positions: IndexMap<String, f64>,
        get_scroll_y: impl Fn() -> f64 + Send + Sync + 'static,
        get_key: Option<GetRestorationKey>,
    ) {
        *self.scroll.lock().unwrap() =
            Some(ScrollRestoration { positions: Mutex::new(positions), get_scroll_y: Box::new(get_scroll_y), get_key });
    }

    fn save_scroll_position(&self, loc: &Location, matches: &[MatchSnapshot]) {
        let guard = self.scroll.lock().unwrap();
        if let Some(sr) = guard.as_ref() {
            let key = sr.key_for(loc, matches);
            let y = (sr.get_scroll_y)();
            sr.positions.lock().unwrap().insert(key, y);
        }
    }

    /// `number | null | false` per spec §3: `Disabled` when scroll
    /// restoration was never enabled, `None` when enabled but no position
    /// was captured for this entry, `Known(y)` otherwise. Only POP
    /// transitions restore a captured position; PUSH/REPLACE land on a
    /// fresh entry with nothing to restore.
    fn restore_position_for(&self, history_action: HistoryAction, loc: &Location, matches: &[MatchSnapshot]) -> RestoreScrollPosition {
        let guard = self.scroll.lock().unwrap();
        match guard.as_ref() {
            None => RestoreScrollPosition::Disabled,
            Some(sr) => match history_action {
                HistoryAction::Pop => {
                    let key = sr.key_for(loc, matches);
                    sr.positions
                        .lock()
                        .unwrap()
                        .get(&key)
                        .copied()
                        .map(RestoreScrollPosition::Known)
                        .unwrap_or(RestoreScrollPosition::None)
                }
                _ => RestoreScrollPosition::None,
            },
        }
    }

    pub fn state(&self) -> Arc<RouterState> {
        self.state.read().unwrap().clone()
    }

    pub fn tree(&self) -> &RouteTree {
        &self.tree
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn subscribe(&self, f: Subscriber) -> u64 {
        self.subscribers.subscribe(f)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.unsubscribe(id)
    }

    pub fn create_href(&self, location: &Location) -> String {
        let mut full = location.clone();
        full.pathname = format!("{}{}", self.basename.trim_end_matches('/'), location.pathname);
        self.history.create_href(&full)
    }

    pub fn get_fetcher(&self, key: &str) -> Arc<Fetcher> {
        self.fetchers.get(key)
    }

    pub fn delete_fetcher(&self, key: &str) {
        self.fetchers.delete(key);
    }

    /// Delegates to the history adapter's `go`, spec §4.5's `navigate(delta:
    /// int)`. The resulting POP is observed through the `listen` callback
    /// registered at construction, which re-enters `navigate`.
    pub fn history_go(&self, delta: i32) {
        self.history.go(delta);
    }

    /// Releases every process-local resource this engine instance owns:
    /// the inflight navigation's abort token, all tracked deferreds, and
    /// every fetcher's abort handle. Spec §9.
    pub fn dispose(&self) {
        if let Some(token) = self.nav_token.lock().unwrap().take() {
            token.cancel();
        }
        self.deferred.abort_all();
        self.fetchers.dispose();
        if let Some(unsub) = self.history_unsub.lock().unwrap().take() {
            unsub();
        }
    }

    fn stripped(&self, pathname: &str) -> String {
        strip_basename(pathname, &self.basename).unwrap_or(pathname).to_string()
    }

    fn commit(&self, new_state: RouterState) {
        log::trace!("commit: {} matches, navigation={:?}", new_state.matches.len(), new_state.navigation);
        let arc = Arc::new(new_state);
        *self.state.write().unwrap() = arc.clone();
        self.subscribers.notify(&arc);
    }

    /// Begins a new navigation, cancelling whatever navigation was
    /// previously in flight. Returns the token this navigation's loader
    /// calls should be cancelled by, and the navigation id used to detect
    /// a since-superseded commit.
    fn begin_nav(&self) -> (u64, CancellationToken) {
        let mut guard = self.nav_token.lock().unwrap();
        if let Some(prev) = guard.take() {
            prev.cancel();
        }
        let id = self.nav_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        (id, token)
    }

    fn is_current(&self, id: u64) -> bool {
        id == self.nav_id.load(Ordering::SeqCst)
    }

    /// Entry point for a user-initiated or programmatic navigation. `href`
    /// is basename-relative-or-absolute as the history adapter produces it.
    pub async fn navigate(&self, href: &str, history_action: HistoryAction, opts: NavigateOpts) {
        log::debug!("navigate: {:?} {}", history_action, href);
        let prevent_scroll_reset = opts.prevent_scroll_reset;
        self.run_navigation(href, history_action, opts.submission, opts.replace, false, prevent_scroll_reset, None).await;
    }

    /// POP entry point: the history adapter already knows the real
    /// `Location` (with its original `key`) for the entry being returned
    /// to. Threading it through lets `run_navigation` reuse that key
    /// instead of minting a fresh one from a bare href string, per spec
    /// §4.5 "Key preservation".
    pub async fn navigate_to(&self, location: Location, history_action: HistoryAction) {
        log::debug!("navigate: {:?} {}", history_action, location.href());
        let href = location.href();
        self.run_navigation(&href, history_action, None, false, false, false, Some(location.key)).await;
    }

    /// Runs the initial round of loaders for the current location's
    /// matched routes, skipping any route already covered by hydration
    /// data (loader data or an error), spec §6 ("Hydration data"). Unlike
    /// `revalidate()`, this is not a no-op revalidation: every matched
    /// route without hydration coverage runs regardless of whether its
    /// params/search "changed" (there is no prior state to compare to).
    pub async fn initialize(&self) {
        let snapshot = self.state();
        if snapshot.initialized {
            return;
        }
        let pathname = self.stripped(&snapshot.location.pathname);
        let Some(matches) = match_routes(&self.tree, &pathname) else { return };

        let mut plan = IndexSet::new();
        for m in &matches {
            if m.route.loader.is_none() {
                continue;
            }
            if snapshot.loader_data.contains_key(&m.route.id) {
                continue;
            }
            if snapshot.errors.as_ref().map(|e| e.contains_key(&m.route.id)).unwrap_or(false) {
                continue;
            }
            plan.insert(m.route.id.clone());
        }

        let (nav_id, token) = self.begin_nav();
        let (error_idx, loader_data, outcome) = self.run_loaders(&matches, &plan, &token, &snapshot.loader_data, &snapshot.location).await;

        if !self.is_current(nav_id) {
            return;
        }

        match outcome {
            RunLoadersOutcome::Redirect(r) => {
                self.chase_redirect(r, &snapshot.location, false).await;
            }
            RunLoadersOutcome::Settled { errors } => {
                let matched_ids: std::collections::HashSet<RouteId> = matches.iter().map(|m| m.route.id.clone()).collect();
                self.deferred.retain_matched(&matched_ids);

                let mut final_errors = errors;
                let mut final_loader_data = loader_data;
                if let (Some(idx), false) = (error_idx, final_errors.is_empty()) {
                    let boundary_idx = boundary_index(&matches, idx);
                    let boundary = matches[boundary_idx].route;
                    // Inclusive of the boundary itself: the boundary is an
                    // ancestor of the erroring route (or the erroring route
                    // itself, whose own entry `run_loaders` already
                    // stripped), so its loaderData is preserved, not
                    // wiped, per spec §7 ("ancestor loaderData is
                    // preserved").
                    final_loader_data.retain(|id, _| matches[..=boundary_idx].iter().any(|m| &m.route.id == id));
                    let err = final_errors.shift_remove(&matches[idx].route.id).unwrap();
                    final_errors = IndexMap::new();
                    final_errors.insert(boundary.id.clone(), err);
                }
                if let Some(existing) = &snapshot.errors {
                    for (id, e) in existing {
                        final_errors.entry(id.clone()).or_insert_with(|| e.clone());
                    }
                }

                let mut state = (*snapshot).clone();
                state.matches = snapshot_matches(&matches);
                state.initialized = true;
                state.loader_data = final_loader_data;
                state.errors = if final_errors.is_empty() { None } else { Some(final_errors) };
                self.commit(state);
            }
        }
    }

    /// Re-runs loaders for the current location without changing it (spec
    /// §4.4's explicit `revalidate()`). An explicit revalidation also
    /// aborts every currently tracked deferred (spec §5).
    pub async fn revalidate(&self) {
        self.deferred.abort_all();
        let current = self.state();
        let existing_key = Some(current.location.key.clone());
        self.run_navigation(&current.location.href(), HistoryAction::Pop, None, false, true, false, existing_key).await;
    }

    async fn run_navigation(
        &self,
        href: &str,
        history_action: HistoryAction,
        submission: Option<Submission>,
        replace_hint: bool,
        same_url_refresh: bool,
        prevent_scroll_reset: bool,
        existing_key: Option<LocationKey>,
    ) {
        let (nav_id, token) = self.begin_nav();
        // Consumed once: if the navigation this just cancelled was a
        // non-GET submission still waiting on its action, this one forces
        // full revalidation of its own matches (spec §8 scenario 5).
        let interrupted_submission = self.action_in_flight.swap(false, Ordering::SeqCst);

        let prev_snapshot = self.state();
        self.save_scroll_position(&prev_snapshot.location, &prev_snapshot.matches);
        let prev_pathname = self.stripped(&prev_snapshot.location.pathname);
        let prev_matches = match_routes(&self.tree, &prev_pathname).unwrap_or_default();
        let prev_errors: IndexMap<RouteId, RouteErrorValue> = IndexMap::new();

        let mut next_location = parse_href(href);
        let next_pathname = self.stripped(&next_location.pathname);
        let next_matches = match_routes(&self.tree, &next_pathname);

        let Some(next_matches) = next_matches else {
            if !self.is_current(nav_id) {
                return;
            }
            let mut errors = IndexMap::new();
            let mut loader_data = IndexMap::new();
            if let Some(m) = prev_matches.first() {
                errors.insert(m.route.id.clone(), RouteErrorValue::Response(ErrorResponse::not_found(&next_pathname)));
                // spec §4.5 "404": prior loaderData from routes no longer
                // matched is discarded except for the root loader's data.
                if let Some(v) = prev_snapshot.loader_data.get(&m.route.id) {
                    loader_data.insert(m.route.id.clone(), v.clone());
                }
            }
            next_location.key = resolve_key(history_action, &existing_key);
            let mut state = (*prev_snapshot).clone();
            state.history_action = history_action;
            state.location = next_location.clone();
            state.navigation = Navigation::Idle;
            state.matches = Vec::new();
            state.loader_data = loader_data;
            state.errors = Some(errors);
            state.prevent_scroll_reset = prevent_scroll_reset;
            state.restore_scroll_position = self.restore_position_for(history_action, &next_location, &state.matches);
            self.history.push(&next_location);
            self.commit(state);
            return;
        };

        // hash-only fast path: same route stack and same pathname+search,
        // only the hash differs. No loader is run; the transition commits
        // synchronously (spec §4.5).
        let same_path_and_search = prev_pathname == next_pathname && prev_snapshot.location.search == next_location.search;
        if same_path_and_search && !same_url_refresh && submission.is_none() {
            next_location.key = resolve_key(history_action, &existing_key);
            let mut state = (*prev_snapshot).clone();
            state.history_action = history_action;
            state.location = next_location.clone();
            state.prevent_scroll_reset = prevent_scroll_reset;
            state.restore_scroll_position = self.restore_position_for(history_action, &next_location, &state.matches);
            match history_action {
                HistoryAction::Push => self.history.push(&next_location),
                HistoryAction::Replace => self.history.replace(&next_location),
                HistoryAction::Pop => {}
            }
            self.commit(state);
            return;
        }

        let mut action_result: Option<ActionResultSummary> = None;
        // A boundary+error produced by the action phase itself (missing
        // action, a synchronously-rejected submission, or a thrown error).
        // Rather than committing immediately, it falls through to the
        // loading phase so ancestor loaders above the boundary still run
        // (spec §7, §8 scenario 2/boundary behaviors: "ancestor loaders
        // ran").
        let mut action_error: Option<(RouteId, RouteErrorValue)> = None;
        let mut skip_from: Option<usize> = None;
        let mut force_revalidate = same_url_refresh || interrupted_submission;

        if let Some(submission) = submission.clone() {
            if submission.is_get() {
                // No action runs for a GET submission; its form data folds
                // into the URL query instead (spec §3), replacing whatever
                // query the href already carried.
                match crate::request::serialize_get_href(&next_location.pathname, &submission.form_data) {
                    Ok(new_href) => {
                        let reparsed = parse_href(&new_href);
                        next_location.search = reparsed.search;
                    }
                    Err(resp) => {
                        let leaf_idx = next_matches.len() - 1;
                        let boundary_idx = boundary_index(&next_matches, leaf_idx);
                        let boundary = next_matches[boundary_idx].route;
                        action_error = Some((boundary.id.clone(), RouteErrorValue::Response(resp)));
                        skip_from = Some(boundary_idx);
                    }
                }
            } else {
                self.deferred.abort_all();

                let leaf_idx = next_matches.len() - 1;
                let leaf = &next_matches[leaf_idx];

                let mut loading = (*prev_snapshot).clone();
                loading.navigation = Navigation::Submitting(NavigationSubmit {
                    location: next_location.clone(),
                    form_method: submission.method.to_string(),
                    form_enc_type: submission.enc_type.content_type().to_string(),
                    form_data: submission.form_data.clone(),
                });
                self.commit(loading);

                if leaf.route.action.is_none() {
                    let boundary_idx = boundary_index(&next_matches, leaf_idx);
                    let boundary = next_matches[boundary_idx].route;
                    action_error = Some((boundary.id.clone(), RouteErrorValue::Response(ErrorResponse::no_action(&next_pathname))));
                    skip_from = Some(boundary_idx);
                    force_revalidate = true;
                } else {
                    match build_submission_request(&next_location.href(), &submission, token.child_token()) {
                        Ok(req) => {
                            self.action_in_flight.store(true, Ordering::SeqCst);
                            let outcome = leaf.route.action.as_ref().unwrap().call(req).await;
                            self.action_in_flight.store(false, Ordering::SeqCst);

                            if !self.is_current(nav_id) {
                                return;
                            }

                            match outcome {
                                Outcome::Redirect(r) => {
                                    self.chase_redirect(r, &next_location, true).await;
                                    return;
                                }
                                Outcome::Error(err) => {
                                    let boundary_idx = boundary_index(&next_matches, leaf_idx);
                                    let boundary = next_matches[boundary_idx].route;
                                    action_error = Some((boundary.id.clone(), err));
                                    skip_from = Some(boundary_idx);
                                    force_revalidate = true;
                                }
                                Outcome::Data(data, _meta) => {
                                    data.await_all().await;
                                    force_revalidate = true;
                                    action_result = Some(ActionResultSummary::Data(data));
                                }
                            }
                        }
                        Err(resp) => {
                            let boundary_idx = boundary_index(&next_matches, leaf_idx);
                            let boundary = next_matches[boundary_idx].route;
                            action_error = Some((boundary.id.clone(), RouteErrorValue::Response(resp)));
                            skip_from = Some(boundary_idx);
                            force_revalidate = true;
                        }
                    }
                }

                if !self.is_current(nav_id) {
                    return;
                }
            }
        }

        // Loading phase.
        let mut loading = (*prev_snapshot).clone();
        loading.navigation = Navigation::Loading(NavigationLoad {
            location: next_location.clone(),
            form_method: submission.as_ref().map(|s| s.method.to_string()),
            form_enc_type: submission.as_ref().map(|s| s.enc_type.content_type().to_string()),
            form_data: submission.as_ref().map(|s| s.form_data.clone()),
        });
        self.commit(loading);

        let ctx = RevalidationContext {
            current_url: prev_snapshot.location.href(),
            next_url: next_location.href(),
            form_method: submission.as_ref().map(|s| s.method.clone()),
            form_enc_type: submission.as_ref().map(|s| s.enc_type),
            form_data: submission.as_ref().map(|s| s.form_data.clone()),
            form_action: submission.as_ref().map(|_| next_location.pathname.clone()),
            action_result: action_result.clone(),
            force_revalidate,
            same_url_refresh,
        };

        let plan = plan_revalidation(&prev_matches, &next_matches, &ctx, &prev_errors).await;
        // An action-phase error/missing-action boundary excludes the
        // boundary route and everything below it from this round.
        let plan: IndexSet<RouteId> = match skip_from {
            Some(b) => next_matches
                .iter()
                .enumerate()
                .filter(|(i, m)| *i < b && plan.contains(&m.route.id))
                .map(|(_, m)| m.route.id.clone())
                .collect(),
            None => plan,
        };
        log::debug!("revalidation plan: {} of {} matched routes will run loaders", plan.len(), next_matches.len());

        let (error_idx, loader_data, errors_opt) = self
            .run_loaders(&next_matches, &plan, &token, &prev_snapshot.loader_data, &next_location)
            .await;

        if !self.is_current(nav_id) {
            return;
        }

        match errors_opt {
            RunLoadersOutcome::Redirect(r) => {
                self.chase_redirect(r, &next_location, false).await;
            }
            RunLoadersOutcome::Settled { errors } => {
                let matched_ids: std::collections::HashSet<RouteId> = next_matches.iter().map(|m| m.route.id.clone()).collect();
                self.deferred.retain_matched(&matched_ids);

                let mut final_errors = errors;
                let mut final_loader_data = loader_data;
                let mut truncate_to: Option<usize> = skip_from;
                if let (Some(idx), false) = (error_idx, final_errors.is_empty()) {
                    let boundary_idx = boundary_index(&next_matches, idx);
                    let boundary = next_matches[boundary_idx].route;
                    let err = final_errors.shift_remove(&next_matches[idx].route.id).unwrap();
                    final_errors = IndexMap::new();
                    final_errors.insert(boundary.id.clone(), err);
                    truncate_to = Some(truncate_to.map(|b| b.min(boundary_idx)).unwrap_or(boundary_idx));
                }
                if let Some((id, err)) = action_error {
                    final_errors.insert(id, err);
                }
                if let Some(b) = truncate_to {
                    // Inclusive: `b`'s own loaderData (an ancestor of, or
                    // identical to, whichever route actually errored) is
                    // preserved rather than discarded; see the matching
                    // note in `initialize()`.
                    final_loader_data.retain(|id, _| next_matches[..=b].iter().any(|m| &m.route.id == id));
                }

                next_location.key = resolve_key(history_action, &existing_key);

                let mut state = (*prev_snapshot).clone();
                state.history_action = history_action;
                state.location = next_location.clone();
                state.matches = snapshot_matches(&next_matches);
                state.initialized = true;
                state.navigation = Navigation::Idle;
                state.revalidation = RevalidationState::Idle;
                state.loader_data = final_loader_data;
                state.action_data = action_result.map(|r| {
                    let mut m = IndexMap::new();
                    if let ActionResultSummary::Data(LoaderValue::Plain(v)) = r {
                        m.insert(next_matches.last().unwrap().route.id.clone(), v);
                    }
                    m
                });
                state.errors = if final_errors.is_empty() { None } else { Some(final_errors) };
                state.prevent_scroll_reset = prevent_scroll_reset;
                state.restore_scroll_position = self.restore_position_for(history_action, &next_location, &state.matches);

                match history_action {
                    HistoryAction::Push => self.history.push(&next_location),
                    HistoryAction::Replace => self.history.replace(&next_location),
                    HistoryAction::Pop => {}
                }
                self.commit(state);

                // A non-GET submission just mutated external state; every
                // currently registered fetcher participates in the
                // following revalidation, per spec §4.4/§4.6. This
                // navigation's own matches were already force-revalidated
                // above (default_decision treats any non-GET form_method as
                // always-revalidate); this only covers *other* fetchers.
                if submission.as_ref().map(|s| !s.is_get()).unwrap_or(false) {
                    self.revalidate_fetchers(None).await;
                }
            }
        }
    }

    /// Runs every route in `plan` concurrently. A thrown redirect cancels
    /// the token (aborting in-flight siblings immediately); a returned
    /// redirect is only acted on once every loader in the batch has
    /// settled, per the thrown/returned asymmetry in spec §4.5/§5.
    async fn run_loaders(
        &self,
        matches: &[Match<'_>],
        plan: &IndexSet<RouteId>,
        token: &CancellationToken,
        prev_loader_data: &IndexMap<RouteId, serde_json::Value>,
        base_location: &Location,
    ) -> (Option<usize>, IndexMap<RouteId, serde_json::Value>, RunLoadersOutcome) {
        let mut futs = FuturesUnordered::new();
        for (idx, m) in matches.iter().enumerate() {
            if !plan.contains(&m.route.id) {
                continue;
            }
            let Some(loader) = &m.route.loader else { continue };
            let mut loc = Location::new(&m.pathname);
            loc.search = base_location.search.clone();
            loc.hash = base_location.hash.clone();
            let req = build_loader_request(&loc, token.child_token());
            let loader = loader.clone();
            futs.push(async move { (idx, loader.call(req).await) });
        }

        let mut results: IndexMap<usize, Outcome> = IndexMap::new();
        let mut thrown_redirect = None;
        while let Some((idx, outcome)) = futs.next().await {
            if let Outcome::Redirect(r) = &outcome {
                if r.thrown {
                    token.cancel();
                    thrown_redirect = Some(r.clone());
                    break;
                }
            }
            results.insert(idx, outcome);
        }
        drop(futs);

        if let Some(r) = thrown_redirect {
            return (None, IndexMap::new(), RunLoadersOutcome::Redirect(r));
        }

        for outcome in results.values() {
            if let Outcome::Redirect(r) = outcome {
                return (None, IndexMap::new(), RunLoadersOutcome::Redirect(r.clone()));
            }
        }

        let mut loader_data = prev_loader_data.clone();
        let mut errors = IndexMap::new();
        let mut first_error_idx = None;

        for (idx, m) in matches.iter().enumerate() {
            if !plan.contains(&m.route.id) {
                continue;
            }
            match results.shift_remove(&idx) {
                Some(Outcome::Data(data, _meta)) => {
                    if let LoaderValue::Deferred(d) = &data {
                        self.deferred.set(m.route.id.clone(), d.clone());
                        loader_data.insert(m.route.id.clone(), serde_json::Value::Object(d.sync_snapshot()));
                    } else if let LoaderValue::Plain(v) = &data {
                        loader_data.insert(m.route.id.clone(), v.clone());
                    }
                }
                Some(Outcome::Error(e)) => {
                    if first_error_idx.is_none() {
                        first_error_idx = Some(idx);
                    }
                    errors.insert(m.route.id.clone(), e);
                    loader_data.shift_remove(&m.route.id);
                }
                Some(Outcome::Redirect(_)) | None => {}
            }
        }

        (first_error_idx, loader_data, RunLoadersOutcome::Settled { errors })
    }

    /// `force_replace` is set by the caller for action-induced redirects,
    /// which always use `REPLACE` regardless of the redirect's own
    /// `replace` field (spec §4.5 "Action-induced redirects use REPLACE").
    async fn chase_redirect(&self, redirect: crate::route::Redirect, from: &Location, force_replace: bool) {
        log::debug!("chasing redirect: {} -> {} (thrown={})", from.href(), redirect.location, redirect.thrown);
        let history_action = if redirect.replace || force_replace { HistoryAction::Replace } else { HistoryAction::Push };
        let _ = from;
        self.run_navigation(&redirect.location, history_action, None, redirect.replace, redirect.force_revalidate, false, None).await;
    }

    /// A keyed, UI-independent data operation. Spec §4.6.
    pub async fn fetch(&self, key: &str, route_id: RouteId, href: &str, submission: Option<Submission>) {
        log::debug!("fetch: key={} route={} href={}", key, route_id, href);
        let current = self.state();
        let pathname = self.stripped(&current.location.pathname);
        let Some(matches) = match_routes(&self.tree, &pathname) else { return };
        let Some(route) = matches.iter().find(|m| m.route.id == route_id).map(|m| m.route) else { return };

        let kind = match &submission {
            Some(s) if !s.is_get() => CallKind::Action(s.clone()),
            _ => CallKind::Loader,
        };

        // A GET submission never invokes an action; its form data folds
        // into the loader href instead, same as a GET submission navigation.
        let loader_href = match &submission {
            Some(s) if s.is_get() => crate::request::serialize_get_href(href, &s.form_data),
            _ => Ok(href.to_string()),
        };

        let (generation, token) = self.fetchers.begin(
            key,
            route_id.clone(),
            match &kind {
                CallKind::Action(s) => Some((s.method.clone(), s.form_data.clone())),
                CallKind::Loader => None,
            },
        );

        let outcome = match loader_href {
            Err(resp) => Outcome::Error(RouteErrorValue::Response(resp)),
            Ok(loader_href) => match &kind {
                CallKind::Loader => {
                    if let Some(loader) = &route.loader {
                        let req = build_loader_request(&parse_href(&loader_href), token.child_token());
                        loader.call(req).await
                    } else {
                        Outcome::Error(RouteErrorValue::Response(ErrorResponse::no_action(&loader_href)))
                    }
                }
                CallKind::Action(submission) => {
                    if let Some(action) = &route.action {
                        match build_submission_request(href, submission, token.child_token()) {
                            Ok(req) => action.call(req).await,
                            Err(resp) => Outcome::Error(RouteErrorValue::Response(resp)),
                        }
                    } else {
                        Outcome::Error(RouteErrorValue::Response(ErrorResponse::no_action(href)))
                    }
                }
            },
        };

        match outcome {
            Outcome::Redirect(r) => {
                self.chase_redirect(r, &self.state().location, matches!(kind, CallKind::Action(_))).await;
            }
            Outcome::Data(data, _meta) => {
                data.await_all().await;
                let was_mutation = matches!(kind, CallKind::Action(_));
                if self.fetchers.commit_if_current(key, generation, FetcherOutcome::Data(data)) {
                    self.notify_state_unchanged();
                    if was_mutation {
                        self.revalidate_after_mutation().await;
                        self.revalidate_fetchers(Some(key)).await;
                    }
                }
            }
            Outcome::Error(e) => {
                if self.fetchers.commit_if_current(key, generation, FetcherOutcome::Error(e.clone())) {
                    let current = self.state();
                    let pathname = self.stripped(&current.location.pathname);
                    if let Some(matches) = match_routes(&self.tree, &pathname) {
                        if let Some(idx) = matches.iter().position(|m| m.route.id == route_id) {
                            let boundary_idx = boundary_index(&matches, idx);
                            let boundary = matches[boundary_idx].route;
                            let mut state = (*current).clone();
                            let mut errors = state.errors.unwrap_or_default();
                            errors.insert(boundary.id.clone(), e);
                            state.errors = Some(errors);
                            state.fetchers = self.fetchers.snapshot();
                            self.commit(state);
                            return;
                        }
                    }
                    self.notify_state_unchanged();
                }
            }
        }
    }

    fn notify_state_unchanged(&self) {
        let mut state = (*self.state()).clone();
        state.fetchers = self.fetchers.snapshot();
        self.commit(state);
    }

    /// Re-runs every non-excluded fetcher that doesn't opt out after a
    /// mutation (a navigation action or another fetcher's action), spec
    /// §4.4 "Fetcher participation" / §4.6. Fetchers without data, or
    /// currently loading/submitting, never opt out and are always
    /// re-queued; idle fetchers with data whose prior commit was
    /// invalidated by a pending-deferred cancellation are likewise always
    /// re-queued regardless of `shouldRevalidate`; other idle fetchers with
    /// data consult their own `shouldRevalidate` with
    /// `defaultShouldRevalidate = true`. Resolves each fetcher against the
    /// engine's *current* matches rather than the URL that triggered its
    /// original fetch (spec §4.6).
    async fn revalidate_fetchers(&self, exclude_key: Option<&str>) {
        let current = self.state();
        let pathname = self.stripped(&current.location.pathname);
        let Some(matches) = match_routes(&self.tree, &pathname) else { return };

        let mut to_refetch = Vec::new();
        for (key, route_id) in self.fetchers.all_keys() {
            if exclude_key == Some(key.as_str()) {
                continue;
            }
            let Some(m) = matches.iter().find(|m| m.route.id == route_id) else { continue };
            let fetcher = self.fetchers.get(&key);
            let is_idle = fetcher.state == FetcherState::Idle;
            let has_data = fetcher.data.is_some();

            if is_idle && has_data && fetcher.invalidated {
                to_refetch.push((key, route_id, m.pathname.clone()));
                continue;
            }

            let args = ShouldRevalidateArgs {
                current_params: m.params.clone(),
                current_url: current.location.href(),
                next_params: m.params.clone(),
                next_url: current.location.href(),
                form_method: Some(http::Method::POST),
                form_data: None,
                form_enc_type: None,
                form_action: None,
                action_result: None,
                default_should_revalidate: true,
            };
            if fetcher_should_revalidate(m.route, has_data, is_idle, args).await {
                to_refetch.push((key, route_id, m.pathname.clone()));
            }
        }

        for (key, route_id, href) in to_refetch {
            self.fetch(&key, route_id, &href, None).await;
        }
    }

    /// Re-runs loaders for the current navigation's matches after a
    /// fetcher mutation (every loader forced, since a non-GET just
    /// happened). Other fetchers' own participation is handled separately
    /// by [`Engine::revalidate_fetchers`].
    async fn revalidate_after_mutation(&self) {
        let current = self.state();
        let pathname = self.stripped(&current.location.pathname);
        let Some(matches) = match_routes(&self.tree, &pathname) else { return };

        let ctx = RevalidationContext {
            current_url: current.location.href(),
            next_url: current.location.href(),
            form_method: Some(http::Method::POST),
            form_enc_type: None,
            form_data: None,
            form_action: None,
            action_result: None,
            force_revalidate: false,
            same_url_refresh: false,
        };
        let plan = plan_revalidation(&matches, &matches, &ctx, &IndexMap::new()).await;
        let (nav_id, token) = self.begin_nav();
        let (error_idx, loader_data, outcome) = self.run_loaders(&matches, &plan, &token, &current.loader_data, &current.location).await;

        if !self.is_current(nav_id) {
            return;
        }

        if let RunLoadersOutcome::Settled { mut errors } = outcome {
            let mut final_loader_data = loader_data;
            if let Some(idx) = error_idx {
                let boundary_idx = boundary_index(&matches, idx);
                let boundary = matches[boundary_idx].route;
                final_loader_data.retain(|id, _| matches[..=boundary_idx].iter().any(|m| &m.route.id == id));
                if let Some(e) = errors.shift_remove(&matches[idx].route.id) {
                    errors = IndexMap::new();
                    errors.insert(boundary.id.clone(), e);
                }
            }
            let mut state = (*current).clone();
            state.loader_data = final_loader_data;
            state.fetchers = self.fetchers.snapshot();
            if !errors.is_empty() {
                state.errors = Some(errors);
            }
            self.commit(state);
        }
    }
}

enum RunLoadersOutcome {
    Redirect(crate::route::Redirect),
    Settled { errors: IndexMap<RouteId, RouteErrorValue> },
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;

    use crate::error::AbortKind;
    use crate::route::{Loader, Redirect, Route};
    use crate::testing::MemoryHistory;
    use crate::{CreateOptions, HydrationData, Router};

    /// A loader/action built from a closure, so each scenario below can
    /// capture its own counters without a one-off struct per test.
    struct FnCallable(std::sync::Arc<dyn Fn() -> Outcome + Send + Sync>);

    impl FnCallable {
        fn new(f: impl Fn() -> Outcome + Send + Sync + 'static) -> Self {
            FnCallable(std::sync::Arc::new(f))
        }
    }

    #[async_trait]
    impl Loader for FnCallable {
        async fn call(&self, _req: crate::request::RouterRequest) -> Outcome {
            (self.0)()
        }
    }

    #[async_trait]
    impl crate::route::Action for FnCallable {
        async fn call(&self, _req: crate::request::RouterRequest) -> Outcome {
            (self.0)()
        }
    }

    fn history(pathname: &str) -> std::sync::Arc<dyn History> {
        MemoryHistory::new(pathname)
    }

    fn router(routes: Vec<Route>, pathname: &str) -> Router {
        Router::create(CreateOptions { routes, history: history(pathname), basename: None, hydration_data: None }).unwrap()
    }

    fn plain(v: serde_json::Value) -> Outcome {
        Outcome::data(LoaderValue::Plain(v))
    }

    fn submission(method: http::Method) -> Submission {
        Submission { method, enc_type: crate::request::FormEncType::UrlEncoded, form_data: FormData::new() }
    }

    // Scenario 1 (spec §8): a hash-only navigation does not run any
    // loader, advances the location key, and never leaves `idle`.
    #[tokio::test]
    async fn hash_only_navigation_skips_loaders_and_advances_key() {
        let calls = std::sync::Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let root = Route::builder("/").id("root").loader(FnCallable::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            plain(serde_json::json!("ROOT"))
        })).build();

        let r = router(vec![root], "/");
        r.initialize().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let prev_key = r.state().location.key.clone();

        r.navigate("/#section", NavigateOpts::default()).await;

        let state = r.state();
        assert_eq!(state.location.hash, "#section");
        assert_ne!(state.location.key, prev_key);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "hash-only navigation must not rerun any loader");
        assert!(matches!(state.navigation, Navigation::Idle));
    }

    // Scenario 2 (spec §8): an action error is keyed at the nearest
    // boundary; ancestor loaders above it still run; the descendant's own
    // loader never runs; `actionData` stays `None`.
    #[tokio::test]
    async fn action_error_isolates_to_boundary_ancestor_loaders_still_run() {
        let child_loader_calls = std::sync::Arc::new(AtomicU64::new(0));
        let child_loader_calls2 = child_loader_calls.clone();

        let parent = Route::builder("/parent")
            .id("parent")
            .error_boundary()
            .loader(FnCallable::new(|| plain(serde_json::json!("PARENT"))))
            .child(
                Route::builder("child")
                    .id("child")
                    .loader(FnCallable::new(move || {
                        child_loader_calls2.fetch_add(1, Ordering::SeqCst);
                        plain(serde_json::json!("CHILD"))
                    }))
                    .action(FnCallable::new(|| {
                        Outcome::Error(RouteErrorValue::App(std::sync::Arc::new(std::io::Error::other("X"))))
                    }))
                    .build(),
            )
            .build();

        let r = router(vec![parent], "/parent/child");
        r.initialize().await;
        assert_eq!(r.state().loader_data.get(&RouteId::from("child")), Some(&serde_json::json!("CHILD")));
        assert_eq!(child_loader_calls.load(Ordering::SeqCst), 1);

        let mut opts = NavigateOpts::default();
        opts.submission = Some(submission(http::Method::POST));
        r.navigate("/parent/child", opts).await;

        let state = r.state();
        assert!(state.errors.as_ref().unwrap().contains_key(&RouteId::from("parent")));
        assert!(state.action_data.is_none());
        assert_eq!(state.loader_data.get(&RouteId::from("parent")), Some(&serde_json::json!("PARENT")));
        assert!(!state.loader_data.contains_key(&RouteId::from("child")), "child loader must not run after its own action errors");
        assert_eq!(child_loader_calls.load(Ordering::SeqCst), 1, "child loader did not run again");
    }

    // Scenario 3 (spec §8): a loader redirect carrying `X-Remix-Revalidate`
    // drives a follow-up navigation that reruns the ancestor's loader even
    // though the ancestor's own params/search did not change.
    #[tokio::test]
    async fn loader_redirect_with_revalidate_header_reruns_ancestor_loader() {
        let root_calls = std::sync::Arc::new(AtomicU64::new(0));
        let root_calls2 = root_calls.clone();

        let root = Route::builder("/")
            .id("root")
            .error_boundary()
            .loader(FnCallable::new(move || {
                let n = root_calls2.fetch_add(1, Ordering::SeqCst) + 1;
                plain(serde_json::json!(format!("ROOT-{n}")))
            }))
            .child(Route::index_builder().id("index").build())
            .child(
                Route::builder("foo")
                    .id("foo")
                    .loader(FnCallable::new(|| {
                        Outcome::Redirect(Redirect {
                            status: 302,
                            location: "/bar".to_string(),
                            force_revalidate: true,
                            thrown: false,
                            replace: false,
                        })
                    }))
                    .build(),
            )
            .child(Route::builder("bar").id("bar").loader(FnCallable::new(|| plain(serde_json::json!("BAR")))).build())
            .build();

        let r = router(vec![root], "/");
        r.initialize().await;
        assert_eq!(r.state().loader_data.get(&RouteId::from("root")), Some(&serde_json::json!("ROOT-1")));

        r.navigate("/foo", NavigateOpts::default()).await;

        let state = r.state();
        assert_eq!(state.location.pathname, "/bar");
        assert_eq!(root_calls.load(Ordering::SeqCst), 2, "root loader must rerun on the revalidate-forcing redirect");
        assert_eq!(state.loader_data.get(&RouteId::from("root")), Some(&serde_json::json!("ROOT-2")));
        assert_eq!(state.loader_data.get(&RouteId::from("bar")), Some(&serde_json::json!("BAR")));
    }

    // Scenario 4 (spec §8): an idle fetcher with data revalidates after an
    // unrelated navigation action settles.
    #[tokio::test]
    async fn fetcher_revalidates_after_navigation_action_mutation() {
        let loader_calls = std::sync::Arc::new(AtomicU64::new(0));
        let loader_calls2 = loader_calls.clone();

        let tasks = Route::builder("/tasks")
            .id("tasks")
            .action(FnCallable::new(|| plain(serde_json::json!("ok"))))
            .loader(FnCallable::new(move || {
                let n = loader_calls2.fetch_add(1, Ordering::SeqCst) + 1;
                plain(serde_json::json!(format!("T{n}")))
            }))
            .build();

        let r = router(vec![tasks], "/tasks");
        r.initialize().await;
        assert_eq!(loader_calls.load(Ordering::SeqCst), 1, "initialize runs the loader once");

        r.fetch("K", RouteId::from("tasks"), "/tasks", NavigateOpts::default()).await;
        assert_eq!(loader_calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.get_fetcher("K").state, crate::fetcher::FetcherState::Idle);

        let mut opts = NavigateOpts::default();
        opts.submission = Some(submission(http::Method::POST));
        r.navigate("/tasks", opts).await;

        // The navigation's own loader reruns (forced: non-GET submission),
        // and fetcher K (idle, holding data) independently revalidates
        // against the current matches afterward.
        assert_eq!(loader_calls.load(Ordering::SeqCst), 4, "both the navigation's own loader and fetcher K must rerun");
        let fetcher = r.get_fetcher("K");
        assert_eq!(fetcher.state, crate::fetcher::FetcherState::Idle);
    }

    // Spec §4.4/§4.6: "fetchers without data, or currently loading, do not
    // opt out and are always re-run" — a fetcher still sitting in `loading`
    // must be re-queued by revalidation, not skipped outright.
    #[tokio::test]
    async fn loading_fetcher_is_requeued_after_mutation() {
        let calls = std::sync::Arc::new(AtomicU64::new(0));
        let calls2 = calls.clone();
        let data = Route::builder("/data")
            .id("data")
            .loader(FnCallable::new(move || {
                let n = calls2.fetch_add(1, Ordering::SeqCst) + 1;
                plain(serde_json::json!(format!("D{n}")))
            }))
            .build();

        let r = router(vec![data], "/data");
        r.initialize().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "initialize runs the loader once");

        // Manufacture a fetcher sitting in `loading` with no committed data
        // yet, so `revalidate_fetchers` observes it mid-flight.
        let (_generation, _token) = r.engine.fetchers.begin("K", RouteId::from("data"), None);
        assert_eq!(r.get_fetcher("K").state, crate::fetcher::FetcherState::Loading);

        r.engine.revalidate_fetchers(None).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2, "a loading fetcher must still be re-queued, not skipped");
        assert_eq!(r.get_fetcher("K").state, crate::fetcher::FetcherState::Idle);
    }

    // Spec §4.6: an idle fetcher whose prior data was invalidated by a
    // pending-deferred cancellation is force-revalidated regardless of
    // `shouldRevalidate`, even when the route opts out by returning `false`.
    #[tokio::test]
    async fn invalidated_fetcher_forces_revalidation_despite_should_revalidate_false() {
        struct NeverRevalidate;
        #[async_trait]
        impl crate::route::ShouldRevalidate for NeverRevalidate {
            async fn call(&self, _args: crate::route::ShouldRevalidateArgs) -> Option<bool> {
                Some(false)
            }
        }

        struct AbortedDeferredLoader {
            calls: std::sync::Arc<AtomicU64>,
        }
        #[async_trait]
        impl Loader for AbortedDeferredLoader {
            async fn call(&self, _req: crate::request::RouterRequest) -> Outcome {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                let p = crate::deferred::TrackedPromise::spawn(async {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(serde_json::json!("late"))
                });
                p.abort();
                let mut fields = indexmap::IndexMap::new();
                fields.insert("n".to_string(), crate::deferred::DeferredField::Value(serde_json::json!(n)));
                fields.insert("slow".to_string(), crate::deferred::DeferredField::Tracked(p));
                Outcome::data(LoaderValue::Deferred(std::sync::Arc::new(crate::deferred::Deferred::new(fields))))
            }
        }

        let calls = std::sync::Arc::new(AtomicU64::new(0));
        let item = Route::builder("/items")
            .id("item")
            .loader(AbortedDeferredLoader { calls: calls.clone() })
            .should_revalidate(NeverRevalidate)
            .build();

        let r = router(vec![item], "/items");
        r.initialize().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        r.fetch("K", RouteId::from("item"), "/items", NavigateOpts::default()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let fetcher = r.get_fetcher("K");
        assert_eq!(fetcher.state, crate::fetcher::FetcherState::Idle);
        assert!(fetcher.invalidated, "a field that settled aborted must mark the fetcher invalidated");

        r.engine.revalidate_fetchers(None).await;

        assert_eq!(
            calls.load(Ordering::SeqCst),
            3,
            "an invalidated fetcher must re-run even though its own shouldRevalidate returns false"
        );
    }

    // Boundary behavior (spec §8): POST to a leaf with no action produces a
    // 405 keyed at the nearest boundary; ancestor loaders above it ran.
    #[tokio::test]
    async fn post_without_action_produces_405_and_preserves_ancestor_loader_data() {
        let parent = Route::builder("/parent")
            .id("parent")
            .error_boundary()
            .loader(FnCallable::new(|| plain(serde_json::json!("PARENT"))))
            .child(Route::builder("child").id("child").build())
            .build();

        let r = router(vec![parent], "/parent/child");
        r.initialize().await;
        assert_eq!(r.state().loader_data.get(&RouteId::from("parent")), Some(&serde_json::json!("PARENT")));

        let mut opts = NavigateOpts::default();
        opts.submission = Some(submission(http::Method::POST));
        r.navigate("/parent/child", opts).await;

        let state = r.state();
        let err = state.errors.as_ref().unwrap().get(&RouteId::from("parent")).unwrap();
        assert_eq!(err.as_error_response().unwrap().status, 405);
        assert_eq!(state.loader_data.get(&RouteId::from("parent")), Some(&serde_json::json!("PARENT")));
    }

    // Boundary behavior (spec §8): an unmatched URL produces a 404 at the
    // root boundary; prior loader data for routes no longer matched is
    // discarded, except the root loader's own data, which is preserved.
    #[tokio::test]
    async fn unmatched_url_produces_404_and_preserves_root_loader_data() {
        let root = Route::builder("/")
            .id("root")
            .loader(FnCallable::new(|| plain(serde_json::json!("ROOT"))))
            .child(Route::index_builder().id("index").loader(FnCallable::new(|| plain(serde_json::json!("INDEX")))).build())
            .build();

        let r = router(vec![root], "/");
        r.initialize().await;
        assert!(r.state().loader_data.contains_key(&RouteId::from("index")));

        r.navigate("/nope", NavigateOpts::default()).await;

        let state = r.state();
        assert!(state.errors.as_ref().unwrap().contains_key(&RouteId::from("root")));
        assert_eq!(state.loader_data.get(&RouteId::from("root")), Some(&serde_json::json!("ROOT")));
        assert!(!state.loader_data.contains_key(&RouteId::from("index")));
    }

    // spec §4.5 / §8: client-initiated navigations PUSH; action-induced
    // redirects REPLACE.
    #[tokio::test]
    async fn action_redirect_uses_replace_history_action() {
        // `replace: false` here on purpose: action-induced redirects force
        // REPLACE regardless of the redirect's own flag (spec §4.5).
        let root = Route::builder("/foo")
            .id("foo")
            .action(FnCallable::new(|| Outcome::Redirect(Redirect {
                status: 302,
                location: "/bar".to_string(),
                force_revalidate: false,
                thrown: false,
                replace: false,
            })))
            .build();
        let bar = Route::builder("/bar").id("bar").build();

        let r = router(vec![root, bar], "/foo");

        let mut opts = NavigateOpts::default();
        opts.submission = Some(submission(http::Method::POST));
        r.navigate("/foo", opts).await;

        let state = r.state();
        assert_eq!(state.location.pathname, "/bar");
        assert!(matches!(state.history_action, HistoryAction::Replace));
    }

    // spec §4.5: a POP navigation reuses the existing history entry's key,
    // not a freshly minted one.
    #[tokio::test]
    async fn pop_navigation_reuses_existing_key() {
        let root = Route::builder("/a").id("a").build();
        let other = Route::builder("/b").id("b").build();
        let r = router(vec![root, other], "/a");
        let a_key = r.state().location.key.clone();

        r.navigate("/b", NavigateOpts::default()).await;
        let b_key = r.state().location.key.clone();

        r.navigate_delta(-1);
        // the MemoryHistory listener re-enters navigate() asynchronously;
        // give the spawned task a chance to run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let state = r.state();
        assert_eq!(state.location.pathname, "/a");
        assert_eq!(state.location.key, a_key, "POP must reuse the original entry's key, not mint a new one");
        assert_ne!(state.location.key, b_key);
    }

    // spec §4.3/§5: a pending deferred for a route no longer matched after
    // the transition is aborted with the "aborted deferred" kind; a late
    // resolution causes no state update.
    #[tokio::test]
    async fn deferred_for_unmatched_route_is_aborted_on_navigation_away() {
        use crate::deferred::{Deferred, DeferredField, DeferredStatus, TrackedPromise};

        let deferred_holder: std::sync::Arc<Mutex<Option<std::sync::Arc<Deferred>>>> = std::sync::Arc::new(Mutex::new(None));
        let holder2 = deferred_holder.clone();

        let invoices = Route::builder("invoices/:id")
            .id("invoice")
            .loader(FnCallable::new(move || {
                let promise = TrackedPromise::spawn(async {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(serde_json::json!("late"))
                });
                let mut fields = IndexMap::new();
                fields.insert("detail".to_string(), DeferredField::Tracked(promise));
                let d = std::sync::Arc::new(Deferred::new(fields));
                *holder2.lock().unwrap() = Some(d.clone());
                Outcome::data(LoaderValue::Deferred(d))
            }))
            .build();
        let root = Route::builder("/").id("root").child(invoices).build();

        let r = router(vec![root], "/invoices/1");
        r.initialize().await;
        let first = deferred_holder.lock().unwrap().clone().unwrap();

        r.navigate("/invoices/2", NavigateOpts::default()).await;

        let status = first.fields.get("detail").unwrap();
        if let DeferredField::Tracked(t) = status {
            let settled = t.settled().await;
            assert!(matches!(settled, DeferredStatus::Aborted));
        } else {
            panic!("expected a tracked field");
        }
        let _ = AbortKind::Deferred;
    }

    // spec §4.6: deleting a fetcher removes its state and aborts any
    // inflight operation's signal.
    #[tokio::test]
    async fn delete_fetcher_removes_state() {
        let root = Route::builder("/x").id("x").loader(FnCallable::new(|| plain(serde_json::json!("X")))).build();
        let r = router(vec![root], "/x");
        r.fetch("K", RouteId::from("x"), "/x", NavigateOpts::default()).await;
        assert_eq!(r.get_fetcher("K").state, crate::fetcher::FetcherState::Idle);
        r.delete_fetcher("K");
        assert_eq!(r.get_fetcher("K").state, crate::fetcher::FetcherState::Idle);
        assert!(r.get_fetcher("K").data.is_none());
    }
}
