//! The observable snapshot and the subscriber mechanism UI layers use to
//! watch it. Spec §3 ("RouterState") and §5's "subscribers are notified
//! synchronously after each commit."

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::RouteErrorValue;
use crate::fetcher::Fetcher;
use crate::location::{HistoryAction, Location};
use crate::matcher::Match;
use crate::navigation::Navigation;
use crate::route::RouteId;

/// A serializable description of a single match, detached from the route
/// tree's borrow so it can be cloned into a snapshot. Spec §3 ("Match").
#[derive(Debug, Clone, Serialize)]
pub struct MatchSnapshot {
    pub route_id: RouteId,
    pub params: IndexMap<String, String>,
    pub pathname: String,
    pub pathname_base: String,
}

impl<'a> From<&Match<'a>> for MatchSnapshot {
    fn from(m: &Match<'a>) -> Self {
        MatchSnapshot {
            route_id: m.route.id.clone(),
            params: m.params.clone(),
            pathname: m.pathname.clone(),
            pathname_base: m.pathname_base.clone(),
        }
    }
}

pub fn snapshot_matches(matches: &[Match<'_>]) -> Vec<MatchSnapshot> {
    matches.iter().map(MatchSnapshot::from).collect()
}

/// The single observable snapshot. Spec §3.
#[derive(Debug, Clone, Serialize)]
pub struct RouterState {
    pub history_action: HistoryAction,
    pub location: Location,
    pub matches: Vec<MatchSnapshot>,
    pub initialized: bool,
    pub navigation: Navigation,
    pub revalidation: RevalidationState,
    pub loader_data: IndexMap<RouteId, serde_json::Value>,
    pub action_data: Option<IndexMap<RouteId, serde_json::Value>>,
    pub errors: Option<IndexMap<RouteId, RouteErrorValue>>,
    pub fetchers: IndexMap<String, Fetcher>,
    pub prevent_scroll_reset: bool,
    pub restore_scroll_position: RestoreScrollPosition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RevalidationState {
    Idle,
    Loading,
}

/// `number | null | false` in the source model: `Known(y)` restores to a
/// captured position, `None` means "no capture for this entry", `Disabled`
/// means scroll restoration is not in effect for this transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RestoreScrollPosition {
    Known(f64),
    None,
    Disabled,
}

impl RouterState {
    pub fn initial(location: Location, matches: Vec<MatchSnapshot>) -> Self {
        RouterState {
            history_action: HistoryAction::Pop,
            location,
            matches,
            initialized: false,
            navigation: Navigation::Idle,
            revalidation: RevalidationState::Idle,
            loader_data: IndexMap::new(),
            action_data: None,
            errors: None,
            fetchers: IndexMap::new(),
            prevent_scroll_reset: false,
            restore_scroll_position: RestoreScrollPosition::None,
        }
    }
}

/// The SSR hydration tag format from spec §6, keyed by route id string.
/// `RouteErrorValue`'s own `Serialize` impl produces the per-entry
/// `{"__type": ..., ...}` shape.
pub fn serialize_errors(errors: &IndexMap<RouteId, RouteErrorValue>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = errors
        .iter()
        .map(|(id, err)| (id.to_string(), serde_json::to_value(err).unwrap_or(serde_json::Value::Null)))
        .collect();
    serde_json::Value::Object(map)
}

pub type Subscriber = Box<dyn Fn(&RouterState) + Send + Sync>;

/// Synchronous pub/sub over state commits. A commit produces a new
/// `Arc<RouterState>`; subscribers compare references, not contents,
/// matching the "mutable snapshot distribution" design note in spec §9.
#[derive(Default)]
pub struct Subscribers {
    inner: std::sync::Mutex<Vec<(u64, Subscriber)>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl Subscribers {
    pub fn new() -> Self {
        Subscribers { inner: std::sync::Mutex::new(Vec::new()), next_id: std::sync::atomic::AtomicU64::new(0) }
    }

    pub fn subscribe(&self, f: Subscriber) -> u64 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.lock().unwrap().push((id, f));
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().unwrap().retain(|(i, _)| *i != id);
    }

    pub fn notify(&self, state: &RouterState) {
        for (_, f) in self.inner.lock().unwrap().iter() {
            f(state);
        }
    }
}
