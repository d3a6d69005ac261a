//! Fetcher Registry. Spec §4.6.
//!
//! Bookkeeping and ordering guarantees for keyed, UI-independent data
//! operations. The actual loader/action invocation is shared with
//! navigation (request building, redirect chasing, revalidation) and lives
//! in [`crate::navigation`]; this module owns fetcher *state* and the
//! per-key generation counter that gives the "newer submission wins"
//! guarantee from spec §4.6 and §5.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::deferred::LoaderValue;
use crate::error::RouteErrorValue;
use crate::request::FormData;
use crate::route::RouteId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetcherState {
    Idle,
    Loading,
    Submitting,
}

/// Keyed independent operation. Spec §3 ("Fetcher").
#[derive(Clone, serde::Serialize)]
pub struct Fetcher {
    pub state: FetcherState,
    #[serde(skip)]
    pub data: Option<LoaderValue>,
    pub form_method: Option<String>,
    #[serde(skip)]
    pub form_data: Option<FormData>,
    /// Whether the last commit to `data` included a tracked deferred field
    /// that settled `Aborted` rather than resolving — this fetcher's prior
    /// data is stale and must force revalidation regardless of
    /// `shouldRevalidate` (spec §4.6).
    #[serde(skip)]
    pub invalidated: bool,
}

impl Fetcher {
    pub fn idle() -> Self {
        Fetcher { state: FetcherState::Idle, data: None, form_method: None, form_data: None, invalidated: false }
    }

    /// Shared, referentially-stable sentinel returned for unknown keys, so
    /// repeated lookups of a never-used key don't manufacture distinct
    /// values (spec `SPEC_FULL.md` §10.6).
    pub fn idle_sentinel() -> Arc<Fetcher> {
        static SENTINEL: OnceLock<Arc<Fetcher>> = OnceLock::new();
        SENTINEL.get_or_init(|| Arc::new(Fetcher::idle())).clone()
    }
}

struct Entry {
    fetcher: Fetcher,
    route_id: RouteId,
    token: CancellationToken,
    generation: u64,
}

/// What a completed fetcher operation produced, for `commit_if_current`.
pub enum FetcherOutcome {
    Data(LoaderValue),
    Error(RouteErrorValue),
}

#[derive(Default)]
pub struct FetcherRegistry {
    entries: Mutex<IndexMap<String, Entry>>,
    generation_counter: AtomicU64,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        FetcherRegistry { entries: Mutex::new(IndexMap::new()), generation_counter: AtomicU64::new(0) }
    }

    pub fn get(&self, key: &str) -> Arc<Fetcher> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .map(|e| Arc::new(e.fetcher.clone()))
            .unwrap_or_else(Fetcher::idle_sentinel)
    }

    pub fn snapshot(&self) -> IndexMap<String, Fetcher> {
        self.entries.lock().unwrap().iter().map(|(k, e)| (k.clone(), e.fetcher.clone())).collect()
    }

    /// Idle fetchers that previously loaded data: the ones that must be
    /// consulted for revalidation participation (spec §4.4).
    pub fn idle_with_data(&self) -> Vec<(String, RouteId)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.fetcher.state == FetcherState::Idle && e.fetcher.data.is_some())
            .map(|(k, e)| (k.clone(), e.route_id.clone()))
            .collect()
    }

    /// Every currently-registered fetcher key with its owning route,
    /// regardless of state — used by "fetchers without data, or currently
    /// loading, are always re-run."
    pub fn all_keys(&self) -> Vec<(String, RouteId)> {
        self.entries.lock().unwrap().iter().map(|(k, e)| (k.clone(), e.route_id.clone())).collect()
    }

    /// Starts a new operation for `key`, aborting any inflight one for the
    /// same key (spec: "a newer submission aborts any older inflight
    /// operation for that key"). Returns the generation stamp the caller
    /// must present to [`FetcherRegistry::commit_if_current`] and the
    /// fresh cancellation token.
    pub fn begin(
        &self,
        key: &str,
        route_id: RouteId,
        submitting: Option<(http::Method, FormData)>,
    ) -> (u64, CancellationToken) {
        let mut guard = self.entries.lock().unwrap();
        if let Some(prev) = guard.get(key) {
            prev.token.cancel();
        }
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let state = if submitting.is_some() { FetcherState::Submitting } else { FetcherState::Loading };
        let (form_method, form_data) = match submitting {
            Some((m, d)) => (Some(m.to_string()), Some(d)),
            None => (None, None),
        };
        let prior_data = guard.get(key).and_then(|e| e.fetcher.data.clone());
        let prior_invalidated = guard.get(key).map(|e| e.fetcher.invalidated).unwrap_or(false);
        guard.insert(
            key.to_string(),
            Entry {
                fetcher: Fetcher { state, data: prior_data, form_method, form_data, invalidated: prior_invalidated },
                route_id,
                token: token.clone(),
                generation,
            },
        );
        (generation, token)
    }

    /// Applies a settled result only if `generation` is still the latest
    /// for `key` (an older, since-superseded operation is silently
    /// dropped). Returns whether the commit took effect.
    pub fn commit_if_current(&self, key: &str, generation: u64, outcome: FetcherOutcome) -> bool {
        let mut guard = self.entries.lock().unwrap();
        match guard.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                match outcome {
                    FetcherOutcome::Data(data) => {
                        let invalidated = data.was_invalidated();
                        entry.fetcher = Fetcher {
                            state: FetcherState::Idle,
                            data: Some(data),
                            form_method: None,
                            form_data: None,
                            invalidated,
                        };
                    }
                    FetcherOutcome::Error(_) => {
                        // Errors remove the fetcher entirely and do not
                        // retain prior data (spec §4.6).
                        guard.shift_remove(key);
                    }
                }
                true
            }
            _ => false,
        }
    }

    pub fn delete(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().shift_remove(key) {
            entry.token.cancel();
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// Aborts every inflight operation and clears the registry. Called
    /// from `Engine::dispose()` (spec §9: internal maps "must be released
    /// on dispose()").
    pub fn dispose(&self) {
        let mut guard = self.entries.lock().unwrap();
        for (_, entry) in guard.drain(..) {
            entry.token.cancel();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_key_returns_idle_sentinel() {
        let reg = FetcherRegistry::new();
        let a = reg.get("missing");
        let b = reg.get("missing");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state, FetcherState::Idle);
    }

    #[test]
    fn newer_submission_cancels_older_token() {
        let reg = FetcherRegistry::new();
        let (_, token1) = reg.begin("k", RouteId::from("r"), None);
        let (_, _token2) = reg.begin("k", RouteId::from("r"), None);
        assert!(token1.is_cancelled());
    }

    #[test]
    fn stale_generation_commit_is_dropped() {
        let reg = FetcherRegistry::new();
        let (gen1, _t1) = reg.begin("k", RouteId::from("r"), None);
        let (gen2, _t2) = reg.begin("k", RouteId::from("r"), None);
        let applied_old = reg.commit_if_current("k", gen1, FetcherOutcome::Data(LoaderValue::Plain(serde_json::json!(1))));
        assert!(!applied_old);
        let applied_new = reg.commit_if_current("k", gen2, FetcherOutcome::Data(LoaderValue::Plain(serde_json::json!(2))));
        assert!(applied_new);
    }

    #[test]
    fn delete_removes_and_cancels() {
        let reg = FetcherRegistry::new();
        let (_, token) = reg.begin("k", RouteId::from("r"), None);
        reg.delete("k");
        assert!(token.is_cancelled());
        assert!(!reg.contains("k"));
    }

    #[tokio::test]
    async fn commit_with_aborted_deferred_field_marks_invalidated() {
        use crate::deferred::{Deferred, DeferredField, TrackedPromise};

        let reg = FetcherRegistry::new();
        let (gen, _t) = reg.begin("k", RouteId::from("r"), None);

        let p = TrackedPromise::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(serde_json::json!("late"))
        });
        p.abort();
        p.settled().await;
        let mut fields = IndexMap::new();
        fields.insert("a".to_string(), DeferredField::Tracked(p));
        let data = LoaderValue::Deferred(Arc::new(Deferred::new(fields)));

        assert!(reg.commit_if_current("k", gen, FetcherOutcome::Data(data)));
        assert!(reg.get("k").invalidated);
    }
}
