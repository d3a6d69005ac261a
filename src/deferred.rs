//! Deferred Tracker. Spec §4.3.
//!
//! A loader may return a value that mixes synchronous fields with
//! in-flight promises. Each tracked promise is driven on its own spawned
//! task so cancellation (dropping the task's future) is immediate and
//! independent of whoever is currently awaiting it.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use indexmap::IndexMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::route::RouteId;

#[derive(Debug, Clone)]
pub enum DeferredStatus {
    Pending,
    Resolved(serde_json::Value),
    Rejected(BoxError),
    Aborted,
}

impl DeferredStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, DeferredStatus::Pending)
    }
}

/// A single tracked promise field. Spawned eagerly; cancelling drops the
/// driving future so a late resolution genuinely cannot happen, matching
/// spec §4.3's "subsequent resolutions of cancelled promises are
/// discarded."
#[derive(Clone)]
pub struct TrackedPromise {
    status: Arc<Mutex<DeferredStatus>>,
    notify: Arc<Notify>,
    token: CancellationToken,
}

impl TrackedPromise {
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
    {
        let status = Arc::new(Mutex::new(DeferredStatus::Pending));
        let notify = Arc::new(Notify::new());
        let token = CancellationToken::new();

        let status2 = status.clone();
        let notify2 = notify.clone();
        let token2 = token.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token2.cancelled() => DeferredStatus::Aborted,
                res = fut => match res {
                    Ok(v) => DeferredStatus::Resolved(v),
                    Err(e) => DeferredStatus::Rejected(e),
                },
            };
            *status2.lock().unwrap() = outcome;
            notify2.notify_waiters();
        });

        TrackedPromise { status, notify, token }
    }

    pub fn status(&self) -> DeferredStatus {
        self.status.lock().unwrap().clone()
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Resolves once this promise settles (resolved, rejected, or
    /// aborted).
    pub async fn settled(&self) -> DeferredStatus {
        loop {
            let s = self.status();
            if s.is_settled() {
                return s;
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Clone)]
pub enum DeferredField {
    Value(serde_json::Value),
    Tracked(TrackedPromise),
}

/// The streamed value returned by a loader: some fields resolved up front,
/// some still pending. Spec §4.3.
#[derive(Clone)]
pub struct Deferred {
    pub fields: IndexMap<String, DeferredField>,
}

impl Deferred {
    pub fn new(fields: IndexMap<String, DeferredField>) -> Self {
        Deferred { fields }
    }

    pub fn abort_all(&self) {
        for field in self.fields.values() {
            if let DeferredField::Tracked(t) = field {
                t.abort();
            }
        }
    }

    /// Await-all: used for SSR and revalidation (spec §4.3).
    pub async fn await_all(&self) {
        let pending: Vec<_> = self
            .fields
            .values()
            .filter_map(|f| match f {
                DeferredField::Tracked(t) => Some(t.settled()),
                DeferredField::Value(_) => None,
            })
            .collect();
        join_all(pending).await;
    }

    /// The synchronous portion, available immediately for a partial
    /// commit (client navigation). Tracked fields not yet settled are
    /// simply absent from the map; the UI observes them via
    /// [`Deferred::fields`] directly.
    pub fn sync_snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.fields {
            match v {
                DeferredField::Value(value) => {
                    map.insert(k.clone(), value.clone());
                }
                DeferredField::Tracked(t) => {
                    if let DeferredStatus::Resolved(value) = t.status() {
                        map.insert(k.clone(), value);
                    }
                }
            }
        }
        map
    }

    pub fn is_fully_settled(&self) -> bool {
        self.fields.values().all(|f| match f {
            DeferredField::Value(_) => true,
            DeferredField::Tracked(t) => t.status().is_settled(),
        })
    }
}

/// What a loader/action ultimately produced: a plain value, or a deferred
/// with some fields still streaming.
#[derive(Clone)]
pub enum LoaderValue {
    Plain(serde_json::Value),
    Deferred(Arc<Deferred>),
}

impl LoaderValue {
    pub async fn await_all(&self) {
        if let LoaderValue::Deferred(d) = self {
            d.await_all().await;
        }
    }

    pub fn abort(&self) {
        if let LoaderValue::Deferred(d) = self {
            d.abort_all();
        }
    }

    /// Whether any tracked field settled as `Aborted` rather than
    /// resolving/rejecting normally — this value is stale and a holder
    /// (e.g. a fetcher, spec §4.6) must force revalidation rather than
    /// consult `shouldRevalidate` against it.
    pub fn was_invalidated(&self) -> bool {
        match self {
            LoaderValue::Deferred(d) => d
                .fields
                .values()
                .any(|f| matches!(f, DeferredField::Tracked(t) if matches!(t.status(), DeferredStatus::Aborted))),
            LoaderValue::Plain(_) => false,
        }
    }
}

/// Tracks which routes currently own a live [`Deferred`], so the
/// orchestrator can bulk-abort per the cancellation policies in spec §4.3
/// and §5: route no longer matched, action submission starts, or an
/// explicit `revalidate()`.
#[derive(Default)]
pub struct DeferredRegistry {
    by_route: Mutex<IndexMap<RouteId, Arc<Deferred>>>,
}

impl DeferredRegistry {
    pub fn new() -> Self {
        DeferredRegistry { by_route: Mutex::new(IndexMap::new()) }
    }

    pub fn set(&self, route_id: RouteId, deferred: Arc<Deferred>) {
        if let Some(prev) = self.by_route.lock().unwrap().insert(route_id, deferred) {
            prev.abort_all();
        }
    }

    pub fn abort_and_remove(&self, route_id: &RouteId) {
        if let Some(d) = self.by_route.lock().unwrap().shift_remove(route_id) {
            d.abort_all();
        }
    }

    /// Aborts and drops deferreds for routes no longer present in
    /// `still_matched`. Reused-route deferreds survive (spec §5).
    pub fn retain_matched(&self, still_matched: &std::collections::HashSet<RouteId>) {
        let mut guard = self.by_route.lock().unwrap();
        let stale: Vec<RouteId> = guard.keys().filter(|id| !still_matched.contains(*id)).cloned().collect();
        for id in stale {
            if let Some(d) = guard.shift_remove(&id) {
                log::trace!("aborting deferred for unmatched route {}", id);
                d.abort_all();
            }
        }
    }

    /// Aborts every currently tracked deferred (action submission,
    /// explicit `revalidate()`).
    pub fn abort_all(&self) {
        let mut guard = self.by_route.lock().unwrap();
        for (id, d) in guard.drain(..) {
            log::trace!("aborting deferred for route {}", id);
            d.abort_all();
        }
    }
}
