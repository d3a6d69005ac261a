//! Integration coverage for cross-module scenarios that don't belong to
//! any single unit under `src/`, driven against the public API the way a
//! downstream consumer would use it. Spec `SPEC_FULL.md` §10.5.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use data_router::testing::MemoryHistory;
use data_router::{
    deferred::LoaderValue, route::Outcome, Action, CreateOptions, FormData, FormEncType, Loader, NavigateOpts, Route, RouteId, Router,
    Submission,
};

struct CountingLoader {
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl Loader for CountingLoader {
    async fn call(&self, _req: data_router::request::RouterRequest) -> Outcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Outcome::data(LoaderValue::Plain(serde_json::json!(format!("ROOT-{n}"))))
    }
}

/// An action that signals `started` once invoked, then blocks on `proceed`
/// until the test unblocks it — standing in for a submission still sitting
/// in its action phase when a later navigation interrupts it.
struct BlockingAction {
    started: Arc<tokio::sync::Notify>,
    proceed: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl Action for BlockingAction {
    async fn call(&self, _req: data_router::request::RouterRequest) -> Outcome {
        self.started.notify_one();
        self.proceed.notified().await;
        Outcome::data(LoaderValue::Plain(serde_json::json!("submitted")))
    }
}

fn post() -> Submission {
    Submission { method: http::Method::POST, enc_type: FormEncType::UrlEncoded, form_data: FormData::new() }
}

// Spec §8 scenario 5: POST /foo is interrupted mid-action-phase by GET
// /bar. The interrupting navigation must still land on /bar, and every
// route it shares with the interrupted navigation's prior location must
// rerun its loader even though that route's own params/search/hash never
// changed.
#[tokio::test]
async fn interrupted_submission_forces_full_revalidation() {
    let root_calls = Arc::new(AtomicU64::new(0));
    let started = Arc::new(tokio::sync::Notify::new());
    let proceed = Arc::new(tokio::sync::Notify::new());

    let root = Route::builder("/")
        .id("root")
        .error_boundary()
        .loader(CountingLoader { calls: root_calls.clone() })
        .child(Route::builder("foo").id("foo").action(BlockingAction { started: started.clone(), proceed: proceed.clone() }).build())
        .child(Route::builder("bar").id("bar").build())
        .build();

    let router = Router::create(CreateOptions {
        routes: vec![root],
        history: MemoryHistory::new("/foo"),
        basename: None,
        hydration_data: None,
    })
    .unwrap();

    router.initialize().await;
    assert_eq!(root_calls.load(Ordering::SeqCst), 1, "initial load runs the shared ancestor's loader once");

    let interrupted = router.clone();
    let foo_nav = tokio::spawn(async move {
        let mut opts = NavigateOpts::default();
        opts.submission = Some(post());
        interrupted.navigate("/foo", opts).await;
    });

    started.notified().await;

    router.navigate("/bar", NavigateOpts::default()).await;

    proceed.notify_one();
    foo_nav.await.unwrap();

    let state = router.state();
    assert_eq!(state.location.pathname, "/bar");
    assert_eq!(
        root_calls.load(Ordering::SeqCst),
        2,
        "the shared ancestor's loader must rerun on the interrupting navigation even though its params/search/hash are unchanged"
    );
    assert_eq!(state.loader_data.get(&RouteId::from("root")), Some(&serde_json::json!("ROOT-2")));
}
