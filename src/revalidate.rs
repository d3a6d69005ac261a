//! Revalidation Planner. Spec §4.4.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};

use crate::error::RouteErrorValue;
use crate::matcher::Match;
use crate::request::{FormData, FormEncType};
use crate::route::{ActionResultSummary, RouteId, ShouldRevalidateArgs};

/// Everything about "what just happened" that a per-route override needs
/// to see, independent of the route tree itself.
pub struct RevalidationContext {
    pub current_url: String,
    pub next_url: String,
    pub form_method: Option<http::Method>,
    pub form_enc_type: Option<FormEncType>,
    pub form_data: Option<FormData>,
    pub form_action: Option<String>,
    pub action_result: Option<ActionResultSummary>,
    /// A loader/action response carried `X-Remix-Revalidate`.
    pub force_revalidate: bool,
    /// The exact same href was navigated to again (explicit refresh).
    pub same_url_refresh: bool,
}

fn url_parts(url: &str) -> (&str, &str, &str) {
    let (before_hash, hash) = match url.find('#') {
        Some(i) => (&url[..i], &url[i..]),
        None => (url, ""),
    };
    let (path, search) = match before_hash.find('?') {
        Some(i) => (&before_hash[..i], &before_hash[i..]),
        None => (before_hash, ""),
    };
    (path, search, hash)
}

fn find_prev<'a, 'm>(prev: &'a [Match<'m>], id: &RouteId) -> Option<&'a Match<'m>> {
    prev.iter().find(|m| &m.route.id == id)
}

/// Computes the default (pre-override) `shouldRevalidate` decision for one
/// route, per spec §4.4.
fn default_decision(prev: &[Match], next: &[Match], idx: usize, ctx: &RevalidationContext) -> bool {
    let m = &next[idx];

    let was_matched = find_prev(prev, &m.route.id);
    let newly_matched = was_matched.is_none();
    if newly_matched {
        return true;
    }
    let was_matched = was_matched.unwrap();

    if was_matched.params != m.params {
        return true;
    }

    let (_, prev_search, prev_hash) = url_parts(&ctx.current_url);
    let (_, next_search, next_hash) = url_parts(&ctx.next_url);

    if prev_search != next_search {
        return true;
    }

    if prev_hash != next_hash {
        // hash-only changes (route unchanged, not newly matched) skip all
        // loaders; only a newly-matched route reruns on hash change, and
        // we already returned true above for that case.
        return false;
    }

    if ctx.form_method.as_ref().map(|m| m != http::Method::GET).unwrap_or(false) {
        return true;
    }

    if ctx.force_revalidate {
        return true;
    }

    if ctx.same_url_refresh {
        return true;
    }

    false
}

/// Produces the set of route ids whose loaders must run on this
/// transition. `prev_errors` feeds the "post-error re-runs" rule.
pub async fn plan_revalidation(
    prev: &[Match<'_>],
    next: &[Match<'_>],
    ctx: &RevalidationContext,
    prev_errors: &IndexMap<RouteId, RouteErrorValue>,
) -> IndexSet<RouteId> {
    let mut out = IndexSet::new();

    for (idx, m) in next.iter().enumerate() {
        if m.route.loader.is_none() {
            continue;
        }

        if prev_errors.contains_key(&m.route.id) {
            out.insert(m.route.id.clone());
            continue;
        }

        let default = default_decision(prev, next, idx, ctx);

        let decision = if let Some(sr) = &m.route.should_revalidate {
            let args = ShouldRevalidateArgs {
                current_params: find_prev(prev, &m.route.id).map(|p| p.params.clone()).unwrap_or_default(),
                current_url: ctx.current_url.clone(),
                next_params: m.params.clone(),
                next_url: ctx.next_url.clone(),
                form_method: ctx.form_method.clone(),
                form_data: ctx.form_data.clone(),
                form_enc_type: ctx.form_enc_type,
                form_action: ctx.form_action.clone(),
                action_result: ctx.action_result.clone(),
                default_should_revalidate: default,
            };
            match sr.call(args).await {
                Some(true) if !default => true,
                Some(false) if default => false,
                _ => default,
            }
        } else {
            default
        };

        if decision {
            out.insert(m.route.id.clone());
        }
    }

    out
}

/// Fetcher participation in revalidation, spec §4.4's "Fetcher
/// participation": idle fetchers with data consult their own
/// `shouldRevalidate`; fetchers without data, or currently loading, are
/// always rerun (never opt out).
pub async fn fetcher_should_revalidate(
    route: &crate::route::Route,
    has_data: bool,
    is_idle: bool,
    args: ShouldRevalidateArgs,
) -> bool {
    if !is_idle || !has_data {
        return true;
    }
    match &route.should_revalidate {
        Some(sr) => {
            let default = args.default_should_revalidate;
            match sr.call(args).await {
                Some(true) if !default => true,
                Some(false) if default => false,
                _ => default,
            }
        }
        None => args.default_should_revalidate,
    }
}

pub fn matched_route_ids(matches: &[Match]) -> HashSet<RouteId> {
    matches.iter().map(|m| m.route.id.clone()).collect()
}
