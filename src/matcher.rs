//! Pure URL matching against a route tree. Spec §4.1.
//!
//! The scoring numbers below are an implementation detail; spec §9's open
//! question only constrains the *relation* (static > dynamic > splat,
//! earlier declaration wins ties, an index route wins over its
//! parent-as-leaf when the pathname matches exactly). Branches are
//! enumerated in declaration order and a stable sort preserves that order
//! on ties.

use indexmap::IndexMap;
use percent_encoding::percent_decode_str;

use crate::route::{Route, RouteTree};

const WEIGHT_STATIC: i64 = 3;
const WEIGHT_DYNAMIC: i64 = 2;
const WEIGHT_SPLAT: i64 = 1;
const INDEX_BONUS: i64 = 1;

#[derive(Debug, Clone)]
enum SegKind {
    Static(String),
    Dynamic(String),
    Optional(String),
    Splat,
}

#[derive(Debug, Clone)]
struct Segment(SegKind);

fn parse_path(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|raw| {
            if raw == "*" {
                Segment(SegKind::Splat)
            } else if let Some(name) = raw.strip_prefix(':') {
                if let Some(name) = name.strip_suffix('?') {
                    Segment(SegKind::Optional(name.to_string()))
                } else {
                    Segment(SegKind::Dynamic(name.to_string()))
                }
            } else {
                Segment(SegKind::Static(raw.to_string()))
            }
        })
        .collect()
}

/// One route bound to concrete params/pathname for a single URL. Spec §3.
#[derive(Debug, Clone)]
pub struct Match<'a> {
    pub route: &'a Route,
    pub params: IndexMap<String, String>,
    pub pathname: String,
    pub pathname_base: String,
}

struct Branch<'a> {
    routes: Vec<&'a Route>,
    segments: Vec<Segment>,
    /// cumulative segment count contributed by each route in `routes`, so
    /// per-route pathname/pathnameBase can be reconstructed after a match.
    owned_segment_counts: Vec<usize>,
    order: usize,
}

fn flatten<'a>(
    routes: &'a [Route],
    parent_segments: &[Segment],
    parent_chain: &[&'a Route],
    order: &mut usize,
    out: &mut Vec<Branch<'a>>,
) {
    for route in routes {
        let own_segments = route.path.as_deref().map(parse_path).unwrap_or_default();
        let mut segments = parent_segments.to_vec();
        segments.extend(own_segments.iter().cloned());

        let mut chain = parent_chain.to_vec();
        chain.push(route);

        if route.children.is_empty() {
            out.push(Branch {
                routes: chain.clone(),
                segments: segments.clone(),
                owned_segment_counts: owned_counts(&chain),
                order: *order,
            });
            *order += 1;
        } else {
            flatten(&route.children, &segments, &chain, order, out);
            // A non-index route with children can also itself be a terminal
            // leaf candidate only when it is the index-less parent being
            // addressed exactly; that case is already covered by an index
            // child (if any) producing a zero-extra-segment branch. A
            // layout route with children and no index child simply has no
            // direct-terminal branch, matching spec's "index routes have no
            // children" / parent-as-leaf rule.
        }
    }
}

fn owned_counts(chain: &[&Route]) -> Vec<usize> {
    chain
        .iter()
        .map(|r| r.path.as_deref().map(|p| parse_path(p).len()).unwrap_or(0))
        .collect()
}

fn score_and_match(segments: &[Segment], path_segs: &[&str]) -> Option<(i64, IndexMap<String, String>)> {
    let mut params = IndexMap::new();
    let mut score = 0i64;
    let mut pi = 0usize; // pattern index
    let mut xi = 0usize; // path index

    while pi < segments.len() {
        match &segments[pi].0 {
            SegKind::Static(s) => {
                if xi < path_segs.len() && path_segs[xi] == s {
                    xi += 1;
                    score += WEIGHT_STATIC;
                } else {
                    return None;
                }
            }
            SegKind::Dynamic(name) => {
                if xi < path_segs.len() {
                    let decoded = percent_decode_str(path_segs[xi]).decode_utf8_lossy().into_owned();
                    params.insert(name.clone(), decoded);
                    xi += 1;
                    score += WEIGHT_DYNAMIC;
                } else {
                    return None;
                }
            }
            SegKind::Optional(name) => {
                if xi < path_segs.len() {
                    let decoded = percent_decode_str(path_segs[xi]).decode_utf8_lossy().into_owned();
                    params.insert(name.clone(), decoded);
                    xi += 1;
                    score += WEIGHT_DYNAMIC;
                }
                // absent: contributes nothing, consumes nothing.
            }
            SegKind::Splat => {
                let rest = path_segs[xi..].join("/");
                let decoded = percent_decode_str(&rest).decode_utf8_lossy().into_owned();
                params.insert("*".to_string(), decoded);
                xi = path_segs.len();
                score += WEIGHT_SPLAT;
            }
        }
        pi += 1;
    }

    if xi == path_segs.len() {
        Some((score, params))
    } else {
        None
    }
}

/// Strips `basename` from `pathname`. Returns `None` if `pathname` is not
/// under `basename`.
pub fn strip_basename<'a>(pathname: &'a str, basename: &str) -> Option<&'a str> {
    if basename.is_empty() || basename == "/" {
        return Some(pathname);
    }
    let trimmed_base = basename.trim_end_matches('/');
    let stripped = pathname.strip_prefix(trimmed_base)?;
    if stripped.is_empty() {
        Some("/")
    } else if stripped.starts_with('/') {
        Some(stripped)
    } else {
        None
    }
}

/// Matches `pathname` (already basename-stripped) against `tree`. Returns
/// the winning root-to-leaf [`Match`] list, or `None` on no match (spec
/// §4.1's "Failure" case — callers synthesize a 404).
pub fn match_routes<'a>(tree: &'a RouteTree, pathname: &str) -> Option<Vec<Match<'a>>> {
    let pathname = pathname.trim_end_matches('/');
    let path_segs: Vec<&str> = pathname.split('/').filter(|s| !s.is_empty()).collect();

    let mut order = 0usize;
    let mut branches = Vec::new();
    flatten(&tree.roots, &[], &[], &mut order, &mut branches);

    let mut best: Option<(i64, usize, &Branch, IndexMap<String, String>)> = None;
    for branch in &branches {
        if let Some((mut score, params)) = score_and_match(&branch.segments, &path_segs) {
            if branch.routes.last().map(|r| r.index).unwrap_or(false) {
                score += INDEX_BONUS;
            }
            let better = match &best {
                None => true,
                Some((best_score, best_order, _, _)) => {
                    score > *best_score || (score == *best_score && branch.order < *best_order)
                }
            };
            if better {
                best = Some((score, branch.order, branch, params));
            }
        }
    }

    let (_, _, branch, params) = best?;
    Some(build_matches(branch, &params, &path_segs))
}

fn build_matches<'a>(branch: &Branch<'a>, params: &IndexMap<String, String>, path_segs: &[&str]) -> Vec<Match<'a>> {
    let mut consumed = 0usize;
    let mut out = Vec::with_capacity(branch.routes.len());
    for (i, route) in branch.routes.iter().enumerate() {
        let own = branch.owned_segment_counts[i];
        let is_splat_owner = route
            .path
            .as_deref()
            .map(parse_path)
            .map(|segs| matches!(segs.last().map(|s| &s.0), Some(SegKind::Splat)))
            .unwrap_or(false);
        consumed += own;
        let consumed_for_this = consumed.min(path_segs.len());
        let pathname = to_pathname(&path_segs[..consumed_for_this]);
        let pathname_base = if is_splat_owner {
            let before_this_route = own_prefix_len(branch, i).min(path_segs.len());
            to_pathname(&path_segs[..before_this_route])
        } else {
            pathname.clone()
        };
        out.push(Match {
            route,
            params: params.clone(),
            pathname,
            pathname_base,
        });
    }
    out
}

fn own_prefix_len(branch: &Branch, idx: usize) -> usize {
    branch.owned_segment_counts[..idx].iter().sum::<usize>()
}

fn to_pathname(segs: &[&str]) -> String {
    if segs.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segs.join("/"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::route::{Route, RouteTree};

    fn tree(routes: Vec<Route>) -> RouteTree {
        RouteTree::new(routes).unwrap()
    }

    #[test]
    fn static_beats_dynamic() {
        let t = tree(vec![
            Route::builder("/users/:id").id("dyn").build(),
            Route::builder("/users/me").id("static").build(),
        ]);
        let m = match_routes(&t, "/users/me").unwrap();
        assert_eq!(m.last().unwrap().route.id.to_string(), "static");
    }

    #[test]
    fn dynamic_beats_splat() {
        let t = tree(vec![
            Route::builder("/files/*").id("splat").build(),
            Route::builder("/files/:name").id("dyn").build(),
        ]);
        let m = match_routes(&t, "/files/readme").unwrap();
        assert_eq!(m.last().unwrap().route.id.to_string(), "dyn");
    }

    #[test]
    fn splat_binds_remainder() {
        let t = tree(vec![Route::builder("/files/*").id("splat").build()]);
        let m = match_routes(&t, "/files/a/b/c").unwrap();
        assert_eq!(m.last().unwrap().params.get("*").unwrap(), "a/b/c");
    }

    #[test]
    fn params_are_url_decoded() {
        let t = tree(vec![Route::builder("/u/:name").id("u").build()]);
        let m = match_routes(&t, "/u/a%20b").unwrap();
        assert_eq!(m.last().unwrap().params.get("name").unwrap(), "a b");
    }

    #[test]
    fn index_wins_over_parent_exact_match() {
        let t = tree(vec![Route::builder("/dashboard")
            .id("layout")
            .child(Route::index_builder().id("index").build())
            .build()]);
        let m = match_routes(&t, "/dashboard").unwrap();
        assert_eq!(m.last().unwrap().route.id.to_string(), "index");
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn no_match_returns_none() {
        let t = tree(vec![Route::builder("/a").id("a").build()]);
        assert!(match_routes(&t, "/b").is_none());
    }

    #[test]
    fn trailing_slash_tolerated() {
        let t = tree(vec![Route::builder("/a").id("a").build()]);
        let m = match_routes(&t, "/a/").unwrap();
        assert_eq!(m.last().unwrap().route.id.to_string(), "a");
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let t = tree(vec![
            Route::builder("/:a").id("first").build(),
            Route::builder("/:b").id("second").build(),
        ]);
        let m = match_routes(&t, "/x").unwrap();
        assert_eq!(m.last().unwrap().route.id.to_string(), "first");
    }

    #[test]
    fn basename_stripped() {
        let stripped = strip_basename("/app/users", "/app").unwrap();
        assert_eq!(stripped, "/users");
        assert!(strip_basename("/other/users", "/app").is_none());
    }
}
