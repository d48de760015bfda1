//! Routing table: (host, path) → route.
//!
//! The table is an immutable snapshot published through an atomic pointer.
//! Readers load the pointer once per request and never block; the single
//! writer (the syncer) rebuilds the snapshot off-line and swaps it in.
//!
//! Host matching supports exact names, `*.suffix` wildcards, and a single
//! `"*"` catch-all. Path matching is longest-prefix with slash
//! autocorrection: a route stored with `/p` matches both `/p` and `/p/x`.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A routing rule, as delivered by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Opaque identifier (UUID-shaped).
    pub id: String,
    /// Route type; only "http" routes are indexed.
    #[serde(rename = "type", default = "default_route_type")]
    pub kind: String,
    /// Exact hostname, `"*.suffix"` wildcard, or `"*"` (case-insensitive).
    pub domain: String,
    /// URL path prefix; empty is equivalent to `/`.
    #[serde(default)]
    pub path: String,
    /// Logical backend name resolved via service discovery.
    pub service: String,
    /// Route traffic only to the service leader.
    #[serde(default)]
    pub leader: bool,
    /// Enable the sticky-session cookie.
    #[serde(default)]
    pub sticky: bool,
    /// Close the upstream connection after each response.
    #[serde(default)]
    pub disable_keep_alives: bool,
    /// Fingerprint of the TLS certificate serving this route.
    #[serde(default)]
    pub certificate: Option<String>,
    /// Creation time in unix milliseconds; older wins on duplicate keys.
    #[serde(default)]
    pub created_at: u64,
}

fn default_route_type() -> String {
    "http".to_string()
}

impl Route {
    /// The (domain, path) key this route occupies in the index.
    pub fn key(&self) -> (String, String) {
        (self.domain.to_ascii_lowercase(), canonical_path(&self.path))
    }
}

/// Normalize a request host for lookup: lowercase, strip any `:port`.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let stripped = if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, e.g. "[::1]:8080"
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            // A lone colon pair would be an unbracketed IPv6 literal; only
            // strip when the tail parses as a port.
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };
    stripped.to_ascii_lowercase()
}

/// Canonicalize a stored route path: always starts with `/`.
pub fn canonical_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Prefix rule: the stored path (with a trailing `/` appended if missing)
/// must prefix the request path followed by `/`. This makes `/p` match
/// exactly `/p` as well as `/p/…`, without redirecting.
fn path_matches(stored: &str, request: &str) -> bool {
    let mut probe = String::with_capacity(request.len() + 1);
    probe.push_str(request);
    probe.push('/');
    if stored.ends_with('/') {
        probe.starts_with(stored)
    } else {
        probe.strip_prefix(stored).is_some_and(|rest| rest.starts_with('/'))
    }
}

/// Immutable index. Entry lists are sorted by descending path length so the
/// first prefix hit is the longest match.
#[derive(Default)]
struct RouterSnapshot {
    exact: HashMap<String, Vec<Arc<Route>>>,
    /// Keyed by the suffix after `*.`.
    wildcard: HashMap<String, Vec<Arc<Route>>>,
    catch_all: Vec<Arc<Route>>,
}

impl RouterSnapshot {
    fn from_routes<'a>(routes: impl Iterator<Item = &'a Arc<Route>>) -> Self {
        let mut snapshot = RouterSnapshot::default();
        for route in routes {
            if route.kind != "http" {
                continue;
            }
            let domain = route.domain.to_ascii_lowercase();
            let bucket = if domain == "*" {
                &mut snapshot.catch_all
            } else if let Some(suffix) = domain.strip_prefix("*.") {
                snapshot.wildcard.entry(suffix.to_string()).or_default()
            } else {
                snapshot.exact.entry(domain).or_default()
            };
            bucket.push(route.clone());
        }
        let order = |entries: &mut Vec<Arc<Route>>| {
            entries.sort_by(|a, b| {
                canonical_path(&b.path)
                    .len()
                    .cmp(&canonical_path(&a.path).len())
            });
        };
        snapshot.exact.values_mut().for_each(&order);
        snapshot.wildcard.values_mut().for_each(&order);
        order(&mut snapshot.catch_all);
        snapshot
    }

    fn match_paths<'a>(entries: &'a [Arc<Route>], path: &str) -> Option<&'a Arc<Route>> {
        entries
            .iter()
            .find(|route| path_matches(&canonical_path(&route.path), path))
    }
}

/// The live routing table. Mutations go through the single writer; lookups
/// are wait-free snapshot reads.
pub struct RouteTable {
    snapshot: ArcSwap<RouterSnapshot>,
    routes: Mutex<HashMap<String, Arc<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RouterSnapshot::default()),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or update a route, then publish a fresh snapshot.
    ///
    /// A route whose (domain, path) key is already claimed by a different,
    /// older route is rejected: the key must stay unique and the older
    /// registration wins.
    pub fn set(&self, route: Route) -> Result<SetOutcome, RouteConflict> {
        let mut routes = self.routes.lock();
        let outcome = Self::set_locked(&mut routes, route)?;
        self.publish(&routes);
        Ok(outcome)
    }

    fn set_locked(
        routes: &mut HashMap<String, Arc<Route>>,
        route: Route,
    ) -> Result<SetOutcome, RouteConflict> {
        let key = route.key();
        let mut evicted = None;
        if let Some(existing) = routes
            .values()
            .find(|r| r.id != route.id && r.key() == key)
        {
            if existing.created_at <= route.created_at {
                return Err(RouteConflict {
                    domain: key.0,
                    path: key.1,
                    holder: existing.id.clone(),
                });
            }
            // The incoming route is older: the newer claimant is evicted.
            let loser = existing.id.clone();
            warn!(route_id = %loser, "evicting newer route with duplicate key");
            evicted = routes.remove(&loser);
        }
        let route = Arc::new(route);
        let previous = routes.insert(route.id.clone(), route.clone());
        Ok(SetOutcome {
            route,
            previous,
            evicted,
        })
    }

    /// Remove a route by id, publishing a fresh snapshot on change.
    pub fn remove(&self, id: &str) -> Option<Arc<Route>> {
        let mut routes = self.routes.lock();
        let removed = routes.remove(id);
        if removed.is_some() {
            self.publish(&routes);
        }
        removed
    }

    /// Apply a resync diff as one logical step: all removals and sets land
    /// in a single snapshot swap. Lookups racing the batch see either the
    /// full old state or the full new state.
    pub fn apply_batch(&self, sets: Vec<Route>, removals: &[String]) -> BatchOutcome {
        let mut routes = self.routes.lock();
        let mut outcome = BatchOutcome::default();
        for id in removals {
            if let Some(removed) = routes.remove(id) {
                outcome.removed.push(removed);
            }
        }
        for route in sets {
            match Self::set_locked(&mut routes, route) {
                Ok(set) => outcome.applied.push(set),
                Err(conflict) => outcome.conflicts.push(conflict),
            }
        }
        self.publish(&routes);
        outcome
    }

    pub fn get(&self, id: &str) -> Option<Arc<Route>> {
        self.routes.lock().get(id).cloned()
    }

    /// All current routes (used by the syncer's resync diff).
    pub fn all(&self) -> Vec<Arc<Route>> {
        self.routes.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }

    fn publish(&self, routes: &HashMap<String, Arc<Route>>) {
        self.snapshot
            .store(Arc::new(RouterSnapshot::from_routes(routes.values())));
    }

    /// Select the route for a request.
    ///
    /// Exact host first, then wildcard suffixes from most to least
    /// specific, then the catch-all. Within a host bucket the longest
    /// matching path prefix wins.
    pub fn lookup(&self, host: &str, path: &str) -> Option<Arc<Route>> {
        let host = normalize_host(host);
        let snapshot = self.snapshot.load();

        if let Some(entries) = snapshot.exact.get(&host) {
            if let Some(route) = RouterSnapshot::match_paths(entries, path) {
                return Some(route.clone());
            }
        }

        // "a.b.c" consults "*.b.c" before "*.c": the longest suffix is the
        // most specific wildcard.
        let mut rest = host.as_str();
        while let Some((_, suffix)) = rest.split_once('.') {
            if let Some(entries) = snapshot.wildcard.get(suffix) {
                if let Some(route) = RouterSnapshot::match_paths(entries, path) {
                    return Some(route.clone());
                }
            }
            rest = suffix;
        }

        RouterSnapshot::match_paths(&snapshot.catch_all, path).cloned()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned when a `set` would violate (domain, path) uniqueness.
#[derive(Debug, thiserror::Error)]
#[error("route key ({domain}, {path}) already held by route {holder}")]
pub struct RouteConflict {
    pub domain: String,
    pub path: String,
    pub holder: String,
}

/// What a successful `set` installed and displaced.
pub struct SetOutcome {
    /// The route as installed.
    pub route: Arc<Route>,
    /// Prior version of the same route id, if any.
    pub previous: Option<Arc<Route>>,
    /// A newer duplicate-key claimant evicted in favor of an older route.
    pub evicted: Option<Arc<Route>>,
}

/// Everything displaced or rejected by a batch application.
#[derive(Default)]
pub struct BatchOutcome {
    pub applied: Vec<SetOutcome>,
    pub removed: Vec<Arc<Route>>,
    pub conflicts: Vec<RouteConflict>,
}
