//! Backend selection.
//!
//! Policy order: leader pin, valid sticky assignment, then least in-flight
//! with randomized tie-breaking. Dial failures exclude a backend for the
//! current request only; the proxy retries with the next pick up to the
//! candidate-set size.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::backend_set::{Backend, BackendsSnapshot};
use crate::route_table::Route;

/// Select the backend for one attempt, or `None` when the route is
/// unavailable (empty set, missing leader, or everything excluded).
pub fn pick(
    route: &Route,
    snapshot: &BackendsSnapshot,
    sticky_id: Option<&str>,
    excluded: &[String],
) -> Option<Arc<Backend>> {
    if route.leader {
        let leader_id = snapshot.leader_id.as_deref()?;
        if excluded.iter().any(|id| id == leader_id) {
            return None;
        }
        return snapshot.by_id(leader_id).cloned();
    }

    if let Some(id) = sticky_id {
        if !excluded.iter().any(|e| e == id) {
            if let Some(backend) = snapshot.by_id(id) {
                return Some(backend.clone());
            }
        }
    }

    let mut candidates: Vec<&Arc<Backend>> = snapshot
        .backends
        .iter()
        .filter(|b| !excluded.contains(&b.id))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates
        .into_iter()
        .min_by_key(|b| b.in_flight())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend_set::backend_id;
    use std::collections::HashSet;
    use std::net::SocketAddr;

    fn snapshot(ports: &[u16]) -> BackendsSnapshot {
        let backends = ports
            .iter()
            .map(|port| {
                let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
                Arc::new(Backend::new("svc", addr))
            })
            .collect();
        BackendsSnapshot {
            backends,
            leader_id: None,
        }
    }

    fn route(leader: bool, sticky: bool) -> Route {
        Route {
            id: "r".to_string(),
            kind: "http".to_string(),
            domain: "example.com".to_string(),
            path: String::new(),
            service: "svc".to_string(),
            leader,
            sticky,
            disable_keep_alives: false,
            certificate: None,
            created_at: 0,
        }
    }

    #[test]
    fn empty_set_is_unavailable() {
        let snap = snapshot(&[]);
        assert!(pick(&route(false, false), &snap, None, &[]).is_none());
    }

    #[test]
    fn leader_route_requires_live_leader() {
        let mut snap = snapshot(&[8001, 8002]);
        let r = route(true, false);

        assert!(pick(&r, &snap, None, &[]).is_none(), "no leader elected");

        let leader = snap.backends[1].id.clone();
        snap.leader_id = Some(leader.clone());
        assert_eq!(pick(&r, &snap, None, &[]).unwrap().id, leader);

        // A dead (excluded) leader is not substituted.
        assert!(pick(&r, &snap, None, &[leader]).is_none());
    }

    #[test]
    fn sticky_id_wins_while_live() {
        let snap = snapshot(&[8001, 8002, 8003]);
        let target = snap.backends[2].id.clone();
        let picked = pick(&route(false, true), &snap, Some(&target), &[]).unwrap();
        assert_eq!(picked.id, target);
    }

    #[test]
    fn dead_sticky_falls_through_to_live_backend() {
        let snap = snapshot(&[8001, 8002]);
        let gone: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        let gone_id = backend_id(&gone);
        let picked = pick(&route(false, true), &snap, Some(&gone_id), &[]).unwrap();
        assert_ne!(picked.id, gone_id);
    }

    #[test]
    fn least_in_flight_prefers_idle_backend() {
        let snap = snapshot(&[8001, 8002]);
        let busy = snap.backends[0].clone();
        let _g1 = busy.track();
        let _g2 = busy.track();

        for _ in 0..10 {
            let picked = pick(&route(false, false), &snap, None, &[]).unwrap();
            assert_eq!(picked.id, snap.backends[1].id);
        }
    }

    #[test]
    fn exclusion_shrinks_candidates() {
        let snap = snapshot(&[8001, 8002]);
        let first = snap.backends[0].id.clone();
        let picked = pick(&route(false, false), &snap, None, &[first.clone()]).unwrap();
        assert_ne!(picked.id, first);

        let second = picked.id.clone();
        assert!(pick(&route(false, false), &snap, None, &[first, second]).is_none());
    }

    #[test]
    fn ties_are_broken_randomly() {
        let snap = snapshot(&[8001, 8002, 8003, 8004]);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(pick(&route(false, false), &snap, None, &[]).unwrap().id.clone());
        }
        assert!(seen.len() > 1, "random tie-break should spread picks");
    }
}
