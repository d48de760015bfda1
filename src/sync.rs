//! Store synchronization.
//!
//! The syncer is the single writer of the routing table and the
//! certificate store. It consumes the store's event stream and, whenever
//! the stream is lost, re-subscribes and reconciles a fresh snapshot
//! against local state as one logical step. Lookups keep hitting the
//! previous snapshot until the diff lands.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend_set::BackendSets;
use crate::cert_store::CertStore;
use crate::route_table::{Route, RouteTable, SetOutcome};
use crate::store::{Store, StoreEvent, StoreObject};

/// Test seam invoked around a resync.
pub type SyncHook = Box<dyn Fn() + Send + Sync>;

pub struct Syncer {
    store: Arc<dyn Store>,
    table: Arc<RouteTable>,
    certs: Arc<CertStore>,
    sets: Arc<BackendSets>,
    pre_sync: Option<SyncHook>,
    post_sync: Option<SyncHook>,
}

impl Syncer {
    pub fn new(
        store: Arc<dyn Store>,
        table: Arc<RouteTable>,
        certs: Arc<CertStore>,
        sets: Arc<BackendSets>,
    ) -> Self {
        Self {
            store,
            table,
            certs,
            sets,
            pre_sync: None,
            post_sync: None,
        }
    }

    /// Install hooks fired before a re-subscribe and after each snapshot
    /// reconciliation.
    pub fn with_hooks(mut self, pre_sync: Option<SyncHook>, post_sync: Option<SyncHook>) -> Self {
        self.pre_sync = pre_sync;
        self.post_sync = post_sync;
        self
    }

    /// Run until shutdown. Never returns on store errors; those reconnect
    /// with a short pause.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut first = true;
        loop {
            if !first {
                if let Some(hook) = &self.pre_sync {
                    hook();
                }
            }

            let mut subscription = match self.store.subscribe().await {
                Ok(sub) => sub,
                Err(err) => {
                    warn!(error = %err, "store subscribe failed; retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            self.reconcile(subscription.snapshot.drain(..).collect());
            if let Some(hook) = &self.post_sync {
                hook();
            }
            if first {
                info!(routes = self.table.len(), "initial route sync complete");
                first = false;
            } else {
                info!(routes = self.table.len(), "resync complete");
            }

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    event = subscription.events.recv() => {
                        match event {
                            Some(event) => self.apply_event(event),
                            None => break,
                        }
                    }
                }
            }

            warn!("store stream lost; resyncing");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    fn apply_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Set(StoreObject::Route(route)) => self.set_route(route),
            StoreEvent::Set(StoreObject::Certificate(cert)) => {
                match self.certs.install(&cert) {
                    Ok(fingerprint) => {
                        debug!(certificate_id = %cert.id, %fingerprint, "certificate set");
                        self.revalidate_cert_routes(&cert.id);
                    }
                    Err(err) => warn!(certificate_id = %cert.id, error = %err, "certificate rejected"),
                }
            }
            StoreEvent::Delete { id } => self.delete(&id),
        }
    }

    fn set_route(&self, route: Route) {
        if route.kind != "http" {
            debug!(route_id = %route.id, kind = %route.kind, "ignoring non-http route");
            return;
        }
        match self.table.set(route) {
            Ok(outcome) => self.account_set(&outcome),
            Err(conflict) => warn!(error = %conflict, "route set rejected"),
        }
    }

    fn delete(&self, id: &str) {
        if let Some(removed) = self.table.remove(id) {
            self.release_route(&removed);
            debug!(route_id = %id, "route deleted");
            return;
        }
        // Not a route; certificates share the delete surface.
        self.certs.uninstall(id);
    }

    /// Move certificate and backend-set references from the displaced
    /// route versions to the installed one.
    fn account_set(&self, outcome: &SetOutcome) {
        let route = &outcome.route;

        let old_cert = outcome
            .previous
            .as_ref()
            .and_then(|p| p.certificate.clone());
        if route.certificate != old_cert {
            if let Some(id) = &route.certificate {
                self.certs.retain(id);
                self.certs.validate_domain(id, &route.domain);
            }
            if let Some(id) = &old_cert {
                self.certs.release(id);
            }
        }

        let old_service = outcome.previous.as_ref().map(|p| p.service.clone());
        if old_service.as_deref() != Some(route.service.as_str()) {
            if !route.service.is_empty() {
                self.sets.acquire(&route.service);
            }
            if let Some(service) = old_service.filter(|s| !s.is_empty()) {
                self.sets.release(&service);
            }
        }

        if let Some(evicted) = &outcome.evicted {
            self.release_route(evicted);
        }
    }

    /// Re-check route domains against freshly installed material.
    fn revalidate_cert_routes(&self, cert_id: &str) {
        for route in self.table.all() {
            if route.certificate.as_deref() == Some(cert_id) {
                self.certs.validate_domain(cert_id, &route.domain);
            }
        }
    }

    fn release_route(&self, route: &Route) {
        if let Some(id) = &route.certificate {
            self.certs.release(id);
        }
        if !route.service.is_empty() {
            self.sets.release(&route.service);
        }
    }

    /// Diff a full snapshot against local state. Certificates land first
    /// so routes referencing them validate against fresh material; route
    /// changes are applied in a single snapshot swap.
    fn reconcile(&self, snapshot: Vec<StoreObject>) {
        let mut routes = Vec::new();
        let mut cert_ids = HashSet::new();
        for object in snapshot {
            match object {
                StoreObject::Route(route) => {
                    if route.kind == "http" {
                        routes.push(route);
                    }
                }
                StoreObject::Certificate(cert) => {
                    cert_ids.insert(cert.id.clone());
                    if let Err(err) = self.certs.install(&cert) {
                        warn!(certificate_id = %cert.id, error = %err, "certificate rejected");
                    }
                }
            }
        }
        for known in self.certs.ids() {
            if !cert_ids.contains(&known) {
                self.certs.uninstall(&known);
            }
        }

        let route_ids: HashSet<String> = routes.iter().map(|r| r.id.clone()).collect();
        let removals: Vec<String> = self
            .table
            .all()
            .into_iter()
            .filter(|r| !route_ids.contains(&r.id))
            .map(|r| r.id.clone())
            .collect();

        let outcome = self.table.apply_batch(routes, &removals);
        for removed in &outcome.removed {
            self.release_route(removed);
        }
        for set in &outcome.applied {
            self.account_set(set);
        }
        for conflict in &outcome.conflicts {
            warn!(error = %conflict, "route set rejected during resync");
        }
    }
}
