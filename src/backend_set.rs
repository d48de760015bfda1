//! Live backend sets, one per referenced service.
//!
//! A set is opened when the first route references its service and closed
//! when the last such route goes away. A feeder task per set consumes the
//! discovery stream and publishes copy-on-write snapshots; readers are
//! wait-free. In-flight request counters live on the backend record and
//! survive re-registration of the same instance id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::discoverd::{ServiceDiscovery, ServiceEvent};

/// Instance id: hex md5 of `"tcp-" + host:port`. The same address always
/// maps to the same id, so re-registrations are recognized.
pub fn backend_id(addr: &SocketAddr) -> String {
    format!("{:x}", md5::compute(format!("tcp-{addr}")))
}

/// One live endpoint of a service.
pub struct Backend {
    pub service: String,
    pub addr: SocketAddr,
    pub id: String,
    in_flight: AtomicUsize,
}

impl Backend {
    pub(crate) fn new(service: &str, addr: SocketAddr) -> Self {
        Self {
            service: service.to_string(),
            addr,
            id: backend_id(&addr),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Count a dispatched request until the guard drops.
    pub fn track(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            backend: self.clone(),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("service", &self.service)
            .field("addr", &self.addr)
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Decrements the owning backend's in-flight counter on drop.
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Immutable view of a service's live set.
#[derive(Default)]
pub struct BackendsSnapshot {
    /// Stable registration order.
    pub backends: Vec<Arc<Backend>>,
    pub leader_id: Option<String>,
}

impl BackendsSnapshot {
    pub fn by_id(&self, id: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.id == id)
    }
}

/// The live set for one service.
pub struct BackendSet {
    pub service: String,
    snapshot: ArcSwap<BackendsSnapshot>,
}

impl BackendSet {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            snapshot: ArcSwap::from_pointee(BackendsSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<BackendsSnapshot> {
        self.snapshot.load_full()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().backends.is_empty()
    }
}

/// Feeder-side state; the snapshot is derived from it after every event.
struct FeederState {
    backends: Vec<Arc<Backend>>,
    leader_id: Option<String>,
}

impl FeederState {
    fn publish(&self, set: &BackendSet) {
        set.snapshot.store(Arc::new(BackendsSnapshot {
            backends: self.backends.clone(),
            leader_id: self.leader_id.clone(),
        }));
    }

    fn apply(&mut self, service: &str, event: ServiceEvent) {
        match event {
            ServiceEvent::Up { addr } => {
                let id = backend_id(&addr);
                if !self.backends.iter().any(|b| b.id == id) {
                    self.backends.push(Arc::new(Backend::new(service, addr)));
                }
            }
            ServiceEvent::Down { id } => {
                self.backends.retain(|b| b.id != id);
            }
            ServiceEvent::Leader { id } => {
                self.leader_id = id;
            }
        }
    }
}

struct SetHandle {
    set: Arc<BackendSet>,
    refs: usize,
    feeder: JoinHandle<()>,
}

/// Registry of open backend sets, refcounted by referencing routes.
pub struct BackendSets {
    discovery: Arc<dyn ServiceDiscovery>,
    sets: Mutex<HashMap<String, SetHandle>>,
}

impl BackendSets {
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self {
            discovery,
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or re-reference) the set for a service.
    pub fn acquire(&self, service: &str) -> Arc<BackendSet> {
        let mut sets = self.sets.lock();
        if let Some(handle) = sets.get_mut(service) {
            handle.refs += 1;
            return handle.set.clone();
        }

        let set = Arc::new(BackendSet::new(service));
        let feeder = tokio::spawn(feed(
            self.discovery.clone(),
            service.to_string(),
            set.clone(),
        ));
        sets.insert(
            service.to_string(),
            SetHandle {
                set: set.clone(),
                refs: 1,
                feeder,
            },
        );
        debug!(%service, "backend set opened");
        set
    }

    /// Drop one reference; the set closes when the count reaches zero.
    pub fn release(&self, service: &str) {
        let mut sets = self.sets.lock();
        if let Some(handle) = sets.get_mut(service) {
            handle.refs -= 1;
            if handle.refs == 0 {
                if let Some(closed) = sets.remove(service) {
                    closed.feeder.abort();
                    debug!(%service, "backend set closed");
                }
            }
        }
    }

    pub fn get(&self, service: &str) -> Option<Arc<BackendSet>> {
        self.sets.lock().get(service).map(|h| h.set.clone())
    }

    pub fn len(&self) -> usize {
        self.sets.lock().len()
    }
}

/// Consume the discovery stream for one service, re-subscribing with a
/// short pause whenever the stream closes.
async fn feed(discovery: Arc<dyn ServiceDiscovery>, service: String, set: Arc<BackendSet>) {
    loop {
        let mut subscription = match discovery.subscribe(&service).await {
            Ok(sub) => sub,
            Err(err) => {
                warn!(%service, error = %err, "discovery subscribe failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // Rebuild from the subscription's initial state, carrying over
        // existing records (and their in-flight counters) by id.
        let current = set.snapshot();
        let mut state = FeederState {
            backends: subscription
                .backends
                .iter()
                .map(|addr| {
                    let id = backend_id(addr);
                    current
                        .by_id(&id)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(Backend::new(&service, *addr)))
                })
                .collect(),
            leader_id: subscription.leader.clone(),
        };
        state.publish(&set);

        while let Some(event) = subscription.events.recv().await {
            state.apply(&service, event);
            state.publish(&set);
        }

        warn!(%service, "discovery stream lost; re-subscribing");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
