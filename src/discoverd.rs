//! Service-discovery seam.
//!
//! The router consumes per-service streams of `up`/`down`/`leader` events.
//! The networked discovery client lives outside this crate; `MemDiscoverd`
//! implements the same contract in memory and backs the binary default and
//! the test suite.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::backend_set::backend_id;

/// One discovery event for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A backend came up (or re-registered) at this address.
    Up { addr: SocketAddr },
    /// The backend with this id went away.
    Down { id: String },
    /// The service leader changed; `None` clears it.
    Leader { id: Option<String> },
}

/// Initial state plus the live event stream for one service.
pub struct ServiceSubscription {
    pub backends: Vec<SocketAddr>,
    pub leader: Option<String>,
    pub events: mpsc::Receiver<ServiceEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoverdError {
    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

pub trait ServiceDiscovery: Send + Sync {
    /// Subscribe to a service: current live set, current leader, and a
    /// stream of subsequent events. A closed stream means the subscription
    /// was lost and must be re-established.
    fn subscribe(
        &self,
        service: &str,
    ) -> BoxFuture<'static, Result<ServiceSubscription, DiscoverdError>>;
}

#[derive(Default)]
struct ServiceState {
    backends: Vec<SocketAddr>,
    leader: Option<String>,
    subscribers: Vec<mpsc::Sender<ServiceEvent>>,
}

/// In-memory discovery registry.
#[derive(Default)]
pub struct MemDiscoverd {
    services: Mutex<HashMap<String, ServiceState>>,
}

impl MemDiscoverd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend address; returns its derived instance id.
    pub fn register(&self, service: &str, addr: SocketAddr) -> String {
        let id = backend_id(&addr);
        let mut services = self.services.lock();
        let state = services.entry(service.to_string()).or_default();
        if !state.backends.contains(&addr) {
            state.backends.push(addr);
        }
        Self::broadcast(state, ServiceEvent::Up { addr });
        id
    }

    /// Unregister a backend address; returns the id that went down.
    pub fn unregister(&self, service: &str, addr: SocketAddr) -> String {
        let id = backend_id(&addr);
        let mut services = self.services.lock();
        if let Some(state) = services.get_mut(service) {
            state.backends.retain(|a| a != &addr);
            if state.leader.as_deref() == Some(id.as_str()) {
                state.leader = None;
            }
            Self::broadcast(state, ServiceEvent::Down { id: id.clone() });
        }
        id
    }

    /// Elect (or clear) the leader for a service.
    pub fn set_leader(&self, service: &str, addr: Option<SocketAddr>) {
        let id = addr.map(|a| backend_id(&a));
        let mut services = self.services.lock();
        let state = services.entry(service.to_string()).or_default();
        state.leader = id.clone();
        Self::broadcast(state, ServiceEvent::Leader { id });
    }

    /// Drop every open subscription stream, forcing consumers to
    /// re-subscribe.
    pub fn kill_streams(&self) {
        let mut services = self.services.lock();
        for state in services.values_mut() {
            state.subscribers.clear();
        }
    }

    fn broadcast(state: &mut ServiceState, event: ServiceEvent) {
        state
            .subscribers
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }
}

impl ServiceDiscovery for MemDiscoverd {
    fn subscribe(
        &self,
        service: &str,
    ) -> BoxFuture<'static, Result<ServiceSubscription, DiscoverdError>> {
        let (tx, rx) = mpsc::channel(256);
        let mut services = self.services.lock();
        let state = services.entry(service.to_string()).or_default();
        state.subscribers.push(tx);
        let subscription = ServiceSubscription {
            backends: state.backends.clone(),
            leader: state.leader.clone(),
            events: rx,
        };
        Box::pin(async move { Ok(subscription) })
    }
}
