//! Route/certificate store seam.
//!
//! The store delivers a full snapshot plus a live `set`/`delete` stream.
//! A closed stream means the subscription was lost; the syncer reconnects
//! and diffs a fresh snapshot (§ sync). The networked store client lives
//! outside this crate; `MemStore` implements the contract in memory.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cert_store::Certificate;
use crate::route_table::Route;

/// An object held by the store.
#[derive(Debug, Clone)]
pub enum StoreObject {
    Route(Route),
    Certificate(Certificate),
}

impl StoreObject {
    pub fn id(&self) -> &str {
        match self {
            StoreObject::Route(route) => &route.id,
            StoreObject::Certificate(cert) => &cert.id,
        }
    }
}

/// One store mutation.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Set(StoreObject),
    Delete { id: String },
}

/// Snapshot plus live stream.
pub struct StoreSubscription {
    pub snapshot: Vec<StoreObject>,
    pub events: mpsc::Receiver<StoreEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub trait Store: Send + Sync {
    fn subscribe(&self) -> BoxFuture<'static, Result<StoreSubscription, StoreError>>;
}

/// In-memory store used by the binary default and the tests.
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<String, StoreObject>>,
    subscribers: Mutex<Vec<mpsc::Sender<StoreEvent>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_route(&self, route: Route) {
        self.set(StoreObject::Route(route));
    }

    pub fn set_certificate(&self, certificate: Certificate) {
        self.set(StoreObject::Certificate(certificate));
    }

    fn set(&self, object: StoreObject) {
        self.objects
            .lock()
            .insert(object.id().to_string(), object.clone());
        self.broadcast(StoreEvent::Set(object));
    }

    pub fn delete(&self, id: &str) {
        if self.objects.lock().remove(id).is_some() {
            self.broadcast(StoreEvent::Delete { id: id.to_string() });
        }
    }

    /// Drop every open event stream, as a broken store connection would.
    /// Mutations made while no stream is open are only visible through the
    /// snapshot of the next subscription.
    pub fn kill_streams(&self) {
        self.subscribers.lock().clear();
    }

    fn broadcast(&self, event: StoreEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.try_send(event.clone()).is_ok());
    }
}

impl Store for MemStore {
    fn subscribe(&self) -> BoxFuture<'static, Result<StoreSubscription, StoreError>> {
        let (tx, rx) = mpsc::channel(256);
        let snapshot = self.objects.lock().values().cloned().collect();
        self.subscribers.lock().push(tx);
        Box::pin(async move {
            Ok(StoreSubscription {
                snapshot,
                events: rx,
            })
        })
    }
}
