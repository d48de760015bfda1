//! fleetgate - HTTP(S) front-end router for a dynamic backend fleet.
//!
//! A reverse proxy that:
//! - Routes requests by virtual host and path, with wildcard domains and a
//!   catch-all, against an index kept live by a reconnecting store sync
//! - Terminates TLS with SNI-selected certificates and h2/http1 ALPN
//! - Balances across discovered backends (leader pin, sticky cookies,
//!   least in-flight) with dial-failure retry
//! - Forwards upgraded protocols (WebSocket and friends) as a raw splice
//! - Optionally ingests PROXY protocol v1 for real client addresses

pub mod backend_set;
pub mod balance;
pub mod cert_store;
pub mod config;
pub mod discoverd;
pub mod http_listener;
pub mod proxy;
pub mod proxy_protocol;
pub mod route_table;
pub mod sticky;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use backend_set::{Backend, BackendSet, BackendSets};
pub use cert_store::{CertStore, Certificate, SniResolver};
pub use config::RouterConfig;
pub use discoverd::{MemDiscoverd, ServiceDiscovery, ServiceEvent};
pub use http_listener::{HttpListener, ListenerConfig, RouterState};
pub use proxy::{ProxyClient, RequestCtx};
pub use route_table::{Route, RouteTable};
pub use sticky::{CookieSealer, STICKY_COOKIE};
pub use store::{MemStore, Store, StoreEvent, StoreObject};
pub use sync::Syncer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
