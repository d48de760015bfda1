// Crate-level lint configuration
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! fleetgate - HTTP(S) front-end router for a dynamic backend fleet.
//!
//! Wires the route table, certificate store, backend sets, syncer, and
//! listeners together and runs until interrupted. The store and discovery
//! integrations are in-process seams here; production deployments plug in
//! networked clients behind the same traits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetgate::backend_set::BackendSets;
use fleetgate::cert_store::{self, CertStore};
use fleetgate::config::RouterConfig;
use fleetgate::discoverd::MemDiscoverd;
use fleetgate::http_listener::{HttpListener, RouterState};
use fleetgate::proxy::ProxyClient;
use fleetgate::route_table::RouteTable;
use fleetgate::sticky::CookieSealer;
use fleetgate::store::MemStore;
use fleetgate::sync::Syncer;

/// fleetgate - HTTP(S) front-end router
#[derive(Parser, Debug)]
#[command(name = "fleetgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "FLEETGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FLEETGATE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long, env = "FLEETGATE_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start listeners)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install the crypto provider before any TLS configuration is built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let args = Args::parse();
    init_logging(&args.log_level, args.json_logs)?;

    info!("starting fleetgate v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "loading configuration");
            RouterConfig::load(path)?
        }
        None => {
            info!("no configuration file given; using defaults");
            RouterConfig::default()
        }
    };
    config.validate()?;
    if args.validate {
        info!("configuration valid");
        return Ok(());
    }

    // Default keypair for SNI misses.
    let default_key = match (&config.tls.default_cert_path, &config.tls.default_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path)?;
            let key_pem = std::fs::read_to_string(key_path)?;
            let (certified, fingerprint, _) = cert_store::parse_keypair(&cert_pem, &key_pem)?;
            info!(%fingerprint, "default TLS keypair loaded");
            certified
        }
        _ => {
            warn!("no default keypair configured; generating an ephemeral self-signed pair");
            cert_store::generate_default_keypair(&[])?
        }
    };

    let sealer = match &config.sticky.secret {
        Some(secret) => CookieSealer::new(secret.as_bytes()),
        None => {
            warn!("no sticky secret configured; sticky cookies will not survive restarts");
            CookieSealer::random()
        }
    };

    let table = Arc::new(RouteTable::new());
    let certs = Arc::new(CertStore::new(default_key));
    let discoverd = Arc::new(MemDiscoverd::new());
    let sets = Arc::new(BackendSets::new(discoverd));
    let store = Arc::new(MemStore::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let syncer = Syncer::new(store, table.clone(), certs.clone(), sets.clone());
    let sync_task = tokio::spawn(syncer.run(shutdown_rx));

    let state = Arc::new(RouterState {
        table,
        certs,
        sets,
        proxy: ProxyClient::new(
            Duration::from_millis(config.backend.dial_timeout_ms),
            sealer,
        ),
    });

    let listener = HttpListener::start(config.listener_config(), state).await?;
    for addr in &listener.addrs {
        info!(%addr, "serving http");
    }
    for addr in &listener.tls_addrs {
        info!(%addr, "serving https");
    }

    signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    listener.close().await;
    let _ = sync_task.await;
    info!("fleetgate stopped");
    Ok(())
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fleetgate={level},info")));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
    }
    Ok(())
}
