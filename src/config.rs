//! Configuration: TOML with serde defaults.
//!
//! All externally tunable values live here - bind addresses, the default
//! TLS keypair, the sticky-cookie secret, and backend dial behavior.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::http_listener::ListenerConfig;

/// Top-level router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen: ListenSettings,
    pub tls: TlsSettings,
    pub sticky: StickySettings,
    pub backend: BackendSettings,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen: ListenSettings::default(),
            tls: TlsSettings::default(),
            sticky: StickySettings::default(),
            backend: BackendSettings::default(),
        }
    }
}

/// Bind addresses. Port 0 asks the OS for an ephemeral port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    /// Plaintext listener addresses.
    pub http: Vec<String>,
    /// TLS listener addresses.
    pub https: Vec<String>,
    /// Expect a PROXY v1 line on every accepted connection.
    pub proxy_protocol: bool,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self {
            http: vec!["0.0.0.0:8080".to_string()],
            https: vec!["0.0.0.0:8443".to_string()],
            proxy_protocol: false,
        }
    }
}

/// Default keypair served when SNI matches no route certificate. When
/// unset, an ephemeral self-signed pair is generated at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub default_cert_path: Option<PathBuf>,
    pub default_key_path: Option<PathBuf>,
}

/// Sticky-cookie secret shared across router instances. When unset a
/// random secret is generated and cookies do not survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StickySettings {
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Per-attempt dial timeout in milliseconds.
    pub dial_timeout_ms: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 5_000,
        }
    }
}

impl RouterConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let config: RouterConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listen.http.is_empty() && self.listen.https.is_empty() {
            anyhow::bail!("no listener addresses configured");
        }
        for addr in self.listen.http.iter().chain(&self.listen.https) {
            addr.parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid listen address '{addr}': {e}"))?;
        }
        if self.tls.default_cert_path.is_some() != self.tls.default_key_path.is_some() {
            anyhow::bail!("default_cert_path and default_key_path must be set together");
        }
        if self.backend.dial_timeout_ms == 0 {
            anyhow::bail!("dial_timeout_ms must be positive");
        }
        Ok(())
    }

    /// Parsed bind configuration for the listener.
    pub fn listener_config(&self) -> ListenerConfig {
        let parse = |addrs: &[String]| {
            addrs
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect::<Vec<SocketAddr>>()
        };
        ListenerConfig {
            addrs: parse(&self.listen.http),
            tls_addrs: parse(&self.listen.https),
            proxy_protocol: self.listen.proxy_protocol,
        }
    }
}
