//! TLS certificate store and SNI selection.
//!
//! Certificates are deduplicated by the SHA-256 fingerprint of the leaf so
//! any number of routes can share one keypair. Reference counts follow the
//! routes; an entry whose count reaches zero is evicted. Material updates
//! swap atomically and take effect on the next handshake without touching
//! in-flight sessions.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ClientHello;
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::route_table::RouteTable;

/// A TLS keypair, as delivered by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// Opaque identifier assigned by the store.
    pub id: String,
    /// PEM certificate chain, leaf first.
    pub cert: String,
    /// PEM private key.
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("invalid PEM certificate chain: {0}")]
    BadChain(String),
    #[error("no private key found in PEM input")]
    MissingKey,
    #[error("unsupported private key: {0}")]
    BadKey(String),
    #[error("unparseable leaf certificate: {0}")]
    BadLeaf(String),
}

/// One installed keypair, shared by every route referencing its material.
pub struct CertEntry {
    pub fingerprint: String,
    /// DNS names the leaf is valid for (SANs, falling back to the CN).
    pub names: Vec<String>,
    certified: ArcSwap<CertifiedKey>,
    refs: AtomicUsize,
}

impl CertEntry {
    pub fn certified(&self) -> Arc<CertifiedKey> {
        self.certified.load_full()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct IdState {
    fingerprint: Option<String>,
    refs: usize,
}

/// Fingerprint-indexed certificate store with a process-wide default
/// keypair for SNI misses.
pub struct CertStore {
    entries: DashMap<String, Arc<CertEntry>>,
    /// Store id → current fingerprint + route reference count.
    ids: DashMap<String, IdState>,
    default_key: ArcSwap<CertifiedKey>,
}

impl CertStore {
    pub fn new(default_key: CertifiedKey) -> Self {
        Self {
            entries: DashMap::new(),
            ids: DashMap::new(),
            default_key: ArcSwap::from_pointee(default_key),
        }
    }

    /// Parse and install (or update) a certificate. Routes referencing the
    /// id pick up the new material at their next handshake.
    pub fn install(&self, certificate: &Certificate) -> Result<String, CertError> {
        let (certified, fingerprint, names) = parse_keypair(&certificate.cert, &certificate.key)?;

        let mut id_state = self.ids.entry(certificate.id.clone()).or_default();
        let previous = id_state.fingerprint.replace(fingerprint.clone());

        if previous.as_deref() == Some(fingerprint.as_str()) {
            // Same leaf; refresh the material in place (the chain or key
            // encoding may still have changed).
            if let Some(entry) = self.entries.get(&fingerprint) {
                entry.certified.store(Arc::new(certified));
            }
            return Ok(fingerprint);
        }

        let entry = self
            .entries
            .entry(fingerprint.clone())
            .or_insert_with(|| {
                Arc::new(CertEntry {
                    fingerprint: fingerprint.clone(),
                    names,
                    certified: ArcSwap::from_pointee(certified),
                    refs: AtomicUsize::new(0),
                })
            })
            .clone();
        entry.refs.fetch_add(id_state.refs, Ordering::Relaxed);

        if let Some(old) = previous {
            self.drop_refs(&old, id_state.refs);
        }
        debug!(certificate_id = %certificate.id, fingerprint = %entry.fingerprint, "certificate installed");
        Ok(fingerprint)
    }

    /// Remove a certificate by store id, evicting its material unless
    /// another id still shares the same fingerprint.
    pub fn uninstall(&self, id: &str) {
        if let Some((_, state)) = self.ids.remove(id) {
            if let Some(fingerprint) = state.fingerprint {
                self.drop_refs(&fingerprint, state.refs);
            }
        }
    }

    /// Account one more route referencing this certificate id.
    pub fn retain(&self, id: &str) {
        let mut state = self.ids.entry(id.to_string()).or_default();
        state.refs += 1;
        if let Some(fp) = &state.fingerprint {
            if let Some(entry) = self.entries.get(fp) {
                entry.refs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop one route reference; the entry is garbage-collected at zero.
    pub fn release(&self, id: &str) {
        let mut evict = None;
        if let Some(mut state) = self.ids.get_mut(id) {
            state.refs = state.refs.saturating_sub(1);
            if state.refs == 0 {
                evict = Some((id.to_string(), state.fingerprint.clone()));
            } else if let Some(fp) = &state.fingerprint {
                self.drop_refs(fp, 1);
            }
        }
        if let Some((id, fingerprint)) = evict {
            self.ids.remove(&id);
            if let Some(fp) = fingerprint {
                self.drop_refs(&fp, 1);
            }
        }
    }

    fn drop_refs(&self, fingerprint: &str, count: usize) {
        if let Some(entry) = self.entries.get(fingerprint) {
            let before = entry.refs.fetch_sub(count, Ordering::Relaxed);
            if before <= count {
                drop(entry);
                self.entries.remove(fingerprint);
                debug!(%fingerprint, "certificate evicted");
            }
        }
    }

    /// Resolve a certificate id to its current material.
    pub fn resolve(&self, id: &str) -> Option<Arc<CertifiedKey>> {
        let fingerprint = self.ids.get(id)?.fingerprint.clone()?;
        Some(self.entries.get(&fingerprint)?.certified())
    }

    pub fn entry_for_id(&self, id: &str) -> Option<Arc<CertEntry>> {
        let fingerprint = self.ids.get(id)?.fingerprint.clone()?;
        Some(self.entries.get(&fingerprint)?.clone())
    }

    pub fn default_key(&self) -> Arc<CertifiedKey> {
        self.default_key.load_full()
    }

    /// Registration-time check that a route domain is covered by the
    /// certificate's names. A mismatch is served anyway; per-handshake
    /// validation is deliberately absent.
    pub fn validate_domain(&self, id: &str, domain: &str) {
        let Some(entry) = self.entry_for_id(id) else {
            warn!(certificate_id = %id, %domain, "route references unknown certificate");
            return;
        };
        let covered = entry
            .names
            .iter()
            .any(|name| hostname_matches(name, domain));
        if !covered {
            warn!(
                certificate_id = %id,
                fingerprint = %entry.fingerprint,
                %domain,
                "certificate does not cover route domain"
            );
        }
    }

    /// Store ids currently installed (used by the resync diff).
    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Certificate selection for the TLS handshake: the SNI host is routed
/// through the route table and the matched route's certificate is served.
/// Everything else falls back to the default keypair.
pub struct SniResolver {
    table: Arc<RouteTable>,
    certs: Arc<CertStore>,
}

impl SniResolver {
    pub fn new(table: Arc<RouteTable>, certs: Arc<CertStore>) -> Self {
        Self { table, certs }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SniResolver")
    }
}

impl rustls::server::ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let selected = client_hello
            .server_name()
            .and_then(|name| self.table.lookup(name, "/"))
            .and_then(|route| route.certificate.as_deref().and_then(|id| self.certs.resolve(id)));
        Some(selected.unwrap_or_else(|| self.certs.default_key()))
    }
}

/// `*.example.com` covers one extra label; exact names compare
/// case-insensitively.
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match host.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest == suffix,
            None => false,
        }
    } else {
        pattern == host
    }
}

/// Parse a PEM keypair into rustls material plus leaf metadata.
pub fn parse_keypair(
    cert_pem: &str,
    key_pem: &str,
) -> Result<(CertifiedKey, String, Vec<String>), CertError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| CertError::BadChain(e.to_string()))?;
    if chain.is_empty() {
        return Err(CertError::BadChain("empty chain".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertError::BadKey(e.to_string()))?
        .ok_or(CertError::MissingKey)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| CertError::BadKey(e.to_string()))?;

    let fingerprint = leaf_fingerprint(&chain[0]);
    let names = leaf_names(&chain[0])?;

    Ok((CertifiedKey::new(chain, signing_key), fingerprint, names))
}

/// Lowercase hex SHA-256 of the DER-encoded leaf.
pub fn leaf_fingerprint(leaf: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(leaf.as_ref());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn leaf_names(leaf: &CertificateDer<'_>) -> Result<Vec<String>, CertError> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(leaf.as_ref())
        .map_err(|e| CertError::BadLeaf(e.to_string()))?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for entry in &san.value.general_names {
            if let GeneralName::DNSName(dns) = entry {
                names.push(dns.to_string());
            }
        }
    }
    if names.is_empty() {
        for cn in parsed.subject().iter_common_name() {
            if let Ok(value) = cn.as_str() {
                names.push(value.to_string());
            }
        }
    }
    Ok(names)
}

/// Generate an ephemeral self-signed default keypair.
pub fn generate_default_keypair(hosts: &[String]) -> anyhow::Result<CertifiedKey> {
    let subject_alt_names = if hosts.is_empty() {
        vec!["localhost".to_string()]
    } else {
        hosts.to_vec()
    };
    let generated = rcgen::generate_simple_self_signed(subject_alt_names)?;
    let (certified, _, _) = parse_keypair(&generated.cert.pem(), &generated.key_pair.serialize_pem())?;
    Ok(certified)
}
