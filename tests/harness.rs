//! Test harness: in-process router bootstrap, disposable HTTP backends,
//! and byte-level HTTP clients for asserting on-the-wire behavior.

#![allow(dead_code)]

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use http::header::HeaderMap;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};

use fleetgate::backend_set::BackendSets;
use fleetgate::cert_store::{generate_default_keypair, CertStore};
use fleetgate::discoverd::MemDiscoverd;
use fleetgate::http_listener::{HttpListener, ListenerConfig, RouterState};
use fleetgate::proxy::ProxyClient;
use fleetgate::route_table::{Route, RouteTable};
use fleetgate::sticky::CookieSealer;
use fleetgate::store::MemStore;
use fleetgate::sync::Syncer;

pub const STICKY_TEST_SECRET: &[u8] = b"harness-sticky-secret";

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// A running router with its store and discovery seams exposed.
pub struct RouterHandle {
    pub store: Arc<MemStore>,
    pub discoverd: Arc<MemDiscoverd>,
    pub table: Arc<RouteTable>,
    pub sets: Arc<BackendSets>,
    pub http_addr: SocketAddr,
    pub tls_addr: SocketAddr,
    synced: mpsc::UnboundedReceiver<()>,
    listener: HttpListener,
    shutdown: watch::Sender<bool>,
}

impl RouterHandle {
    pub async fn spawn() -> Self {
        Self::spawn_with(false).await
    }

    pub async fn spawn_with(proxy_protocol: bool) -> Self {
        init_crypto_provider();

        let store = Arc::new(MemStore::new());
        let discoverd = Arc::new(MemDiscoverd::new());
        let table = Arc::new(RouteTable::new());
        let certs = Arc::new(CertStore::new(generate_default_keypair(&[]).unwrap()));
        let sets = Arc::new(BackendSets::new(discoverd.clone()));

        let (sync_tx, synced) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let syncer = Syncer::new(store.clone(), table.clone(), certs.clone(), sets.clone())
            .with_hooks(
                None,
                Some(Box::new(move || {
                    let _ = sync_tx.send(());
                })),
            );
        tokio::spawn(syncer.run(shutdown_rx));

        let state = Arc::new(RouterState {
            table: table.clone(),
            certs,
            sets: sets.clone(),
            proxy: ProxyClient::new(
                Duration::from_secs(1),
                CookieSealer::new(STICKY_TEST_SECRET),
            ),
        });
        let listener = HttpListener::start(
            ListenerConfig {
                addrs: vec!["127.0.0.1:0".parse().unwrap()],
                tls_addrs: vec!["127.0.0.1:0".parse().unwrap()],
                proxy_protocol,
            },
            state,
        )
        .await
        .unwrap();

        let http_addr = listener.addrs[0];
        let tls_addr = listener.tls_addrs[0];
        let mut handle = Self {
            store,
            discoverd,
            table,
            sets,
            http_addr,
            tls_addr,
            synced,
            listener,
            shutdown,
        };
        handle.wait_synced().await;
        handle
    }

    /// Block until the syncer signals a completed snapshot application.
    pub async fn wait_synced(&mut self) {
        tokio::time::timeout(Duration::from_secs(5), self.synced.recv())
            .await
            .expect("timed out waiting for sync")
            .expect("syncer gone");
    }

    pub async fn wait_route(&self, host: &str) {
        wait_for(|| self.table.lookup(host, "/").is_some()).await;
    }

    pub async fn wait_backends(&self, service: &str, count: usize) {
        wait_for(|| {
            self.sets
                .get(service)
                .map(|set| set.len() == count)
                .unwrap_or(count == 0)
        })
        .await;
    }
}

pub async fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

pub fn make_route(id: &str, domain: &str, path: &str, service: &str) -> Route {
    Route {
        id: id.to_string(),
        kind: "http".to_string(),
        domain: domain.to_string(),
        path: path.to_string(),
        service: service.to_string(),
        leader: false,
        sticky: false,
        disable_keep_alives: false,
        certificate: None,
        created_at: 0,
    }
}

/// HTTP/1.1 backend answering every request with a fixed body and
/// recording the headers it saw.
pub struct HttpBackend {
    pub addr: SocketAddr,
    pub last_headers: Arc<RwLock<Option<HeaderMap>>>,
    pub last_body: Arc<RwLock<Option<Vec<u8>>>>,
    pub last_target: Arc<RwLock<Option<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HttpBackend {
    pub async fn spawn(body: &'static str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let last_headers: Arc<RwLock<Option<HeaderMap>>> = Arc::new(RwLock::new(None));
        let last_body: Arc<RwLock<Option<Vec<u8>>>> = Arc::new(RwLock::new(None));
        let last_target: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let headers_clone = last_headers.clone();
        let body_clone = last_body.clone();
        let target_clone = last_target.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let headers = headers_clone.clone();
                        let recorded_body = body_clone.clone();
                        let target = target_clone.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req: Request<Incoming>| {
                                let headers = headers.clone();
                                let recorded_body = recorded_body.clone();
                                let target = target.clone();
                                async move {
                                    *headers.write() = Some(req.headers().clone());
                                    *target.write() = Some(
                                        req.uri()
                                            .path_and_query()
                                            .map(|pq| pq.as_str().to_string())
                                            .unwrap_or_default(),
                                    );
                                    let bytes = http_body_util::BodyExt::collect(req.into_body())
                                        .await
                                        .map(|c| c.to_bytes().to_vec())
                                        .unwrap_or_default();
                                    *recorded_body.write() = Some(bytes);
                                    Ok::<_, Infallible>(Response::new(Full::new(
                                        Bytes::from_static(body.as_bytes()),
                                    )))
                                }
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            last_headers,
            last_body,
            last_target,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for HttpBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Backend that accepts protocol upgrades and echoes raw bytes after the
/// 101 boundary.
pub struct EchoUpgradeBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl EchoUpgradeBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(async move {
                            let service = service_fn(|mut req: Request<Incoming>| async move {
                                if !req.headers().contains_key("upgrade") {
                                    return Ok::<_, Infallible>(Response::new(Full::new(
                                        Bytes::from_static(b"no upgrade"),
                                    )));
                                }
                                let protocol = req
                                    .headers()
                                    .get("upgrade")
                                    .and_then(|v| v.to_str().ok())
                                    .unwrap_or("unknown")
                                    .to_string();
                                let on_upgrade = hyper::upgrade::on(&mut req);
                                tokio::spawn(async move {
                                    if let Ok(upgraded) = on_upgrade.await {
                                        let mut io = TokioIo::new(upgraded);
                                        let mut buf = vec![0u8; 1024];
                                        while let Ok(n) = io.read(&mut buf).await {
                                            if n == 0 || io.write_all(&buf[..n]).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                });
                                let response = Response::builder()
                                    .status(StatusCode::SWITCHING_PROTOCOLS)
                                    .header("upgrade", protocol)
                                    .header("connection", "upgrade")
                                    .body(Full::new(Bytes::new()))
                                    .unwrap();
                                Ok::<_, Infallible>(response)
                            });
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .with_upgrades()
                                .await;
                        });
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for EchoUpgradeBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// An address that refuses connections: bound, then immediately released.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Minimal HTTP/1.1 response for byte-level assertions.
#[derive(Debug)]
pub struct SimpleResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl SimpleResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

fn build_request(
    method: &str,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> String {
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    if !headers
        .iter()
        .any(|(n, _)| n.eq_ignore_ascii_case("connection"))
    {
        request.push_str("Connection: close\r\n");
    }
    request.push_str("\r\n");
    request.push_str(body);
    request
}

fn parse_response(raw: &[u8]) -> SimpleResponse {
    let raw = String::from_utf8_lossy(raw);
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_ref(), ""));
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or("");
    let status = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    SimpleResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

/// One plaintext HTTP/1.1 exchange, connection closed afterwards.
pub async fn request(
    addr: SocketAddr,
    method: &str,
    host: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> SimpleResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect to router");
    stream
        .write_all(build_request(method, host, path, headers, body).as_bytes())
        .await
        .unwrap();
    // Half-close so keep-alive requests still read to EOF.
    let _ = stream.shutdown().await;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    parse_response(&raw)
}

pub async fn get(addr: SocketAddr, host: &str) -> SimpleResponse {
    request(addr, "GET", host, "/", &[], "").await
}

pub async fn get_path(addr: SocketAddr, host: &str, path: &str) -> SimpleResponse {
    request(addr, "GET", host, path, &[], "").await
}

/// Same exchange preceded by a raw PROXY v1 line.
pub async fn request_with_proxy_line(
    addr: SocketAddr,
    proxy_line: &str,
    host: &str,
) -> io::Result<SimpleResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(proxy_line.as_bytes()).await?;
    stream
        .write_all(build_request("GET", host, "/", &[], "").as_bytes())
        .await?;
    let _ = stream.shutdown().await;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    if raw.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection dropped",
        ));
    }
    Ok(parse_response(&raw))
}

/// TLS exchange against the router's TLS listener, trusting `root_der`.
pub async fn tls_request(
    addr: SocketAddr,
    server_name: &str,
    root_der: &[u8],
    host: &str,
) -> io::Result<SimpleResponse> {
    init_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(rustls::pki_types::CertificateDer::from(root_der.to_vec()))
        .map_err(io::Error::other)?;
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = rustls::pki_types::ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut tls = connector.connect(server_name, stream).await?;

    tls.write_all(build_request("GET", host, "/", &[], "").as_bytes())
        .await?;
    let mut raw = Vec::new();
    let _ = tls.read_to_end(&mut raw).await;
    Ok(parse_response(&raw))
}
