//! HTTP front-end listener.
//!
//! Binds any number of plaintext and TLS addresses (port 0 is valid; the
//! bound addresses are exposed for callers). Each accepted connection runs
//! in its own task: optional PROXY v1 ingestion, TLS handshake with
//! SNI-selected certificates, then HTTP/1.1 (with upgrade support and
//! pipelined keep-alive) or HTTP/2 depending on the negotiated ALPN.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::HOST;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::backend_set::BackendSets;
use crate::cert_store::{CertStore, SniResolver};
use crate::proxy::{self, ProxyBody, ProxyClient, RequestCtx};
use crate::proxy_protocol;
use crate::route_table::RouteTable;

/// Listener bind configuration.
#[derive(Debug, Clone, Default)]
pub struct ListenerConfig {
    pub addrs: Vec<SocketAddr>,
    pub tls_addrs: Vec<SocketAddr>,
    /// Expect a PROXY v1 line on every accepted connection.
    pub proxy_protocol: bool,
}

/// Everything a request needs to be routed and forwarded.
pub struct RouterState {
    pub table: Arc<RouteTable>,
    pub certs: Arc<CertStore>,
    pub sets: Arc<BackendSets>,
    pub proxy: ProxyClient,
}

/// Running listener set.
pub struct HttpListener {
    /// Bound plaintext addresses, in config order.
    pub addrs: Vec<SocketAddr>,
    /// Bound TLS addresses, in config order.
    pub tls_addrs: Vec<SocketAddr>,
    shutdown: watch::Sender<bool>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl HttpListener {
    /// Bind all configured addresses and start accepting.
    pub async fn start(config: ListenerConfig, state: Arc<RouterState>) -> anyhow::Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut accept_tasks = Vec::new();
        let mut addrs = Vec::new();
        let mut tls_addrs = Vec::new();

        for addr in &config.addrs {
            let listener = TcpListener::bind(addr).await?;
            let bound = listener.local_addr()?;
            info!(addr = %bound, "http listener bound");
            addrs.push(bound);
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                state.clone(),
                None,
                config.proxy_protocol,
                shutdown_rx.clone(),
            )));
        }

        if !config.tls_addrs.is_empty() {
            let tls_config = build_tls_config(&state);
            let acceptor = TlsAcceptor::from(Arc::new(tls_config));
            for addr in &config.tls_addrs {
                let listener = TcpListener::bind(addr).await?;
                let bound = listener.local_addr()?;
                info!(addr = %bound, "https listener bound");
                tls_addrs.push(bound);
                accept_tasks.push(tokio::spawn(accept_loop(
                    listener,
                    state.clone(),
                    Some(acceptor.clone()),
                    config.proxy_protocol,
                    shutdown_rx.clone(),
                )));
            }
        }

        Ok(Self {
            addrs,
            tls_addrs,
            shutdown,
            accept_tasks,
        })
    }

    /// Stop accepting. In-flight connections are left to finish.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        for task in self.accept_tasks {
            let _ = task.await;
        }
    }
}

/// Minimum TLS 1.2, ALPN h2 + http/1.1, certificates chosen by SNI.
fn build_tls_config(state: &RouterState) -> rustls::ServerConfig {
    let resolver = SniResolver::new(state.table.clone(), state.certs.clone());
    let mut config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<RouterState>,
    tls: Option<TlsAcceptor>,
    proxy_protocol: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let ingress_port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        let tls = tls.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, ingress_port, state, tls, proxy_protocol)
                                .await;
                        });
                    }
                    Err(err) => {
                        error!(error = %err, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    ingress_port: u16,
    state: Arc<RouterState>,
    tls: Option<TlsAcceptor>,
    proxy_protocol: bool,
) {
    // The PROXY line precedes everything, including the TLS handshake.
    let client_ip = if proxy_protocol {
        match proxy_protocol::read_header(&mut stream).await {
            Ok(header) => header.src.map(|s| s.ip()).unwrap_or_else(|| peer.ip()),
            Err(err) => {
                debug!(%peer, error = %err, "bad PROXY header; dropping connection");
                return;
            }
        }
    } else {
        peer.ip()
    };

    let ctx = RequestCtx {
        client_ip,
        ingress_port,
        tls: tls.is_some(),
    };
    let service = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(handle_request(&state, req, ctx).await) }
    });

    match tls {
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    debug!(%peer, error = %err, "TLS handshake failed");
                    return;
                }
            };
            let is_h2 = tls_stream.get_ref().1.alpn_protocol() == Some(b"h2");
            let io = TokioIo::new(tls_stream);
            let served = if is_h2 {
                http2::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
            } else {
                // A client may shut its write side down while waiting for
                // the response; only a full close aborts the exchange.
                http1::Builder::new()
                    .half_close(true)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
            };
            if let Err(err) = served {
                debug!(%peer, error = %err, "connection ended");
            }
        }
        None => {
            let io = TokioIo::new(stream);
            if let Err(err) = http1::Builder::new()
                .half_close(true)
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!(%peer, error = %err, "connection ended");
            }
        }
    }
}

async fn handle_request(
    state: &RouterState,
    req: Request<Incoming>,
    ctx: RequestCtx,
) -> Response<ProxyBody> {
    let Some(host) = request_host(&req) else {
        return proxy::not_found();
    };
    let path = req.uri().path();

    let Some(route) = state.table.lookup(&host, path) else {
        debug!(%host, %path, "no route");
        return proxy::not_found();
    };

    // A route whose service has not resolved yet has nothing to dial.
    let Some(set) = state.sets.get(&route.service) else {
        debug!(route_id = %route.id, service = %route.service, "no backend set");
        return proxy::service_unavailable();
    };

    proxy::dispatch(&state.proxy, &route, &set, req, ctx).await
}

/// The Host header for HTTP/1.1; the URI authority for HTTP/2.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.headers().get(HOST).and_then(|v| v.to_str().ok()) {
        return Some(host.to_string());
    }
    req.uri().authority().map(|a| a.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_prefers_header_then_authority() {
        let req = Request::builder()
            .uri("http://authority.example:8080/x")
            .header(HOST, "header.example")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).unwrap(), "header.example");

        let req = Request::builder()
            .uri("http://authority.example:8080/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).unwrap(), "authority.example:8080");

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert!(request_host(&req).is_none());
    }
}
