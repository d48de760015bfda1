//! Request forwarding.
//!
//! One module, two forwarding paths: ordinary HTTP exchanges stream
//! through the pooled backend client; upgrade requests splice raw bytes
//! after the 101 boundary. Both share the same header canonicalization and
//! dial-retry rules. Backend connections are HTTP/1.1 with keep-alive
//! unless the route disables it, in which case a non-pooling client closes
//! the upstream socket after each response.

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::LazyLock;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, COOKIE, HOST, SET_COOKIE, TRANSFER_ENCODING,
    UPGRADE,
};
use http::uri::Uri;
use http::{Request, Response, StatusCode, Version};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::backend_set::{Backend, BackendSet, InFlightGuard};
use crate::balance;
use crate::route_table::Route;
use crate::sticky::{self, CookieSealer};

/// Response body handed back to the listener.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Client-supplied request ids outside this shape are replaced.
static REQUEST_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/=\-._*]{20,200}$").expect("static regex"));

/// Connection facts the canonicalizer needs.
#[derive(Debug, Clone, Copy)]
pub struct RequestCtx {
    /// Effective client address: PROXY header source when present, socket
    /// peer otherwise.
    pub client_ip: IpAddr,
    /// Port the ingress listener is bound to.
    pub ingress_port: u16,
    /// Whether the request arrived over the TLS listener.
    pub tls: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no live backend")]
    NoBackend,
    #[error("backend dial failed: {0}")]
    DialFailed(hyper_util::client::legacy::Error),
    #[error("upstream failed: {0}")]
    Upstream(hyper_util::client::legacy::Error),
    #[error("could not rebuild forwarded request: {0}")]
    BadRequest(#[from] http::Error),
}

/// Backend-facing HTTP clients plus the sticky-cookie sealer.
pub struct ProxyClient {
    pooled: Client<HttpConnector, ReplayBody<Incoming>>,
    unpooled: Client<HttpConnector, ReplayBody<Incoming>>,
    sealer: CookieSealer,
}

impl ProxyClient {
    pub fn new(dial_timeout: Duration, sealer: CookieSealer) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(dial_timeout));
        connector.set_nodelay(true);

        let pooled = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(100)
            .build(connector.clone());
        // Routes with keep-alives disabled get a client that never parks
        // connections, so the upstream socket closes with the response.
        let unpooled = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            pooled,
            unpooled,
            sealer,
        }
    }

    fn client_for(&self, route: &Route) -> &Client<HttpConnector, ReplayBody<Incoming>> {
        if route.disable_keep_alives {
            &self.unpooled
        } else {
            &self.pooled
        }
    }
}

/// Forward one exchange. Always produces a response; failures surface as
/// plain-text error statuses.
pub async fn dispatch(
    proxy: &ProxyClient,
    route: &Route,
    set: &BackendSet,
    req: Request<Incoming>,
    ctx: RequestCtx,
) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();
    let meta = canonicalize_request(&mut parts.headers, &ctx);

    // h2 requests carry the authority in the URI; backends speak HTTP/1.1
    // and need a Host header.
    if !parts.headers.contains_key(HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                parts.headers.insert(HOST, value);
            }
        }
    }

    let sticky_id = if route.sticky {
        let id = sticky::cookie_value(&parts.headers)
            .and_then(|token| proxy.sealer.open(&route.service, &token));
        strip_sticky_cookie(&mut parts.headers);
        id
    } else {
        None
    };

    let client_upgrade = parts.extensions.remove::<OnUpgrade>();
    if meta.upgrade {
        // The backend must still see the upgrade intent.
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    }

    let snapshot = set.snapshot();
    let shared = ReplayShared::new(body);
    let mut excluded: Vec<String> = Vec::new();
    let total = snapshot.backends.len();

    let outcome = loop {
        let Some(backend) = balance::pick(route, &snapshot, sticky_id.as_deref(), &excluded)
        else {
            break Err(DispatchError::NoBackend);
        };
        let guard = backend.track();

        let forwarded = match build_forwarded(&parts, &backend, shared.body()) {
            Ok(request) => request,
            Err(err) => break Err(DispatchError::BadRequest(err)),
        };

        match proxy.client_for(route).request(forwarded).await {
            Ok(response) => break Ok((response, backend, guard)),
            Err(err) => {
                drop(guard);
                if err.is_connect() {
                    debug!(
                        request_id = %meta.request_id,
                        backend = %backend.addr,
                        error = %err,
                        "backend dial failed"
                    );
                    if shared.intact() && excluded.len() + 1 < total {
                        excluded.push(backend.id.clone());
                        continue;
                    }
                    break Err(DispatchError::DialFailed(err));
                }
                break Err(DispatchError::Upstream(err));
            }
        }
    };

    match outcome {
        Ok((response, backend, guard)) => {
            if meta.upgrade {
                finish_upgrade(response, &backend, guard, client_upgrade)
            } else {
                finish_plain(proxy, route, response, &backend, guard, sticky_id.as_deref(), ctx)
            }
        }
        Err(err) => {
            warn!(request_id = %meta.request_id, error = %err, "request failed");
            service_unavailable()
        }
    }
}

/// Ordinary exchange: canonicalize, maybe emit a sticky cookie, stream the
/// body through while holding the in-flight guard.
fn finish_plain(
    proxy: &ProxyClient,
    route: &Route,
    response: Response<Incoming>,
    backend: &Arc<Backend>,
    guard: InFlightGuard,
    sticky_id: Option<&str>,
    ctx: RequestCtx,
) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    canonicalize_response(&mut parts.headers, parts.status);

    // A replacement cookie goes out only when the stuck backend was not
    // the one that served the request.
    if route.sticky && sticky_id != Some(backend.id.as_str()) {
        let token = proxy.sealer.seal(&route.service, &backend.id);
        if let Ok(value) = HeaderValue::from_str(&sticky::set_cookie(&token, ctx.tls)) {
            parts.headers.append(SET_COOKIE, value);
        }
    }

    let body = TrackedBody {
        inner: body,
        _guard: guard,
    };
    Response::from_parts(parts, BoxBody::new(body))
}

/// Upgrade exchange: a 101 starts the bidirectional splice; anything else
/// is delivered and the client connection closes behind it.
fn finish_upgrade(
    response: Response<Incoming>,
    backend: &Arc<Backend>,
    guard: InFlightGuard,
    client_upgrade: Option<OnUpgrade>,
) -> Response<ProxyBody> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let (mut parts, body) = response.into_parts();
        canonicalize_response(&mut parts.headers, parts.status);
        // No keep-alive after a refused upgrade.
        parts
            .headers
            .insert(CONNECTION, HeaderValue::from_static("close"));
        let body = TrackedBody {
            inner: body,
            _guard: guard,
        };
        return Response::from_parts(parts, BoxBody::new(body));
    }

    let Some(client_upgrade) = client_upgrade else {
        // The ingress protocol cannot switch (HTTP/2 client).
        warn!(backend = %backend.addr, "upgrade response without an upgradable client connection");
        return service_unavailable();
    };

    let mut backend_response = response;
    let backend_upgrade = hyper::upgrade::on(&mut backend_response);
    tokio::spawn(async move {
        let _guard = guard;
        match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok((client_io, backend_io)) => {
                let mut client_io = TokioIo::new(client_io);
                let mut backend_io = TokioIo::new(backend_io);
                if let Err(err) =
                    tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await
                {
                    debug!(error = %err, "upgrade splice ended");
                }
            }
            Err(err) => debug!(error = %err, "upgrade handshake failed"),
        }
    });

    let (mut parts, _) = backend_response.into_parts();
    canonicalize_response(&mut parts.headers, parts.status);
    parts
        .headers
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    let mut switching = Response::new(empty_body());
    *switching.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *switching.headers_mut() = parts.headers;
    switching
}

fn build_forwarded(
    parts: &http::request::Parts,
    backend: &Backend,
    body: ReplayBody<Incoming>,
) -> Result<Request<ReplayBody<Incoming>>, http::Error> {
    // The original request-target bytes are reused untouched; pre-encoded
    // URIs must reach the backend as sent.
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = Uri::builder()
        .scheme("http")
        .authority(backend.addr.to_string())
        .path_and_query(path_and_query)
        .build()?;

    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .version(Version::HTTP_11)
        .body(body)?;
    *request.headers_mut() = parts.headers.clone();
    Ok(request)
}

/// What request canonicalization decided.
pub struct RequestMeta {
    pub request_id: String,
    /// The request asked for a protocol upgrade.
    pub upgrade: bool,
}

/// Apply the client→backend header rules in place.
pub fn canonicalize_request(headers: &mut HeaderMap, ctx: &RequestCtx) -> RequestMeta {
    let tokens = connection_tokens(headers);
    let upgrade = tokens.iter().any(|t| t == "upgrade") && headers.contains_key(UPGRADE);

    // Headers named by Connection are hop-by-hop. Proxy-Authenticate and
    // Proxy-Authorization pass through verbatim regardless.
    for token in &tokens {
        if token == "proxy-authenticate" || token == "proxy-authorization" {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
    headers.remove(CONNECTION);
    headers.remove("keep-alive");
    headers.remove(TRANSFER_ENCODING);
    if !upgrade {
        headers.remove(UPGRADE);
    }

    let prior: Vec<String> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let client_ip = ctx.client_ip.to_string();
    let forwarded_for = if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if ctx.tls { "https" } else { "http" }),
    );
    if let Ok(value) = HeaderValue::from_str(&ctx.ingress_port.to_string()) {
        headers.insert("x-forwarded-port", value);
    }

    let start_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    if let Ok(value) = HeaderValue::from_str(&start_ms.to_string()) {
        headers.insert("x-request-start", value);
    }

    let request_id = match headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| REQUEST_ID_RE.is_match(v))
    {
        Some(id) => id.to_string(),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            if let Ok(value) = HeaderValue::from_str(&id) {
                headers.insert("x-request-id", value);
            }
            id
        }
    };

    RequestMeta {
        request_id,
        upgrade,
    }
}

/// Apply the backend→client header rules in place.
pub fn canonicalize_response(headers: &mut HeaderMap, status: StatusCode) {
    let tokens = connection_tokens(headers);
    for token in &tokens {
        if token == "proxy-authenticate" || token == "proxy-authorization" {
            continue;
        }
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
    headers.remove(CONNECTION);
    headers.remove("keep-alive");
    headers.remove(TRANSFER_ENCODING);
    if status != StatusCode::SWITCHING_PROTOCOLS {
        headers.remove(UPGRADE);
    }
}

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Drop our sticky pair from the Cookie headers, leaving the rest intact.
fn strip_sticky_cookie(headers: &mut HeaderMap) {
    let rebuilt: Vec<String> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|raw| {
            raw.split(';')
                .map(str::trim)
                .filter(|pair| {
                    !pair
                        .strip_prefix(sticky::STICKY_COOKIE)
                        .is_some_and(|rest| rest.starts_with('='))
                })
                .collect::<Vec<_>>()
                .join("; ")
        })
        .filter(|v| !v.is_empty())
        .collect();

    headers.remove(COOKIE);
    for value in rebuilt {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.append(COOKIE, value);
        }
    }
}

pub fn service_unavailable() -> Response<ProxyBody> {
    let mut response = Response::new(full_body("Service Unavailable\n"));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response
}

pub fn not_found() -> Response<ProxyBody> {
    let mut response = Response::new(full_body("404 page not found\n"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

pub fn full_body(text: &'static str) -> ProxyBody {
    BoxBody::new(Full::new(Bytes::from_static(text.as_bytes())).map_err(|never| match never {}))
}

pub fn empty_body() -> ProxyBody {
    BoxBody::new(Full::new(Bytes::new()).map_err(|never| match never {}))
}

/// Retry is only sound while the request body has not been handed to a
/// connection. The shared slot releases the inner body to the first
/// attempt that polls it; a dial failure leaves it untouched and the next
/// attempt reuses it.
pub struct ReplayShared<B> {
    slot: Arc<Mutex<Option<B>>>,
}

impl<B> ReplayShared<B> {
    pub fn new(body: B) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(body))),
        }
    }

    pub fn body(&self) -> ReplayBody<B> {
        ReplayBody {
            slot: self.slot.clone(),
            taken: None,
        }
    }

    /// True while no attempt has started consuming the body.
    pub fn intact(&self) -> bool {
        self.slot.lock().is_some()
    }
}

pub struct ReplayBody<B> {
    slot: Arc<Mutex<Option<B>>>,
    taken: Option<B>,
}

impl<B> Body for ReplayBody<B>
where
    B: Body + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.taken.is_none() {
            this.taken = this.slot.lock().take();
        }
        match this.taken.as_mut() {
            Some(inner) => Pin::new(inner).poll_frame(cx),
            // Another attempt consumed the body; nothing more to send.
            None => Poll::Ready(None),
        }
    }

    fn is_end_stream(&self) -> bool {
        if let Some(inner) = &self.taken {
            return inner.is_end_stream();
        }
        match self.slot.lock().as_ref() {
            Some(inner) => inner.is_end_stream(),
            None => true,
        }
    }

    fn size_hint(&self) -> SizeHint {
        if let Some(inner) = &self.taken {
            return inner.size_hint();
        }
        match self.slot.lock().as_ref() {
            Some(inner) => inner.size_hint(),
            None => SizeHint::with_exact(0),
        }
    }
}

/// Streams the backend body while counting the request as in flight.
struct TrackedBody {
    inner: Incoming,
    _guard: InFlightGuard,
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn ctx() -> RequestCtx {
        RequestCtx {
            client_ip: "203.0.113.9".parse().unwrap(),
            ingress_port: 8080,
            tls: false,
        }
    }

    fn header(headers: &HeaderMap, name: &str) -> Option<String> {
        headers.get(name).map(|v| v.to_str().unwrap().to_string())
    }

    #[test]
    fn connection_named_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "keep-alive, custom-h".parse().unwrap());
        headers.insert("custom-h", "x".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert(UPGRADE, "u".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());

        let meta = canonicalize_request(&mut headers, &ctx());
        assert!(!meta.upgrade);
        assert!(headers.get("custom-h").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(UPGRADE).is_none());
        assert!(headers.get(TRANSFER_ENCODING).is_none());
        assert!(headers.get(CONNECTION).is_none());
    }

    #[test]
    fn upgrade_is_preserved_when_requested() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "Upgrade".parse().unwrap());
        headers.insert(UPGRADE, "websocket".parse().unwrap());
        headers.insert(TRANSFER_ENCODING, "chunked".parse().unwrap());

        let meta = canonicalize_request(&mut headers, &ctx());
        assert!(meta.upgrade);
        assert_eq!(header(&headers, "upgrade").unwrap(), "websocket");
        assert!(headers.get(TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn proxy_auth_headers_survive_connection_listing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, "proxy-authorization".parse().unwrap());
        headers.insert("proxy-authorization", "Basic Zm9v".parse().unwrap());

        canonicalize_request(&mut headers, &ctx());
        assert_eq!(
            header(&headers, "proxy-authorization").unwrap(),
            "Basic Zm9v"
        );
    }

    #[test]
    fn forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        canonicalize_request(&mut headers, &ctx());
        assert_eq!(header(&headers, "x-forwarded-for").unwrap(), "203.0.113.9");

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1".parse().unwrap());
        canonicalize_request(&mut headers, &ctx());
        assert_eq!(
            header(&headers, "x-forwarded-for").unwrap(),
            "10.0.0.1, 203.0.113.9"
        );
    }

    #[test]
    fn forwarded_proto_and_port() {
        let mut headers = HeaderMap::new();
        canonicalize_request(&mut headers, &ctx());
        assert_eq!(header(&headers, "x-forwarded-proto").unwrap(), "http");
        assert_eq!(header(&headers, "x-forwarded-port").unwrap(), "8080");

        let mut headers = HeaderMap::new();
        let tls_ctx = RequestCtx { tls: true, ..ctx() };
        canonicalize_request(&mut headers, &tls_ctx);
        assert_eq!(header(&headers, "x-forwarded-proto").unwrap(), "https");
    }

    #[test]
    fn request_start_is_millisecond_epoch() {
        let mut headers = HeaderMap::new();
        canonicalize_request(&mut headers, &ctx());
        let start = header(&headers, "x-request-start").unwrap();
        assert_eq!(start.len(), 13);
        assert!(start.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn valid_request_id_passes_through() {
        let id = "abc123+/=-._*ABCDEFGH";
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", id.parse().unwrap());
        let meta = canonicalize_request(&mut headers, &ctx());
        assert_eq!(meta.request_id, id);
        assert_eq!(header(&headers, "x-request-id").unwrap(), id);
    }

    #[test]
    fn invalid_request_ids_are_replaced() {
        for bad in ["short", "has spaces aaaaaaaaaaaaaa", "bad!chars#aaaaaaaaaaaa"] {
            let mut headers = HeaderMap::new();
            headers.insert("x-request-id", bad.parse().unwrap());
            let meta = canonicalize_request(&mut headers, &ctx());
            assert_ne!(meta.request_id, bad);
            assert!(uuid::Uuid::parse_str(&meta.request_id).is_ok());
        }
        // Length bounds are exact: 200 passes, 201 does not.
        let long = "a".repeat(201);
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", long.parse().unwrap());
        let meta = canonicalize_request(&mut headers, &ctx());
        assert!(uuid::Uuid::parse_str(&meta.request_id).is_ok());

        let max = "a".repeat(200);
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", max.parse().unwrap());
        let meta = canonicalize_request(&mut headers, &ctx());
        assert_eq!(meta.request_id, max);
    }

    #[test]
    fn response_upgrade_stripped_unless_switching() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, "websocket".parse().unwrap());
        canonicalize_response(&mut headers, StatusCode::OK);
        assert!(headers.get(UPGRADE).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, "websocket".parse().unwrap());
        canonicalize_response(&mut headers, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(header(&headers, "upgrade").unwrap(), "websocket");
    }

    #[test]
    fn sticky_cookie_is_stripped_from_forwarded_request() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            format!("a=1; {}=token; b=2", sticky::STICKY_COOKIE)
                .parse()
                .unwrap(),
        );
        strip_sticky_cookie(&mut headers);
        assert_eq!(header(&headers, "cookie").unwrap(), "a=1; b=2");

        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            format!("{}=token", sticky::STICKY_COOKIE).parse().unwrap(),
        );
        strip_sticky_cookie(&mut headers);
        assert!(headers.get(COOKIE).is_none());
    }

    #[tokio::test]
    async fn replay_body_releases_once() {
        let shared = ReplayShared::new(Full::new(Bytes::from_static(b"payload")));
        assert!(shared.intact());

        // An unpolled attempt leaves the body reusable.
        let first = shared.body();
        drop(first);
        assert!(shared.intact());

        let mut second = shared.body();
        let frame = Pin::new(&mut second)
            .frame()
            .await
            .unwrap()
            .unwrap()
            .into_data()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"payload"));
        assert!(!shared.intact(), "polling hands the body to the attempt");

        // Later attempts see an empty stream rather than a duplicate body.
        let mut third = shared.body();
        assert!(Pin::new(&mut third).frame().await.is_none());
    }

    #[test]
    fn error_responses_have_spec_statuses() {
        assert_eq!(service_unavailable().status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(not_found().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn forwarded_uri_keeps_raw_bytes() {
        let (parts, ()) = Request::builder()
            .method(Method::GET)
            .uri("/foo%2Fbar%20baz?q=%2F")
            .body(())
            .unwrap()
            .into_parts();
        let backend = Backend::new("svc", "127.0.0.1:9000".parse().unwrap());
        let shared: ReplayShared<Incoming> = ReplayShared {
            slot: Arc::new(Mutex::new(None)),
        };
        let forwarded = build_forwarded(&parts, &backend, shared.body()).unwrap();
        assert_eq!(
            forwarded.uri().to_string(),
            "http://127.0.0.1:9000/foo%2Fbar%20baz?q=%2F"
        );
        assert_eq!(forwarded.version(), Version::HTTP_11);
    }
}
