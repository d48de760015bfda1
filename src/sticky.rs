//! Sticky-session cookie.
//!
//! The cookie value is an opaque token binding a client to one backend of
//! one service: `base64url(backend_id ‖ HMAC-SHA256(secret, service ‖ 0 ‖
//! backend_id))`. Including the service in the MAC keys a token to the
//! service that issued it, so a cookie captured on one service cannot be
//! replayed against another. Instances sharing the secret accept each
//! other's cookies.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use http::header::{HeaderMap, COOKIE};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Fixed cookie name.
pub const STICKY_COOKIE: &str = "_backend_id";

/// Backend ids are hex md5, 32 bytes of ASCII.
const BACKEND_ID_LEN: usize = 32;
const MAC_LEN: usize = 32;

/// Seals and opens sticky tokens with a shared secret.
pub struct CookieSealer {
    secret: Vec<u8>,
}

impl CookieSealer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Generate a random secret. Cookies sealed with it die with the
    /// process; multi-instance deployments must configure a shared one.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    fn mac(&self, service: &str, backend_id: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(service.as_bytes());
        mac.update(&[0]);
        mac.update(backend_id.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Produce the cookie value for a backend of a service.
    pub fn seal(&self, service: &str, backend_id: &str) -> String {
        let mut raw = Vec::with_capacity(backend_id.len() + MAC_LEN);
        raw.extend_from_slice(backend_id.as_bytes());
        raw.extend_from_slice(&self.mac(service, backend_id));
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Verify a cookie value, returning the backend id it names. Tokens
    /// with a bad MAC, the wrong shape, or minted for another service are
    /// rejected.
    pub fn open(&self, service: &str, token: &str) -> Option<String> {
        let raw = URL_SAFE_NO_PAD.decode(token).ok()?;
        if raw.len() != BACKEND_ID_LEN + MAC_LEN {
            return None;
        }
        let (id_bytes, tag) = raw.split_at(BACKEND_ID_LEN);
        let backend_id = std::str::from_utf8(id_bytes).ok()?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("hmac accepts any key length");
        mac.update(service.as_bytes());
        mac.update(&[0]);
        mac.update(backend_id.as_bytes());
        mac.verify_slice(tag).ok()?;

        Some(backend_id.to_string())
    }
}

/// Extract the sticky cookie value from request headers, if present.
/// Headers that fail string conversion are skipped, not fatal.
pub fn cookie_value(headers: &HeaderMap) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix(STICKY_COOKIE) {
                if let Some(value) = value.strip_prefix('=') {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Build the `Set-Cookie` header value binding a client to a backend.
pub fn set_cookie(token: &str, secure: bool) -> String {
    let mut cookie = format!("{STICKY_COOKIE}={token}; Path=/; HttpOnly");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
