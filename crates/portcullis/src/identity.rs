//! Client identity resolution and hashing.
//!
//! Raw client addresses are reduced to a salted SHA-256 digest before they
//! touch any store or log line.

use axum::http::HeaderMap;
use portcullis_common::IdentityHash;
use portcullis_common::constants::{CANONICAL_LOOPBACK, headers};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;

/// Derives stable, non-reversible identity keys from raw client addresses
#[derive(Clone)]
pub struct IdentityHasher {
    secret: String,
}

impl std::fmt::Debug for IdentityHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityHasher").finish_non_exhaustive()
    }
}

impl IdentityHasher {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Hasher with a random per-process secret.
    ///
    /// Hashes change on restart, so existing records stop matching.
    pub fn ephemeral() -> Self {
        use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
        use rand::Rng;

        let mut bytes = [0u8; 32];
        rand::rng().fill(&mut bytes);
        tracing::warn!("Using ephemeral identity hash secret (records will not survive restart)");
        Self::new(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Hash a raw identity. Never fails; the empty string hashes too.
    pub fn hash(&self, raw_identity: &str) -> IdentityHash {
        let normalized = normalize(raw_identity);

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update(self.secret.as_bytes());

        IdentityHash::from_digest(hex::encode(hasher.finalize()))
    }
}

/// Trim and collapse IPv4/IPv6 loopback to one canonical form
fn normalize(raw: &str) -> &str {
    match raw.trim() {
        "::1" | "127.0.0.1" => CANONICAL_LOOPBACK,
        other => other,
    }
}

/// Resolve the caller's address for a request.
///
/// With `trust_proxy_headers`, `Client-IP` wins, then the first hop of
/// `X-Forwarded-For`, then the socket peer. These headers are client
/// controlled unless a proxy overwrites them.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    trust_proxy_headers: bool,
) -> Option<String> {
    if trust_proxy_headers {
        if let Some(ip) = header_str(headers, headers::CLIENT_IP) {
            return Some(ip.to_string());
        }

        if let Some(forwarded) = header_str(headers, headers::X_FORWARDED_FOR) {
            if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
                return Some(first.to_string());
            }
        }
    }

    remote_addr.map(|addr| addr.ip().to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
