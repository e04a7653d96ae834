//! Client, user and endpoint key derivation.

use std::fmt;
use std::net::SocketAddr;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";

/// The address a request is attributed to.
///
/// Recomputed for every request from the best signal available: the first
/// hop of `X-Forwarded-For`, then `X-Real-IP`, then the peer address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Derive the client identity from request headers and the peer address.
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded = header_str(headers, FORWARDED_FOR)
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());

        if let Some(hop) = forwarded {
            return Self(hop.to_string());
        }

        if let Some(real_ip) = header_str(headers, REAL_IP).map(str::trim).filter(|v| !v.is_empty()) {
            return Self(real_ip.to_string());
        }

        match peer {
            Some(addr) => Self(addr.ip().to_string()),
            None => Self(UNKNOWN_CLIENT.to_string()),
        }
    }

    /// Get the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque, stable identity derived from a bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserIdentity(String);

impl UserIdentity {
    /// Derive a user identity from an `Authorization` header value.
    ///
    /// Returns `None` unless the value is a non-empty bearer credential.
    pub fn from_bearer(authorization: Option<&str>) -> Option<Self> {
        let value = authorization?.trim();
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let token = token.trim();
        if token.is_empty() {
            return None;
        }

        let digest = Sha256::digest(token.as_bytes());
        Some(Self(format!("user_{}", hex::encode(digest))))
    }

    /// Derive a user identity from request headers.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Self::from_bearer(header_str(headers, AUTHORIZATION.as_str()))
    }

    /// Get the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key for a per-endpoint window, scoped to one client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    /// The logical route
    pub endpoint: String,
    /// The client the window belongs to
    pub client_ip: String,
}

impl EndpointKey {
    /// Create a new endpoint key.
    pub fn new(endpoint: &str, client_ip: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client_ip: client_ip.to_string(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.client_ip)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
