//! Client key resolution for slow-down accounting.

use crate::error::{SlowDownError, SlowDownResult};
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, Method, Uri};
use std::net::SocketAddr;

/// Multi-hop proxy chain header.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Legacy CGI-style remote address header.
pub const REMOTE_ADDR_HEADER: &str = "remote_addr";

/// Snapshot of the request metadata the slow-down strategies look at.
///
/// Captured before the request is handed downstream so that the skip
/// predicate can still inspect it once the response is back.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestInfo {
    pub fn from_request(request: &Request) -> Self {
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
            .or_else(|| request.extensions().get::<SocketAddr>().copied());

        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            remote_addr,
        }
    }

    /// Non-empty UTF-8 value of a header, verbatim.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
    }
}

/// Strategy for deriving the key that partitions request counters.
pub trait KeyGenerator: Send + Sync {
    fn generate_key(&self, request: &RequestInfo) -> SlowDownResult<String>;
}

impl<F> KeyGenerator for F
where
    F: Fn(&RequestInfo) -> SlowDownResult<String> + Send + Sync,
{
    fn generate_key(&self, request: &RequestInfo) -> SlowDownResult<String> {
        self(request)
    }
}

/// Default key generator: identifies clients by address.
///
/// Checks, in order, `X-Forwarded-For`, `REMOTE_ADDR` and the transport
/// peer address. Header values are used as-is, so a proxy chain such as
/// `"1.1.1.1, 10.0.0.1"` is one key.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpKeyGenerator;

impl KeyGenerator for ClientIpKeyGenerator {
    fn generate_key(&self, request: &RequestInfo) -> SlowDownResult<String> {
        resolve_client_ip(request)
    }
}

pub fn resolve_client_ip(request: &RequestInfo) -> SlowDownResult<String> {
    if let Some(forwarded) = request.header(FORWARDED_FOR_HEADER) {
        return Ok(forwarded.to_string());
    }

    if let Some(remote_addr) = request.header(REMOTE_ADDR_HEADER) {
        return Ok(remote_addr.to_string());
    }

    request
        .remote_addr
        .map(|addr| addr.ip().to_string())
        .ok_or_else(|| SlowDownError::KeyResolution("unable to get client ip".to_string()))
}
