//! Per-request gatekeeping ahead of route lookup
//!
//! Order of work for each request:
//! 1. resolve the client address
//! 2. deny it outright if blacklisted
//! 3. find a bearer token (auth header, then cookie) and verify it
//! 4. rewrite trust headers for the upstream
//!
//! Nothing here blocks: the blacklist is an in-memory lookup (the static
//! set is re-read at most once per refresh window, even when its source
//! fails) and token verification is pure computation.

use anyhow::{Context, Result};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, COOKIE, REFERER};
use hyper::{Body, HeaderMap, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::blacklist::BlacklistRegistry;
use crate::client_ip::{resolve_client_ip, ClientIpConfig, IpSource};
use crate::proxy::sanitize_header_value;
use crate::token::{TokenVerdict, TokenVerifier};

pub const EXPIRED_ANONYMOUS: &str = "anonymous:expired";
pub const INVALID_ANONYMOUS: &str = "anonymous:invalid";

const DENY_BODY: &str = r#"{"success":false,"message":"Access denied"}"#;

#[derive(Debug, Clone)]
pub struct AuthFilterConfig {
    /// Header carrying "Bearer <token>"
    pub auth_header: String,
    /// Cookie consulted when the auth header is absent
    pub token_cookie: String,
    /// Header the upstream trusts for the caller's identity
    pub identity_header: String,
    /// Hop marker appended to the forwarded-for and referer chains
    pub gateway_marker: String,
    pub client_ip: ClientIpConfig,
}

impl Default for AuthFilterConfig {
    fn default() -> Self {
        Self {
            auth_header: "Authorization".to_string(),
            token_cookie: "access_token".to_string(),
            identity_header: "X-User-Id".to_string(),
            gateway_marker: "aegis-gateway".to_string(),
            client_ip: ClientIpConfig::default(),
        }
    }
}

/// Who the request claims to be after token verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Verified(String),
    ExpiredAnonymous,
    InvalidAnonymous,
    /// No token presented
    Anonymous,
}

impl Identity {
    /// Value injected into the identity header; `None` leaves it unset
    pub fn header_value(&self) -> Option<&str> {
        match self {
            Identity::Verified(subject) => Some(subject.as_str()),
            Identity::ExpiredAnonymous => Some(EXPIRED_ANONYMOUS),
            Identity::InvalidAnonymous => Some(INVALID_ANONYMOUS),
            Identity::Anonymous => None,
        }
    }

    pub fn subject(&self) -> Option<&str> {
        match self {
            Identity::Verified(subject) => Some(subject.as_str()),
            _ => None,
        }
    }
}

/// Request-scoped gatekeeping result, carried in the forwarded request's
/// extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: String,
    pub ip_source: IpSource,
    pub identity: Identity,
}

pub enum FilterOutcome {
    Forward(Request<Body>),
    Deny(Response<Body>),
}

pub struct EdgeAuthFilter {
    config: AuthFilterConfig,
    auth_header: HeaderName,
    identity_header: HeaderName,
    proxy_header: HeaderName,
    forwarded_for_header: HeaderName,
    blacklist: Arc<BlacklistRegistry>,
    verifier: Option<TokenVerifier>,
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes()).with_context(|| format!("Invalid header name: {}", name))
}

impl EdgeAuthFilter {
    pub fn new(
        config: AuthFilterConfig,
        blacklist: Arc<BlacklistRegistry>,
        verifier: Option<TokenVerifier>,
    ) -> Result<Self> {
        if verifier.is_none() {
            warn!("No token verification key configured; presented tokens will be treated as invalid");
        }
        Ok(Self {
            auth_header: header_name(&config.auth_header)?,
            identity_header: header_name(&config.identity_header)?,
            proxy_header: header_name(&config.client_ip.proxy_header)?,
            forwarded_for_header: header_name(&config.client_ip.forwarded_for_header)?,
            config,
            blacklist,
            verifier,
        })
    }

    pub fn blacklist(&self) -> &Arc<BlacklistRegistry> {
        &self.blacklist
    }

    pub async fn filter(&self, mut req: Request<Body>, peer: SocketAddr) -> FilterOutcome {
        let client = resolve_client_ip(req.headers(), peer, &self.config.client_ip);

        if let Some(rule) = self.blacklist.contains(&client.ip).await {
            warn!(
                "Denied request from blacklisted IP {} (rule: {}) {} {}",
                client.ip,
                rule,
                req.method(),
                req.uri().path()
            );
            return FilterOutcome::Deny(deny_response());
        }

        let identity = match self.extract_token(req.headers()) {
            None => Identity::Anonymous,
            Some(token) => self.verify(&token),
        };
        debug!("Client {} ({:?}) identity {:?}", client.ip, client.source, identity);

        self.rewrite_headers(req.headers_mut(), &client.ip, &identity);
        req.extensions_mut().insert(RequestContext {
            client_ip: client.ip,
            ip_source: client.source,
            identity,
        });

        FilterOutcome::Forward(req)
    }

    fn verify(&self, token: &str) -> Identity {
        let Some(verifier) = &self.verifier else {
            return Identity::InvalidAnonymous;
        };
        match verifier.verify(token) {
            TokenVerdict::Valid(subject) => Identity::Verified(subject),
            TokenVerdict::Expired => Identity::ExpiredAnonymous,
            TokenVerdict::Invalid => Identity::InvalidAnonymous,
        }
    }

    /// Bearer token from the auth header, else from the token cookie
    fn extract_token(&self, headers: &HeaderMap) -> Option<String> {
        let from_header = headers
            .get(&self.auth_header)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                let v = v.trim();
                let (scheme, token) = v.split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
            .filter(|t| !t.is_empty());
        if let Some(token) = from_header {
            return Some(token.to_string());
        }

        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, value)| *name == self.config.token_cookie && !value.is_empty())
            .map(|(_, value)| value.to_string())
    }

    fn rewrite_headers(&self, headers: &mut HeaderMap, client_ip: &str, identity: &Identity) {
        let marker = &self.config.gateway_marker;

        // Inbound identity is spoofable
        headers.remove(&self.identity_header);
        if let Some(value) = identity.header_value() {
            set_header(headers, self.identity_header.clone(), value);
        }

        let chain = match headers.get(&self.forwarded_for_header).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.trim().is_empty() => format!("{}, {}", existing.trim(), marker),
            _ => format!("{}, {}", client_ip, marker),
        };
        set_header(headers, self.forwarded_for_header.clone(), &chain);

        if !headers.contains_key(&self.proxy_header) {
            set_header(headers, self.proxy_header.clone(), client_ip);
        }

        if let Some(referer) = headers.get(REFERER).and_then(|v| v.to_str().ok()) {
            let referer = format!("{},{}", referer, marker);
            set_header(headers, REFERER, &referer);
        }
    }
}

fn set_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(&sanitize_header_value(value)) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!("Dropping unencodable value for header {}: {}", name, e),
    }
}

fn deny_response() -> Response<Body> {
    let mut response = Response::new(Body::from(DENY_BODY));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
