//! Proxy request dispatcher
//!
//! Resolves the egress IP, applies the optional rate limit, then hands the
//! request to the tunnel or the forwarder.

use std::error::Error as StdError;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::IntoResponse;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response};
use rustls::ClientConfig;
use tracing::{debug, error, instrument, warn};

use crate::error::{ProxyError, Result};
use crate::proxy::egress::EgressSelector;
use crate::proxy::forward::{
    default_tls_config, HttpForwarder, EGRESS_IP_HEADER, RATE_LIMIT_HEADER,
};
use crate::proxy::transport::{parse_authority, EgressDialer, DEFAULT_CONNECT_TIMEOUT};
use crate::proxy::tunnel::TunnelHandler;
use crate::ratelimit::{resource_key, RateLimitDirective, RateLimiterStore};

/// Configuration for proxy handler
#[derive(Clone)]
pub struct ProxyHandlerConfig {
    /// Timeout for destination connections
    pub connect_timeout: Duration,
    /// TLS client settings for `https` destinations
    pub tls: Arc<ClientConfig>,
}

impl Default for ProxyHandlerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: default_tls_config(),
        }
    }
}

/// Proxy request handler
pub struct ProxyHandler {
    egress: EgressSelector,
    store: Arc<RateLimiterStore>,
    forwarder: HttpForwarder,
    connect_timeout: Duration,
}

impl ProxyHandler {
    pub fn new(
        egress: EgressSelector,
        store: Arc<RateLimiterStore>,
        config: ProxyHandlerConfig,
    ) -> Self {
        Self {
            egress,
            store,
            forwarder: HttpForwarder::new(config.tls),
            connect_timeout: config.connect_timeout,
        }
    }

    /// CONNECT requests and absolute-form targets are proxied; anything else
    /// is addressed to the proxy itself
    pub fn is_proxy_request<B>(req: &Request<B>) -> bool {
        req.method() == Method::CONNECT || req.uri().authority().is_some()
    }

    /// Handle an incoming proxy request
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_server_error() {
                    error!("Request handling error: {}", e);
                } else {
                    debug!("Request rejected: {}", e);
                }
                e.into_response()
            }
        }
    }

    async fn dispatch<B>(&self, req: Request<B>) -> Result<Response<Body>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let requested = req
            .headers()
            .get(EGRESS_IP_HEADER)
            .map(|value| {
                value
                    .to_str()
                    .map_err(|_| ProxyError::InvalidEgressIp("non-ASCII value".to_string()))
            })
            .transpose()?;
        let egress_ip = self.egress.resolve(requested)?;

        self.check_rate_limit(&req, egress_ip)?;

        let dialer = EgressDialer::new(egress_ip, self.connect_timeout);
        if req.method() == Method::CONNECT {
            self.handle_connect(req, dialer).await
        } else {
            debug!(egress_ip = %egress_ip, "Handling HTTP proxy request");
            self.forwarder.forward(&dialer, req).await
        }
    }

    /// Apply the `X-Rate-Limit` directive, if any
    fn check_rate_limit<B>(&self, req: &Request<B>, egress_ip: IpAddr) -> Result<()> {
        let Some(raw) = req.headers().get(RATE_LIMIT_HEADER) else {
            return Ok(());
        };
        let raw = raw
            .to_str()
            .map_err(|_| ProxyError::InvalidRateLimit("non-ASCII value".to_string()))?;
        if raw.trim().is_empty() {
            return Ok(());
        }

        let directive = RateLimitDirective::parse(raw)?;
        let (host, path) = request_resource(req);
        let resource = resource_key(&host, path, directive.resource.kind);

        let limiter = self.store.get_or_create(egress_ip, &resource, &directive);
        if !limiter.allow() {
            warn!(
                egress_ip = %egress_ip,
                resource = %resource,
                method = directive.method.as_str(),
                "Rate limit exceeded"
            );
            return Err(ProxyError::RateLimited);
        }

        Ok(())
    }

    /// Handle HTTP CONNECT request (HTTPS tunneling)
    async fn handle_connect<B>(
        &self,
        mut req: Request<B>,
        dialer: EgressDialer,
    ) -> Result<Response<Body>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());
        let (host, port) = parse_authority(&authority)?;

        debug!(
            host = %authority,
            egress_ip = %dialer.local_ip(),
            "Handling CONNECT request"
        );

        // Don't respond 200 until the destination is reachable
        let server = TunnelHandler::connect(&dialer, &host, port)
            .await
            .inspect_err(|e| error!(host = %authority, "Failed to connect to target: {}", e))?;

        let on_upgrade = req
            .extensions_mut()
            .remove::<OnUpgrade>()
            .ok_or(ProxyError::UpgradeUnsupported)?;

        tokio::spawn(TunnelHandler::serve(on_upgrade, server, authority));

        let mut response = Response::new(Body::empty());
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        Ok(response)
    }
}

/// Destination host (with port, if given) and path used for resource keys
///
/// CONNECT targets have no path.
fn request_resource<B>(req: &Request<B>) -> (String, &str) {
    let host = req
        .uri()
        .authority()
        .map(|a| a.as_str().rsplit('@').next().unwrap_or_default().to_string())
        .or_else(|| {
            req.headers()
                .get(hyper::header::HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();

    let path = if req.method() == Method::CONNECT {
        ""
    } else {
        req.uri().path()
    };

    (host, path)
}
