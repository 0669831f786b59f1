//! Plain HTTP forwarding
//!
//! Replays a proxied request against its destination over a connection
//! dialed from the egress address, and streams the response back.

use std::error::Error as StdError;
use std::sync::Arc;

use axum::body::Body;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, instrument};

use crate::error::{ProxyError, Result};
use crate::proxy::transport::{parse_target, EgressDialer};

/// Header naming the requested egress IP
pub const EGRESS_IP_HEADER: &str = "x-egress-ip";
/// Header carrying the JSON rate-limit directive
pub const RATE_LIMIT_HEADER: &str = "x-rate-limit";

/// Headers that only concern the connection to the proxy
const PROXY_CONTROL_HEADERS: [&str; 4] = [
    EGRESS_IP_HEADER,
    RATE_LIMIT_HEADER,
    "proxy-connection",
    "proxy-authorization",
];

/// Hop-by-hop headers that must not be forwarded
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// TLS client config trusting the Mozilla root set
pub fn default_tls_config() -> Arc<ClientConfig> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Forwards non-CONNECT proxy requests
#[derive(Clone)]
pub struct HttpForwarder {
    tls: TlsConnector,
}

impl HttpForwarder {
    pub fn new(tls: Arc<ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::from(tls),
        }
    }

    /// Perform the round trip from the egress address
    ///
    /// `https` targets are wrapped in TLS on top of the egress-bound socket.
    #[instrument(skip(self, dialer, req), fields(egress_ip = %dialer.local_ip(), uri = %req.uri()))]
    pub async fn forward<B>(&self, dialer: &EgressDialer, req: Request<B>) -> Result<Response<Body>>
    where
        B: hyper::body::Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let uri = req.uri().clone();
        let (host, port) = parse_target(&uri)?;
        let outbound = prepare_outbound(req)?;

        let stream = dialer.connect(&host, port).await?;

        let response = if uri.scheme_str() == Some("https") {
            let server_name = server_name(&host)?;
            let tls_stream = self.tls.connect(server_name, stream).await.map_err(|e| {
                error!(host = %host, error = %e, "TLS handshake failed");
                ProxyError::UpstreamUnavailable(format!("TLS handshake with {} failed: {}", host, e))
            })?;
            send_request(tls_stream, outbound).await?
        } else {
            send_request(stream, outbound).await?
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        debug!(status = %parts.status, "Destination responded");
        Ok(Response::from_parts(parts, Body::new(body)))
    }
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new(default_tls_config())
    }
}

/// Run one HTTP/1.1 exchange over an established destination stream
async fn send_request<T, B>(io: T, req: Request<B>) -> Result<Response<Incoming>>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable(format!("handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Destination connection ended: {}", e);
        }
    });

    sender.send_request(req).await.map_err(|e| {
        error!(error = %e, "Proxy request failed");
        ProxyError::UpstreamUnavailable(format!("proxy request failed: {}", e))
    })
}

/// SNI name for a URI host; IPv6 literals lose their brackets
fn server_name(host: &str) -> Result<ServerName<'static>> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(bare.to_string())
        .map_err(|_| ProxyError::InvalidRequest(format!("invalid TLS server name {}", host)))
}

/// Rewrite an absolute-form proxy request into an origin-form request
fn prepare_outbound<B>(req: Request<B>) -> Result<Request<B>> {
    let (mut parts, body) = req.into_parts();

    if !parts.headers.contains_key(HOST) {
        let authority = parts
            .uri
            .authority()
            .ok_or_else(|| ProxyError::InvalidRequest("missing host in URI".to_string()))?;
        let host = match authority.port() {
            Some(port) => format!("{}:{}", authority.host(), port),
            None => authority.host().to_string(),
        };
        let value = HeaderValue::from_str(&host)
            .map_err(|_| ProxyError::InvalidRequest(format!("invalid host {}", host)))?;
        parts.headers.insert(HOST, value);
    }

    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path);

    strip_proxy_headers(&mut parts.headers);

    Ok(Request::from_parts(parts, body))
}

/// Remove everything that would reveal the request was routed through us
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    for name in PROXY_CONTROL_HEADERS {
        headers.remove(name);
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}
