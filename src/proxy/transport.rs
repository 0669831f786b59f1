//! Outbound transport pinned to a local egress address
//!
//! Every destination connection, tunneled or forwarded, is dialed from the
//! egress IP chosen for the request.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hyper::Uri;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, instrument};

use crate::error::{ProxyError, Result};

/// Default timeout for establishing a destination connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP dialer whose local address is fixed to one egress IP
#[derive(Debug, Clone, Copy)]
pub struct EgressDialer {
    local: IpAddr,
    connect_timeout: Duration,
}

impl EgressDialer {
    pub fn new(local: IpAddr, connect_timeout: Duration) -> Self {
        Self {
            local,
            connect_timeout,
        }
    }

    pub fn local_ip(&self) -> IpAddr {
        self.local
    }

    /// Connect to `host:port` from the egress address
    ///
    /// Only destination addresses of the egress IP's family are tried.
    #[instrument(skip(self), fields(egress_ip = %self.local))]
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let target = format_tcp_addr(host, port);

        tokio::time::timeout(self.connect_timeout, self.connect_any(&target))
            .await
            .map_err(|_| {
                ProxyError::UpstreamUnavailable(format!(
                    "connect to {} timed out after {}s",
                    target,
                    self.connect_timeout.as_secs()
                ))
            })?
    }

    async fn connect_any(&self, target: &str) -> Result<TcpStream> {
        let candidates: Vec<SocketAddr> = lookup_host(target)
            .await
            .map_err(|e| {
                ProxyError::UpstreamUnavailable(format!("failed to resolve {}: {}", target, e))
            })?
            .filter(|addr| addr.is_ipv4() == self.local.is_ipv4())
            .collect();

        if candidates.is_empty() {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "no IPv{} address for {}",
                if self.local.is_ipv4() { 4 } else { 6 },
                target
            )));
        }

        let mut last_error = None;
        for addr in candidates {
            match self.connect_one(addr).await {
                Ok(stream) => {
                    debug!(remote = %addr, "Connected to destination");
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(remote = %addr, error = %e, "Dial attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(ProxyError::UpstreamUnavailable(format!(
            "dial {} from {}: {}",
            target,
            self.local,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".to_string())
        )))
    }

    async fn connect_one(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        let socket = match self.local {
            IpAddr::V4(_) => TcpSocket::new_v4()?,
            IpAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(SocketAddr::new(self.local, 0))?;
        socket.connect(remote).await
    }
}

/// Parse host and port from an absolute-form URI
pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest("missing host in URI".to_string()))?
        .to_string();

    let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });

    Ok((host, port))
}

/// Parse host and port from authority (for CONNECT requests)
pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
    if authority.is_empty() {
        return Err(ProxyError::InvalidRequest("missing CONNECT target".to_string()));
    }

    // Bracketed IPv6 without a port
    if authority.ends_with(']') {
        return Ok((authority.to_string(), 443));
    }

    if let Some((host, port_str)) = authority.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidRequest(format!("invalid port in {}", authority)))?;
        Ok((host.to_string(), port))
    } else {
        // Default to port 443 for CONNECT (typically HTTPS)
        Ok((authority.to_string(), 443))
    }
}

fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
