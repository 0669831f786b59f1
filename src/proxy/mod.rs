//! Proxy server implementation
//!
//! This module provides the proxy functionality:
//! - Egress IP selection and validation
//! - CONNECT tunnels dialed from the egress address
//! - Plain HTTP forwarding with proxy headers stripped
//! - The `/health` and `/ips` endpoints

pub mod api;
pub mod egress;
pub mod forward;
pub mod handler;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use egress::EgressSelector;
pub use forward::{HttpForwarder, EGRESS_IP_HEADER, RATE_LIMIT_HEADER};
pub use handler::{ProxyHandler, ProxyHandlerConfig};
pub use server::ProxyServer;
pub use transport::EgressDialer;
pub use tunnel::TunnelHandler;
