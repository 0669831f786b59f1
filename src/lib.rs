//! Specificproxy - Egress-Pinned Forward Proxy
//!
//! An HTTP/HTTPS forward proxy that lets each client pick the local IP its
//! outbound connections originate from.
//!
//! ## Features
//!
//! - `X-Egress-IP` selection restricted to addresses on allowed interfaces
//! - Random egress selection when no address is requested
//! - Per-request `X-Rate-Limit` directives (token bucket or fixed window)
//! - CONNECT tunneling and plain HTTP forwarding
//! - `/health` and `/ips` endpoints

pub mod config;
pub mod error;
pub mod interfaces;
pub mod proxy;
pub mod ratelimit;

pub use config::{Config, EgressConfig};
pub use error::{ProxyError, Result};
pub use interfaces::{EgressAddress, EgressPolicy, InterfacePolicy, StaticPolicy};
