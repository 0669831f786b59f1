//! Egress IP selection
//!
//! Validates a client-requested egress address, or picks one at random from
//! the currently permitted set.

use std::net::IpAddr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::interfaces::EgressPolicy;

/// Resolves the local address used for one outbound connection
#[derive(Clone)]
pub struct EgressSelector {
    policy: Arc<dyn EgressPolicy>,
}

impl EgressSelector {
    pub fn new(policy: Arc<dyn EgressPolicy>) -> Self {
        Self { policy }
    }

    /// Resolve the egress address for a request
    ///
    /// `requested` is the raw `X-Egress-IP` value; `None` or an empty value
    /// selects uniformly at random among permitted addresses.
    pub fn resolve(&self, requested: Option<&str>) -> Result<IpAddr> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => self.validate(raw),
            None => self.pick_random(),
        }
    }

    fn validate(&self, raw: &str) -> Result<IpAddr> {
        let ip: IpAddr = raw
            .parse()
            .map_err(|_| ProxyError::InvalidEgressIp(raw.to_string()))?;

        if !self.policy.is_allowed(ip) {
            warn!(egress_ip = %ip, "Requested egress IP is not allowed");
            return Err(ProxyError::EgressNotAllowed(ip));
        }

        Ok(ip)
    }

    fn pick_random(&self) -> Result<IpAddr> {
        let addresses = self.policy.available()?;

        let mut rng = rand::thread_rng();
        let chosen = addresses
            .choose(&mut rng)
            .ok_or(ProxyError::NoEgressAvailable)?;

        debug!(
            egress_ip = %chosen.ip,
            interface = %chosen.interface,
            "Randomly selected egress IP"
        );
        Ok(chosen.ip)
    }
}
