//! X-Rate-Limit header parsing

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Default idle lifetime of a limiter when the directive gives none
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Limiting algorithm requested by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitMethod {
    #[default]
    TokenBucket,
    FixedWindow,
    /// Unrecognized name; limited as a token bucket
    #[serde(other)]
    Unknown,
}

impl LimitMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::FixedWindow => "fixed_window",
            Self::Unknown => "unknown",
        }
    }
}

/// What part of the destination a limiter is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    #[default]
    Domain,
    DomainPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub kind: ResourceKind,
}

/// A parsed `X-Rate-Limit` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitDirective {
    #[serde(default)]
    pub method: LimitMethod,
    /// Requests allowed per period
    pub rate: u32,
    /// Period length in seconds
    pub period: u32,
    /// Idle lifetime in seconds; zero or negative means the default
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub resource: Resource,
}

impl RateLimitDirective {
    /// Parse and validate the JSON header value
    pub fn parse(raw: &str) -> Result<Self> {
        let directive: Self = serde_json::from_str(raw)
            .map_err(|e| ProxyError::InvalidRateLimit(e.to_string()))?;

        if directive.rate == 0 {
            return Err(ProxyError::InvalidRateLimit(
                "rate must be greater than zero".to_string(),
            ));
        }
        if directive.period == 0 {
            return Err(ProxyError::InvalidRateLimit(
                "period must be greater than zero".to_string(),
            ));
        }

        Ok(directive)
    }

    pub fn ttl(&self) -> Duration {
        if self.ttl <= 0 {
            DEFAULT_TTL
        } else {
            Duration::from_secs(self.ttl as u64)
        }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.period))
    }
}

/// Build the resource key a limiter is scoped to
pub fn resource_key(host: &str, path: &str, kind: ResourceKind) -> String {
    match kind {
        ResourceKind::Domain => host.to_string(),
        ResourceKind::DomainPath => format!("{}{}", host, path),
    }
}
