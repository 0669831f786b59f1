use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProxyError, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Rate limiter store configuration
    pub rate_limit: RateLimitConfig,
    /// Path to the YAML file listing the egress interfaces
    pub config_path: String,
    /// Seconds to wait after a shutdown signal before draining
    pub shutdown_sleep_secs: u64,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Address the proxy listens on (default: 0.0.0.0:8080)
    pub listen_addr: SocketAddr,
    /// Connection timeout in seconds for outbound dials
    pub connect_timeout: u64,
    /// Seconds a client gets to send a complete request head
    pub header_read_timeout: u64,
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout.max(1))
    }
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            connect_timeout: 10,
            header_read_timeout: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// How often idle limiters are swept, in seconds
    pub sweep_interval: u64,
}

impl RateLimitConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { sweep_interval: 30 }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

/// Egress policy file contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressConfig {
    /// Network interface names whose addresses may be used for egress
    #[serde(default)]
    pub allowed_interfaces: Vec<String>,
}

impl EgressConfig {
    /// Load the egress policy from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&contents)?;

        info!(
            allowed_interfaces = ?config.allowed_interfaces,
            "Loaded egress config"
        );
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                listen_addr: parse_listen_addr(&get_env_or("LISTEN_ADDR", ":8080"))?,
                connect_timeout: get_env_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                header_read_timeout: get_env_or("PROXY_HEADER_READ_TIMEOUT", "5")
                    .parse()
                    .unwrap_or(5),
            },
            rate_limit: RateLimitConfig {
                sweep_interval: get_env_or("RATE_LIMIT_SWEEP_INTERVAL", "30")
                    .parse()
                    .unwrap_or(30),
            },
            config_path: get_env_or("CONFIG_PATH", "config.yaml"),
            shutdown_sleep_secs: get_env_or("SHUTDOWN_SLEEP_SEC", "0").parse().unwrap_or(0),
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }
}

/// Parse a listen address, accepting the `:port` shorthand for all interfaces
fn parse_listen_addr(raw: &str) -> Result<SocketAddr> {
    let raw = raw.trim();
    let full = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };

    full.parse().map_err(|_| {
        ProxyError::Config(format!("LISTEN_ADDR must be host:port or :port, got {:?}", raw))
    })
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "LISTEN_ADDR",
        "PROXY_CONNECT_TIMEOUT",
        "PROXY_HEADER_READ_TIMEOUT",
        "RATE_LIMIT_SWEEP_INTERVAL",
        "CONFIG_PATH",
        "SHUTDOWN_SLEEP_SEC",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.proxy.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.proxy.header_read_timeout(), Duration::from_secs(5));
        assert_eq!(config.rate_limit.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.config_path, "config.yaml");
        assert_eq!(config.shutdown_sleep_secs, 0);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("LISTEN_ADDR", "127.0.0.1:9000");
        env::set_var("CONFIG_PATH", "/etc/specificproxy.yaml");
        env::set_var("SHUTDOWN_SLEEP_SEC", "15");
        env::set_var("PROXY_CONNECT_TIMEOUT", "3");
        env::set_var("PROXY_HEADER_READ_TIMEOUT", "2");

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.listen_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.config_path, "/etc/specificproxy.yaml");
        assert_eq!(config.shutdown_sleep_secs, 15);
        assert_eq!(config.proxy.connect_timeout, 3);
        assert_eq!(config.proxy.header_read_timeout, 2);
    }

    #[test]
    fn test_config_from_env_bad_shutdown_sleep_falls_back() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SHUTDOWN_SLEEP_SEC", "soon");
        let config = Config::from_env().unwrap();
        assert_eq!(config.shutdown_sleep_secs, 0);
    }

    #[test]
    fn test_config_from_env_invalid_listen_addr() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("LISTEN_ADDR", "not-an-addr");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn test_parse_listen_addr_port_shorthand() {
        assert_eq!(
            parse_listen_addr(":3128").unwrap(),
            "0.0.0.0:3128".parse().unwrap()
        );
        assert_eq!(parse_listen_addr("[::1]:80").unwrap(), "[::1]:80".parse().unwrap());
    }

    #[test]
    fn test_egress_config_from_yaml() {
        let config = EgressConfig::from_yaml("allowed_interfaces:\n  - eth0\n  - eth1\n").unwrap();
        assert_eq!(config.allowed_interfaces, vec!["eth0", "eth1"]);
    }

    #[test]
    fn test_egress_config_missing_key_is_empty() {
        let config = EgressConfig::from_yaml("{}").unwrap();
        assert!(config.allowed_interfaces.is_empty());
    }

    #[test]
    fn test_egress_config_invalid_yaml() {
        let err = EgressConfig::from_yaml("allowed_interfaces: [eth0").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }

    #[test]
    fn test_egress_config_from_file() {
        let path = env::temp_dir().join(format!("specificproxy-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"allowed_interfaces: [lo]\n").unwrap();

        let config = EgressConfig::from_file(&path).unwrap();
        assert_eq!(config.allowed_interfaces, vec!["lo"]);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_egress_config_missing_file() {
        let err = EgressConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
