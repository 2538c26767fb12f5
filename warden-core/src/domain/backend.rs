//! Backend server models.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A single upstream backend server.
///
/// Immutable once built; re-registering an application replaces its backends
/// wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    /// The `host:port` authority requests are forwarded to.
    pub addr: String,
    /// Relative share of traffic. Zero keeps the backend visible but never selected.
    pub weight: u32,
}

impl Backend {
    /// Builds a backend from a configured address, validating it.
    ///
    /// Accepts `host:port` or `http://host:port[/]`. `https://` addresses are
    /// rejected since the proxy speaks cleartext HTTP/1.1 to its backends.
    pub fn new(addr: &str, weight: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            addr: normalize_addr(addr)?,
            weight,
        })
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (weight {})", self.addr, self.weight)
    }
}

/// A thread-safe reference to a Backend.
pub type SharedBackend = Arc<Backend>;

/// A backend entry as written in an application document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Backend address.
    pub url: String,
    /// Relative weight; defaults to 1.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

fn normalize_addr(raw: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::InvalidBackend(raw.to_string());

    if raw.starts_with("https://") {
        return Err(invalid());
    }
    let authority = raw.strip_prefix("http://").unwrap_or(raw);
    let authority = authority.strip_suffix('/').unwrap_or(authority);

    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains('/') || port.parse::<u16>().is_err() {
        return Err(invalid());
    }
    Ok(authority.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_authority() {
        let backend = Backend::new("127.0.0.1:8080", 3).unwrap();
        assert_eq!(backend.addr, "127.0.0.1:8080");
        assert_eq!(backend.weight, 3);
    }

    #[test]
    fn test_http_prefix_is_stripped() {
        let backend = Backend::new("http://api.internal:9000/", 1).unwrap();
        assert_eq!(backend.addr, "api.internal:9000");
    }

    #[test]
    fn test_ipv6_authority() {
        let backend = Backend::new("[::1]:8080", 1).unwrap();
        assert_eq!(backend.addr, "[::1]:8080");
    }

    #[test]
    fn test_rejects_bad_addresses() {
        for raw in ["https://a:443", "localhost", ":80", "host:notaport", "a/b:80"] {
            assert!(Backend::new(raw, 1).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_config_weight_defaults_to_one() {
        let cfg: BackendConfig = serde_json::from_str(r#"{"url": "a:1"}"#).unwrap();
        assert_eq!(cfg.weight, 1);
    }
}
