//! Application documents and breaker tuning.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::backend::{Backend, BackendConfig};
use crate::domain::routing::{AppRoutes, RouteName};
use crate::error::ConfigError;
use crate::router::Router;

/// One application as described by a configuration document.
///
/// ```json
/// {
///   "name": "api",
///   "urls": ["/users/:id", "/users"],
///   "methods": ["GET", "POST"],
///   "backends": [{"url": "127.0.0.1:8080", "weight": 5}]
/// }
/// ```
///
/// `urls[i]` is served for `methods[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    /// Application name, matched against the request Host.
    pub name: String,
    /// URL patterns, paired by position with `methods`.
    #[serde(default)]
    pub urls: Vec<String>,
    /// HTTP methods, paired by position with `urls`.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Backends and their weights.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl AppConfig {
    /// Parses an application document.
    pub fn from_json(body: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(body)?)
    }

    /// Reads and parses an application document from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&body)
    }

    /// Validates the document and builds the router and balancer it describes.
    pub fn build_routes(&self) -> Result<AppRoutes, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if self.methods.len() != self.urls.len() {
            return Err(ConfigError::LengthMismatch {
                app: self.name.clone(),
                methods: self.methods.len(),
                urls: self.urls.len(),
            });
        }

        let mut router = Router::new();
        for (method, url) in self.methods.iter().zip(&self.urls) {
            router.handle(method, url, RouteName::from(url.as_str()))?;
        }

        let backends = self
            .backends
            .iter()
            .map(|b| Backend::new(&b.url, b.weight))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AppRoutes::new(router, backends))
    }
}

/// Circuit breaker tuning shared by every application of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Duration of one timeline bucket.
    pub bucket: Duration,
    /// Number of buckets in the sliding window.
    pub window: usize,
    /// Fewer outcomes than this in the window always keep the circuit closed.
    pub min_samples: u64,
    /// Error rate above which the circuit opens.
    pub open_threshold: f64,
    /// Probe error rate below which a half-open circuit closes.
    pub close_threshold: f64,
    /// How long an open circuit rejects everything before probing.
    pub cooldown: Duration,
    /// Probes admitted per half-open round.
    pub probe_quota: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            bucket: Duration::from_secs(1),
            window: 10,
            min_samples: 10,
            open_threshold: 0.5,
            close_threshold: 0.2,
            cooldown: Duration::from_secs(5),
            probe_quota: 3,
        }
    }
}

impl BreakerConfig {
    /// Checks that the values describe a usable breaker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.is_zero() {
            return Err(ConfigError::InvalidBreaker("bucket duration must be positive"));
        }
        if self.window == 0 {
            return Err(ConfigError::InvalidBreaker("window must hold at least one bucket"));
        }
        if !(0.0..=1.0).contains(&self.open_threshold) {
            return Err(ConfigError::InvalidBreaker("open threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.close_threshold) {
            return Err(ConfigError::InvalidBreaker("close threshold must be within [0, 1]"));
        }
        if self.cooldown < self.bucket {
            return Err(ConfigError::InvalidBreaker("cooldown must span at least one bucket"));
        }
        if self.probe_quota == 0 {
            return Err(ConfigError::InvalidBreaker("probe quota must be positive"));
        }
        Ok(())
    }

    pub(crate) fn bucket_ms(&self) -> u64 {
        self.bucket.as_millis() as u64
    }

    pub(crate) fn cooldown_ms(&self) -> u64 {
        self.cooldown.as_millis() as u64
    }
}

/// Reads every document in `paths`, failing on the first unreadable one.
///
/// Nothing is registered here; see [`crate::breaker::Breaker::register_all`].
pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<AppConfig>, ConfigError> {
    paths.iter().map(|path| AppConfig::load(path)).collect()
}
