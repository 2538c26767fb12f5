//! Error types shared by the admission pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// A malformed or inconsistent configuration.
///
/// Configuration errors are fatal at startup: nothing from a document that fails
/// validation is ever registered.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid JSON for an application description.
    #[error("failed to parse application config: {0}")]
    Parse(#[from] serde_json::Error),

    /// The application has an empty name.
    #[error("application name must not be empty")]
    EmptyName,

    /// `methods` and `urls` are not paired one to one.
    #[error("application {app}: methods and urls must have the same length (got {methods} methods, {urls} urls)")]
    LengthMismatch {
        /// Application being validated.
        app: String,
        /// Number of methods in the document.
        methods: usize,
        /// Number of URL patterns in the document.
        urls: usize,
    },

    /// A method name is empty or contains characters outside the HTTP token set.
    #[error("invalid http method {0:?}")]
    InvalidMethod(String),

    /// A URL pattern cannot be parsed.
    #[error("invalid url pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The same method and pattern were registered twice for one application.
    #[error("duplicate route {method} {pattern}")]
    DuplicateRoute {
        /// Normalized method.
        method: String,
        /// The repeated pattern.
        pattern: String,
    },

    /// A backend address is not a usable `host:port` authority.
    #[error("invalid backend address {0:?}")]
    InvalidBackend(String),

    /// Breaker tuning values are out of range.
    #[error("invalid breaker config: {0}")]
    InvalidBreaker(&'static str),
}

/// No usable backend is configured for an application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalancerError {
    /// Every backend is missing or carries a zero weight.
    #[error("no backend with a positive weight is configured")]
    Exhausted,
}

/// Why a request was not admitted to a backend.
///
/// Every variant is recoverable and maps onto a deterministic status code; none of
/// them results in a backend call or a timeline write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The Host header names no registered application.
    #[error("no application registered for host {0:?}")]
    UnknownHost(String),

    /// No route of the application matches the path.
    #[error("no route matches {path}")]
    RouteMiss {
        /// The requested path.
        path: String,
    },

    /// The path matches a route registered under other methods.
    #[error("method {method} not allowed for {path}")]
    MethodMiss {
        /// The requested method.
        method: String,
        /// The requested path.
        path: String,
        /// Methods that would have matched, sorted.
        allowed: Vec<String>,
    },

    /// The circuit for the application is open.
    #[error("circuit open for application {app}")]
    Rejected {
        /// Application whose circuit rejected the request.
        app: String,
        /// Milliseconds until the circuit may let probes through again.
        retry_after_ms: u64,
    },

    /// The application has no selectable backend.
    #[error("application {app}: {source}")]
    Exhausted {
        /// Application without backends.
        app: String,
        /// The balancer failure.
        #[source]
        source: BalancerError,
    },
}

impl AdmissionError {
    /// The HTTP status code this rejection is answered with.
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::UnknownHost(_)
            | AdmissionError::RouteMiss { .. }
            | AdmissionError::Exhausted { .. } => 404,
            AdmissionError::MethodMiss { .. } => 405,
            AdmissionError::Rejected { .. } => 429,
        }
    }
}
