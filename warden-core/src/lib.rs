//! Warden Core functionality.
//!
//! This crate contains the request-admission pipeline behind the Warden reverse
//! proxy: the per-application [`router`], the outcome [`timeline`], the
//! [`circuit`] state derived from it, the weighted round-robin
//! [`load_balancer`], and the [`breaker`] registry tying them together.
//!
//! Nothing in here performs I/O on the request path; forwarding and serving
//! live in `warden-proxy`.

pub mod breaker;
pub mod circuit;
pub mod config;
pub mod domain;
pub mod error;
pub mod load_balancer;
pub mod router;
pub mod timeline;

pub use breaker::{Application, Breaker, Ticket};
pub use circuit::CircuitState;
pub use config::{AppConfig, BreakerConfig};
pub use error::{AdmissionError, BalancerError, ConfigError};
pub use timeline::{Counter, Outcome, Timeline};
