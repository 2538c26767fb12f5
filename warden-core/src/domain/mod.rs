//! Domain models shared across the proxy.

pub mod backend;
pub mod routing;
