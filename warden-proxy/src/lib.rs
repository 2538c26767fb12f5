//! Warden Proxy Engine
//!
//! The Tokio side of Warden: socket serving, backend forwarding over pooled
//! HTTP/1.1 connections, and the multi-process supervisor that shares the
//! listening sockets with one worker per CPU.

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;

pub mod connection_pool;
pub mod gateway;
pub mod server;
pub mod supervisor;
pub mod transport;
pub mod worker;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Wraps a fixed payload as a [`ProxyBody`].
pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// An empty [`ProxyBody`].
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
