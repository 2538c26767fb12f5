//! Backend forwarding.
//!
//! [`Transport`] is the seam between the gateway and the network. The default
//! [`HttpTransport`] speaks plain HTTP/1.1 and keeps idle connections in a
//! [`ConnectionPool`].

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use warden_core::domain::backend::Backend;

use crate::connection_pool::ConnectionPool;
use crate::ProxyBody;

/// A backend could not be reached or dropped the exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP connection failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Backend authority.
        addr: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The HTTP/1.1 handshake failed.
    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        /// Backend authority.
        addr: String,
        /// Underlying protocol failure.
        #[source]
        source: hyper::Error,
    },
    /// The connection broke before a response head arrived.
    #[error("request to {addr} failed: {source}")]
    Request {
        /// Backend authority.
        addr: String,
        /// Underlying protocol failure.
        #[source]
        source: hyper::Error,
    },
}

/// Sends one request to one backend and returns its response head.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Forwards `req` to `backend`.
    async fn forward(
        &self,
        backend: &Backend,
        req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, TransportError>;
}

/// HTTP/1.1 transport over pooled TCP connections.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    pool: ConnectionPool,
}

impl HttpTransport {
    /// Creates a transport with its own pool.
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// The pool idle connections are returned to.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    async fn connect(&self, addr: &str) -> Result<SendRequest<ProxyBody>, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(error = %err, addr, "failed to set TCP_NODELAY");
        }

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| TransportError::Handshake {
                addr: addr.to_string(),
                source,
            })?;

        let addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, addr, "backend connection closed");
            }
        });
        Ok(sender)
    }

    fn release(
        &self,
        addr: &str,
        sender: SendRequest<ProxyBody>,
        response: Response<Incoming>,
    ) -> Response<ProxyBody> {
        self.pool.push(addr, sender);
        response.map(|body| body.boxed())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn forward(
        &self,
        backend: &Backend,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let addr = backend.addr.as_str();

        if let Some(mut sender) = self.pool.try_pop(addr) {
            match sender.try_send_request(req).await {
                Ok(response) => return Ok(self.release(addr, sender, response)),
                Err(mut err) => match err.take_message() {
                    // The pooled connection died before the request went out.
                    Some(unsent) => {
                        tracing::debug!(addr, error = %err.error(), "stale pooled connection");
                        req = unsent;
                    }
                    None => {
                        return Err(TransportError::Request {
                            addr: addr.to_string(),
                            source: err.into_error(),
                        })
                    }
                },
            }
        }

        let mut sender = self.connect(addr).await?;
        let response = sender
            .send_request(req)
            .await
            .map_err(|source| TransportError::Request {
                addr: addr.to_string(),
                source,
            })?;
        Ok(self.release(addr, sender, response))
    }
}
