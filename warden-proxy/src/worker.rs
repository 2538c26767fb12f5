//! A serving process.
//!
//! The worker is the composition root: it owns the [`Breaker`] registry and
//! hands it to both the proxy [`Gateway`] and the admin API.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use warden_admin::AdminService;
use warden_core::{AppConfig, Breaker, BreakerConfig};

use crate::connection_pool::ConnectionPool;
use crate::gateway::Gateway;
use crate::server;
use crate::supervisor::{Listeners, SupervisorError};
use crate::transport::HttpTransport;

/// Tuning of a worker process.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Circuit breaker tuning.
    pub breaker: BreakerConfig,
    /// Deadline for a backend to produce a response head.
    pub backend_timeout: Duration,
    /// How long in-flight connections may run after shutdown starts.
    pub drain_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            backend_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Registers `apps` and serves both listeners until `SIGTERM` or `SIGINT`.
pub async fn run(
    listeners: Listeners,
    apps: &[AppConfig],
    settings: &WorkerSettings,
) -> Result<(), SupervisorError> {
    settings.breaker.validate()?;
    let breaker = Arc::new(Breaker::new(settings.breaker.clone()));
    breaker.register_all(apps)?;

    let admin = Arc::new(AdminService::new(breaker.clone())?);
    let gateway = Arc::new(Gateway::new(
        breaker,
        Arc::new(HttpTransport::new(ConnectionPool::default())),
        settings.backend_timeout,
    ));

    let mut terminate = signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;
    let shutdown = async move {
        tokio::select! {
            _ = terminate.recv() => {}
            _ = interrupt.recv() => {}
        }
        tracing::info!("shutdown requested");
    };

    let (proxy, admin_listener) = listeners.into_tokio()?;
    tracing::info!(apps = apps.len(), "worker started");
    serve(proxy, admin_listener, gateway, admin, shutdown, settings.drain_timeout).await;
    tracing::info!("worker stopped");
    Ok(())
}

/// Serves the proxy and admin listeners until `shutdown` resolves, then drains
/// both.
pub async fn serve(
    proxy: TcpListener,
    admin_listener: TcpListener,
    gateway: Arc<Gateway>,
    admin: Arc<AdminService>,
    shutdown: impl Future<Output = ()>,
    drain_timeout: Duration,
) {
    let (stop, stopped) = watch::channel(false);
    let wait_stop = move || {
        let mut stopped = stopped.clone();
        async move {
            let _ = stopped.wait_for(|stop| *stop).await;
        }
    };

    let proxy_server = server::serve(
        proxy,
        move |req: Request<Incoming>| {
            let gateway = gateway.clone();
            async move { gateway.serve_request(req.map(|body| body.boxed())).await }
        },
        wait_stop(),
        drain_timeout,
    );
    let admin_server = server::serve(
        admin_listener,
        move |req: Request<Incoming>| {
            let admin = admin.clone();
            async move { admin.handle(&req) }
        },
        wait_stop(),
        drain_timeout,
    );
    let trigger = async move {
        shutdown.await;
        let _ = stop.send(true);
    };

    tokio::join!(proxy_server, admin_server, trigger);
}
