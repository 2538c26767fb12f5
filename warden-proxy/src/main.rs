//! Warden Proxy Engine
//!
//! Entry point of the `warden-proxy` binary. Without `--child` it binds the
//! listening sockets and supervises one worker process per CPU; with `--child`
//! it is such a worker.

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use argh::FromArgs;
use tracing::Instrument;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use warden_core::config;
use warden_proxy::supervisor::{self, Listeners, Supervisor};
use warden_proxy::worker::{self, WorkerSettings};

#[derive(FromArgs)]
/// Host-aware reverse proxy with per-application circuit breaking.
struct Args {
    /// address client traffic is accepted on
    #[argh(option, default = "String::from(\"0.0.0.0:23456\")")]
    proxy_addr: String,

    /// address the admin API is served on
    #[argh(option, default = "String::from(\"0.0.0.0:12345\")")]
    admin_addr: String,

    /// application document to load; repeat for several applications
    #[argh(option, short = 'c')]
    config: Vec<PathBuf>,

    /// run as a worker on inherited sockets
    #[argh(switch)]
    child: bool,

    /// number of worker processes, 0 serves in this process (default: one per CPU)
    #[argh(option)]
    workers: Option<usize>,

    /// deadline for a backend response head, in milliseconds
    #[argh(option, default = "30_000")]
    backend_timeout_ms: u64,

    /// how long connections may drain on shutdown, in milliseconds
    #[argh(option, default = "10_000")]
    drain_timeout_ms: u64,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Arguments a worker is started with: ours, plus `--child`.
fn child_args() -> Vec<OsString> {
    let mut args: Vec<OsString> = std::env::args_os().skip(1).collect();
    args.push("--child".into());
    args
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args: Args = argh::from_env();

    if args.config.is_empty() {
        bail!("at least one --config file is required");
    }

    let settings = WorkerSettings {
        backend_timeout: Duration::from_millis(args.backend_timeout_ms),
        drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        ..WorkerSettings::default()
    };
    settings
        .breaker
        .validate()
        .context("invalid breaker settings")?;

    let apps = config::load_all(&args.config).context("failed to load configuration")?;
    for app in &apps {
        app.build_routes()
            .with_context(|| format!("invalid application {:?}", app.name))?;
    }

    if args.child {
        let listeners = Listeners::inherit().context("failed to adopt listeners")?;
        let span = tracing::info_span!("worker", pid = std::process::id());
        return worker::run(listeners, &apps, &settings)
            .instrument(span)
            .await
            .context("worker failed");
    }

    let listeners = Listeners::bind(&args.proxy_addr, &args.admin_addr)?;
    tracing::info!(
        proxy = %args.proxy_addr,
        admin = %args.admin_addr,
        apps = apps.len(),
        "sockets bound"
    );

    let workers = args.workers.unwrap_or_else(supervisor::default_workers);
    if workers == 0 {
        let span = tracing::info_span!("worker", pid = std::process::id());
        return worker::run(listeners, &apps, &settings)
            .instrument(span)
            .await
            .context("worker failed");
    }

    let program = std::env::current_exe().context("failed to locate own executable")?;
    Supervisor::new(listeners, program, child_args(), workers)
        .run()
        .await
        .context("supervisor failed")
}
