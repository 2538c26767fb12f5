//! Multi-process supervision.
//!
//! The parent binds the proxy and admin sockets once and spawns one worker per
//! CPU. Each worker inherits the sockets as descriptors [`PROXY_FD`] and
//! [`ADMIN_FD`] and is pinned to its CPU before `exec`.
//!
//! Signals handled by the parent:
//!
//! - `SIGHUP` spawns a new generation of workers, then sends `SIGTERM` to the
//!   previous one so it drains.
//! - `SIGTERM` and `SIGINT` stop every worker and exit once they are gone.
//!
//! A worker of the current generation that exits on its own is respawned on the
//! same CPU.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use warden_core::ConfigError;

/// Descriptor a worker finds the proxy listener on.
pub const PROXY_FD: RawFd = 3;
/// Descriptor a worker finds the admin listener on.
pub const ADMIN_FD: RawFd = 4;

/// Delay before replacing a crashed worker, so a crash loop does not spin.
const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// Failures of the process layer.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The requested address.
        addr: String,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// An inherited descriptor is not a listening socket.
    #[error("descriptor {fd} is not an inherited listener: {source}")]
    Inherit {
        /// The descriptor number.
        fd: RawFd,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),
    /// A signal handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
    /// Applications failed validation in a worker.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The proxy and admin listening sockets.
#[derive(Debug)]
pub struct Listeners {
    /// Socket client traffic arrives on.
    pub proxy: std::net::TcpListener,
    /// Socket the admin API is served on.
    pub admin: std::net::TcpListener,
}

impl Listeners {
    /// Binds both sockets. `:port` is shorthand for every interface.
    pub fn bind(proxy: &str, admin: &str) -> Result<Self, SupervisorError> {
        Ok(Self {
            proxy: bind(proxy)?,
            admin: bind(admin)?,
        })
    }

    /// Adopts the sockets passed down by the supervisor.
    pub fn inherit() -> Result<Self, SupervisorError> {
        Ok(Self {
            proxy: adopt(PROXY_FD)?,
            admin: adopt(ADMIN_FD)?,
        })
    }

    /// Converts both sockets for use on the current Tokio runtime.
    pub fn into_tokio(self) -> io::Result<(tokio::net::TcpListener, tokio::net::TcpListener)> {
        self.proxy.set_nonblocking(true)?;
        self.admin.set_nonblocking(true)?;
        Ok((
            tokio::net::TcpListener::from_std(self.proxy)?,
            tokio::net::TcpListener::from_std(self.admin)?,
        ))
    }
}

/// Expands `:port` to `0.0.0.0:port`.
pub fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn bind(addr: &str) -> Result<std::net::TcpListener, SupervisorError> {
    let addr = listen_addr(addr);
    std::net::TcpListener::bind(&addr).map_err(|source| SupervisorError::Bind { addr, source })
}

fn adopt(fd: RawFd) -> Result<std::net::TcpListener, SupervisorError> {
    // SAFETY: the supervisor installs a listening socket on `fd` before exec and
    // nothing else in this process owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener
        .local_addr()
        .map_err(|source| SupervisorError::Inherit { fd, source })?;
    Ok(listener)
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// CPUs this process may run on, in ascending order.
#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> Vec<usize> {
    // SAFETY: `cpu_set_t` is plain data and the size passed matches the buffer.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return fallback_cpus();
        }
        let cpus: Vec<usize> = (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect();
        if cpus.is_empty() {
            fallback_cpus()
        } else {
            cpus
        }
    }
}

/// CPUs this process may run on, in ascending order.
#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> Vec<usize> {
    fallback_cpus()
}

fn fallback_cpus() -> Vec<usize> {
    let count = std::thread::available_parallelism().map_or(1, |n| n.get());
    (0..count).collect()
}

/// Number of workers started when none is requested: one per usable CPU.
pub fn default_workers() -> usize {
    allowed_cpus().len()
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> io::Result<()> {
    // SAFETY: `cpu_set_t` is plain data; `sched_setaffinity` is async-signal-safe.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        cvt(libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        ))?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: usize) -> io::Result<()> {
    Ok(())
}

/// Installs `proxy` and `admin` on [`PROXY_FD`] and [`ADMIN_FD`].
///
/// Runs between fork and exec. Both descriptors are first parked above the
/// target range so neither `dup2` can clobber the other source.
fn install_listeners(proxy: RawFd, admin: RawFd) -> io::Result<()> {
    // SAFETY: only async-signal-safe calls on descriptors owned by the parent.
    unsafe {
        let proxy = cvt(libc::fcntl(proxy, libc::F_DUPFD_CLOEXEC, 10))?;
        let admin = cvt(libc::fcntl(admin, libc::F_DUPFD_CLOEXEC, 10))?;
        cvt(libc::dup2(proxy, PROXY_FD))?;
        cvt(libc::dup2(admin, ADMIN_FD))?;
    }
    Ok(())
}

fn terminate(pid: u32) {
    // SAFETY: plain syscall; a stale pid only yields ESRCH.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == -1 {
        tracing::warn!(pid, error = %io::Error::last_os_error(), "failed to signal worker");
    }
}

fn describe(status: &io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("signal {signal}"),
            (None, None) => status.to_string(),
        },
        Err(err) => err.to_string(),
    }
}

type ExitSender = mpsc::UnboundedSender<(u64, io::Result<ExitStatus>)>;

#[derive(Debug, Clone, Copy)]
struct Worker {
    pid: u32,
    cpu: usize,
    generation: u64,
}

/// Live workers of one supervisor and the generation they belong to.
#[derive(Debug)]
struct Fleet<'a> {
    supervisor: &'a Supervisor,
    exits: ExitSender,
    workers: HashMap<u64, Worker>,
    next_id: u64,
    generation: u64,
    stopping: bool,
}

impl<'a> Fleet<'a> {
    fn new(supervisor: &'a Supervisor, exits: ExitSender) -> Self {
        Self {
            supervisor,
            exits,
            workers: HashMap::new(),
            next_id: 0,
            generation: 0,
            stopping: false,
        }
    }

    fn spawn(&mut self, cpu: usize) -> Result<(), SupervisorError> {
        let id = self.next_id;
        let worker = self
            .supervisor
            .spawn(cpu, self.generation, id, &self.exits)?;
        self.workers.insert(id, worker);
        self.next_id += 1;
        Ok(())
    }

    /// Spawns the first generation. If any worker fails to start, the ones
    /// already running are terminated before the error is returned.
    fn start(&mut self) -> Result<(), SupervisorError> {
        let supervisor = self.supervisor;
        for &cpu in &supervisor.cpus {
            if let Err(err) = self.spawn(cpu) {
                tracing::error!(cpu, error = %err, "startup failed, stopping spawned workers");
                self.stop();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Forgets an exited worker. Returns its CPU when it should be replaced.
    fn exited(&mut self, id: u64, status: &io::Result<ExitStatus>) -> Option<usize> {
        let worker = self.workers.remove(&id)?;
        if self.stopping || worker.generation != self.generation {
            tracing::info!(pid = worker.pid, status = describe(status), "worker exited");
            return None;
        }
        tracing::warn!(
            pid = worker.pid,
            cpu = worker.cpu,
            status = describe(status),
            "worker died, respawning"
        );
        Some(worker.cpu)
    }

    fn respawn(&mut self, cpu: usize) {
        if self.stopping {
            return;
        }
        if let Err(err) = self.spawn(cpu) {
            tracing::error!(cpu, error = %err, "respawn failed");
        }
    }

    /// Starts a new generation, then terminates each old worker whose CPU got
    /// a replacement.
    fn restart(&mut self) {
        if self.stopping {
            return;
        }
        self.generation += 1;
        tracing::info!(generation = self.generation, "graceful restart");

        let mut old: Vec<Worker> = self.workers.values().copied().collect();
        let supervisor = self.supervisor;
        for &cpu in &supervisor.cpus {
            if let Err(err) = self.spawn(cpu) {
                tracing::error!(cpu, error = %err, "spawn failed during restart");
                continue;
            }
            if let Some(pos) = old.iter().position(|worker| worker.cpu == cpu) {
                terminate(old.swap_remove(pos).pid);
            }
        }
    }

    fn stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        tracing::info!(workers = self.workers.len(), "shutting down");
        for worker in self.workers.values() {
            terminate(worker.pid);
        }
    }

    fn is_done(&self) -> bool {
        self.stopping && self.workers.is_empty()
    }
}

/// Spawns and watches worker processes sharing one pair of [`Listeners`].
#[derive(Debug)]
pub struct Supervisor {
    listeners: Listeners,
    program: PathBuf,
    args: Vec<OsString>,
    cpus: Vec<usize>,
}

impl Supervisor {
    /// Creates a supervisor for `workers` processes running `program args`.
    ///
    /// Worker `i` is pinned to the `i`-th allowed CPU, wrapping around when
    /// there are more workers than CPUs.
    pub fn new(listeners: Listeners, program: PathBuf, args: Vec<OsString>, workers: usize) -> Self {
        let allowed = allowed_cpus();
        let cpus = (0..workers).map(|i| allowed[i % allowed.len()]).collect();
        Self {
            listeners,
            program,
            args,
            cpus,
        }
    }

    /// Runs until `SIGTERM` or `SIGINT` and every worker has exited.
    pub async fn run(self) -> Result<(), SupervisorError> {
        let mut hangup = signal(SignalKind::hangup()).map_err(SupervisorError::Signal)?;
        let mut terminate_signal =
            signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;

        let (exits, mut exited) = mpsc::unbounded_channel();
        let mut fleet = Fleet::new(&self, exits);
        fleet.start()?;
        tracing::info!(workers = self.cpus.len(), "supervisor started");

        loop {
            tokio::select! {
                Some((id, status)) = exited.recv() => {
                    if let Some(cpu) = fleet.exited(id, &status) {
                        tokio::time::sleep(RESPAWN_DELAY).await;
                        fleet.respawn(cpu);
                    }
                }
                _ = hangup.recv(), if !fleet.stopping => fleet.restart(),
                _ = terminate_signal.recv() => fleet.stop(),
                _ = interrupt.recv() => fleet.stop(),
            }

            if fleet.is_done() {
                break;
            }
        }

        tracing::info!("supervisor stopped");
        Ok(())
    }

    fn spawn(
        &self,
        cpu: usize,
        generation: u64,
        id: u64,
        exits: &ExitSender,
    ) -> Result<Worker, SupervisorError> {
        let proxy = self.listeners.proxy.as_raw_fd();
        let admin = self.listeners.admin.as_raw_fd();

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        // SAFETY: the hook only performs async-signal-safe syscalls.
        unsafe {
            command.pre_exec(move || {
                install_listeners(proxy, admin)?;
                pin_to_cpu(cpu)
            });
        }

        let mut child = command.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(pid, cpu, generation, "worker spawned");

        let exits = exits.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exits.send((id, status));
        });

        Ok(Worker {
            pid,
            cpu,
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::IntoRawFd;

    use tokio::io::AsyncReadExt;

    use super::*;

    const ADOPT_CHILD_ENV: &str = "WARDEN_ADOPT_CHILD";

    fn sh_supervisor(script: &str, workers: usize) -> Supervisor {
        let listeners = Listeners::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        Supervisor::new(
            listeners,
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), script.into()],
            workers,
        )
    }

    fn signal_of(status: &io::Result<ExitStatus>) -> Option<i32> {
        status.as_ref().ok().and_then(|status| status.signal())
    }

    #[test]
    fn test_listen_addr_shorthand() {
        assert_eq!(listen_addr(":23456"), "0.0.0.0:23456");
        assert_eq!(listen_addr("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[test]
    fn test_bind_and_convert() {
        let listeners = Listeners::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        let proxy = listeners.proxy.local_addr().unwrap();
        let admin = listeners.admin.local_addr().unwrap();
        assert_ne!(proxy.port(), admin.port());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let (proxy_listener, _) = listeners.into_tokio().unwrap();
            assert_eq!(proxy_listener.local_addr().unwrap(), proxy);
        });
    }

    #[test]
    fn test_bind_failure_names_address() {
        let err = Listeners::bind("not-an-address", "127.0.0.1:0").unwrap_err();
        assert!(matches!(err, SupervisorError::Bind { ref addr, .. } if addr == "not-an-address"));
    }

    #[test]
    fn test_cpu_assignment_wraps() {
        let listeners = Listeners::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        let allowed = allowed_cpus();
        assert!(!allowed.is_empty());
        assert_eq!(default_workers(), allowed.len());

        let workers = allowed.len() + 1;
        let supervisor = Supervisor::new(listeners, PathBuf::from("/bin/true"), Vec::new(), workers);
        assert_eq!(supervisor.cpus.len(), workers);
        assert_eq!(supervisor.cpus[allowed.len()], allowed[0]);
    }

    #[tokio::test]
    async fn test_spawned_worker_sees_listeners() {
        let listeners = Listeners::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        let supervisor = Supervisor::new(
            listeners,
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), "test -e /proc/self/fd/3 && test -e /proc/self/fd/4".into()],
            1,
        );

        let (exits, mut exited) = mpsc::unbounded_channel();
        let cpu = supervisor.cpus[0];
        supervisor.spawn(cpu, 0, 7, &exits).unwrap();

        let (id, status) = exited.recv().await.unwrap();
        assert_eq!(id, 7);
        assert!(status.unwrap().success());
    }

    #[test]
    fn test_adopt_rejects_non_socket() {
        let fd = std::fs::File::open("/dev/null").unwrap().into_raw_fd();
        let err = adopt(fd).unwrap_err();
        assert!(matches!(err, SupervisorError::Inherit { fd: got, .. } if got == fd));
    }

    #[tokio::test]
    async fn test_crashed_worker_is_respawned_on_its_cpu() {
        let supervisor = sh_supervisor("exit 3", 1);
        let (exits, mut exited) = mpsc::unbounded_channel();
        let mut fleet = Fleet::new(&supervisor, exits);
        fleet.start().unwrap();

        let (id, status) = exited.recv().await.unwrap();
        assert_eq!(status.as_ref().unwrap().code(), Some(3));
        let cpu = fleet.exited(id, &status).unwrap();
        assert_eq!(cpu, supervisor.cpus[0]);
        assert!(fleet.workers.is_empty());

        fleet.respawn(cpu);
        assert_eq!(fleet.workers.len(), 1);
        assert!(!fleet.workers.contains_key(&id));
        assert!(fleet.workers.values().all(|w| w.cpu == cpu && w.generation == 0));

        fleet.stop();
        let (id, status) = exited.recv().await.unwrap();
        assert_eq!(fleet.exited(id, &status), None);
        assert!(fleet.is_done());
    }

    #[tokio::test]
    async fn test_restart_replaces_generation() {
        let supervisor = sh_supervisor("exec sleep 30", 1);
        let (exits, mut exited) = mpsc::unbounded_channel();
        let mut fleet = Fleet::new(&supervisor, exits);
        fleet.start().unwrap();
        let old: Vec<u64> = fleet.workers.keys().copied().collect();

        fleet.restart();
        assert_eq!(fleet.generation, 1);
        assert_eq!(fleet.workers.len(), 2);

        let (id, status) = exited.recv().await.unwrap();
        assert_eq!(old, [id]);
        assert_eq!(signal_of(&status), Some(libc::SIGTERM));
        assert_eq!(fleet.exited(id, &status), None);
        assert_eq!(fleet.workers.len(), 1);
        assert!(fleet.workers.values().all(|w| w.generation == 1));

        fleet.stop();
        let (id, status) = exited.recv().await.unwrap();
        assert_eq!(signal_of(&status), Some(libc::SIGTERM));
        assert_eq!(fleet.exited(id, &status), None);
        assert!(fleet.is_done());
    }

    #[tokio::test]
    async fn test_restart_is_ignored_while_stopping() {
        let supervisor = sh_supervisor("exec sleep 30", 1);
        let (exits, mut exited) = mpsc::unbounded_channel();
        let mut fleet = Fleet::new(&supervisor, exits);
        fleet.start().unwrap();

        fleet.stop();
        fleet.restart();
        assert_eq!(fleet.generation, 0);
        assert_eq!(fleet.workers.len(), 1);

        let (id, status) = exited.recv().await.unwrap();
        assert_eq!(fleet.exited(id, &status), None);
        fleet.respawn(supervisor.cpus[0]);
        assert!(fleet.is_done());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_start_terminates_spawned_workers() {
        let unusable = libc::CPU_SETSIZE as usize - 1;
        let mut supervisor = sh_supervisor("exec sleep 30", 1);
        if allowed_cpus().contains(&unusable) {
            return;
        }
        supervisor.cpus.push(unusable);

        let (exits, mut exited) = mpsc::unbounded_channel();
        let mut fleet = Fleet::new(&supervisor, exits);
        let err = fleet.start().unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
        assert!(fleet.stopping);
        assert_eq!(fleet.workers.len(), 1);

        let (id, status) = exited.recv().await.unwrap();
        assert_eq!(signal_of(&status), Some(libc::SIGTERM));
        assert_eq!(fleet.exited(id, &status), None);
        assert!(fleet.is_done());
    }

    /// Runs inside a worker started by `test_worker_adopts_inherited_listeners`.
    #[test]
    #[ignore = "re-executed as a worker by test_worker_adopts_inherited_listeners"]
    fn adopt_inherited_listeners_in_worker() {
        if std::env::var_os(ADOPT_CHILD_ENV).is_none() {
            return;
        }
        let listeners = Listeners::inherit().unwrap();
        for (listener, reply) in [(&listeners.proxy, b"proxy"), (&listeners.admin, b"admin")] {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(reply).unwrap();
        }
    }

    #[tokio::test]
    async fn test_worker_adopts_inherited_listeners() {
        std::env::set_var(ADOPT_CHILD_ENV, "1");
        let listeners = Listeners::bind("127.0.0.1:0", "127.0.0.1:0").unwrap();
        let proxy = listeners.proxy.local_addr().unwrap();
        let admin = listeners.admin.local_addr().unwrap();
        let args = [
            "supervisor::tests::adopt_inherited_listeners_in_worker",
            "--exact",
            "--ignored",
            "--test-threads=1",
        ]
        .map(OsString::from)
        .to_vec();
        let supervisor = Supervisor::new(listeners, std::env::current_exe().unwrap(), args, 1);

        let (exits, mut exited) = mpsc::unbounded_channel();
        let mut fleet = Fleet::new(&supervisor, exits);
        fleet.start().unwrap();

        for (addr, expected) in [(proxy, "proxy"), (admin, "admin")] {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut reply = String::new();
            stream.read_to_string(&mut reply).await.unwrap();
            assert_eq!(reply, expected);
        }

        let (id, status) = exited.recv().await.unwrap();
        assert!(status.as_ref().unwrap().success());
        assert_eq!(fleet.exited(id, &status), Some(supervisor.cpus[0]));
    }
}
