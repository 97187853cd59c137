use crate::server::{
    bootstrap::{Bootstrap, set_reuse_port, shutdown_signal},
    config::ServerConfig,
    pool::worker::{WorkerLauncher, WorkerProcess, terminate},
};
use anyhow::Context;
use echo_rpc_core::options::ListenerRole;
use socket2::{Domain, Protocol, Socket, Type};
use std::{io, net::SocketAddr, sync::Arc};

/// Number of server processes to run.
///
/// Unset means one process. Zero or a negative value means one process per
/// logical CPU.
pub fn resolve_worker_count(requested: Option<i64>) -> usize {
    match requested {
        None => 1,
        Some(n) if n <= 0 => num_cpus::get().max(1),
        Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
    }
}

/// Binds `addr` with `SO_REUSEPORT` without listening on it.
///
/// The returned socket holds the port for the lifetime of the group so that
/// workers can bind the same address. A port of `0` is resolved to the port
/// the kernel picked; read it back with [`Socket::local_addr`].
pub fn reserve_port(addr: SocketAddr) -> anyhow::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    set_reuse_port(&socket)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to reserve {addr}"))?;
    Ok(socket)
}

/// Supervisor for a set of worker processes sharing one port.
#[derive(Debug)]
pub struct ProcessGroup {
    addr: SocketAddr,
    reserved: Arc<Socket>,
    workers: Vec<WorkerProcess>,
}

impl ProcessGroup {
    /// Reserves the configured address and spawns `count` workers with
    /// `launcher`. If any worker fails to spawn, the ones already running
    /// are killed.
    pub fn start_with(
        launcher: &WorkerLauncher,
        config: Arc<ServerConfig>,
        count: usize,
    ) -> anyhow::Result<Self> {
        let requested = config.socket_addr()?;
        let reserved = Arc::new(reserve_port(requested)?);
        let addr = reserved
            .local_addr()?
            .as_socket()
            .context("reserved socket has no inet address")?;

        tracing::info!(workers = count, "Binding to: {addr}");

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            match WorkerProcess::spawn(
                index,
                launcher,
                addr,
                Arc::clone(&reserved),
                Arc::clone(&config),
            ) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &mut workers {
                        if let Err(kill) = worker.kill() {
                            tracing::warn!(worker = worker.index(), "Failed to kill worker: {kill}");
                        }
                    }
                    return Err(e).with_context(|| format!("failed to spawn worker {index}"));
                }
            }
        }

        Ok(Self {
            addr,
            reserved,
            workers,
        })
    }

    /// The shared listen address, with any ephemeral port resolved.
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().filter_map(WorkerProcess::pid).collect()
    }

    /// Waits for every worker to exit, forwarding SIGTERM to all of them once
    /// `signal` resolves.
    pub async fn wait_with_shutdown<F>(mut self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pids = self.pids();
        let forwarder = tokio::spawn(async move {
            signal.await;
            tracing::info!("Forwarding shutdown to {} workers", pids.len());
            for pid in pids {
                if let Err(e) = terminate(pid).await {
                    tracing::warn!(pid, "Failed to signal worker: {e}");
                }
            }
        });

        let mut failed = 0usize;
        for worker in &mut self.workers {
            let pid = worker.pid();
            let status = worker.wait().await;
            match status {
                Ok(status) if status.success() => {
                    tracing::info!(worker = worker.index(), pid, "grpc worker stopped");
                }
                Ok(status) => {
                    failed += 1;
                    tracing::warn!(worker = worker.index(), pid, "grpc worker exited with {status}");
                }
                Err(e) => {
                    failed += 1;
                    tracing::error!(worker = worker.index(), pid, "Failed to wait for worker: {e}");
                }
            }
        }
        forwarder.abort();
        drop(self.reserved);

        if failed > 0 {
            anyhow::bail!("{failed} of {} workers failed", self.workers.len());
        }
        Ok(())
    }
}

/// Runs the server with the configured number of processes until Ctrl+C
/// or SIGTERM.
pub async fn run_service(config: Arc<ServerConfig>) -> anyhow::Result<()> {
    serve_processes(config, WorkerLauncher::current_process(), shutdown_signal()).await
}

/// Runs the server until `signal` resolves.
///
/// Workers and single-process configurations run one server in this
/// process. Otherwise a [`ProcessGroup`] is started with `launcher`; if that
/// fails the server falls back to a single standalone process.
pub async fn serve_processes<F>(
    config: Arc<ServerConfig>,
    launcher: io::Result<WorkerLauncher>,
    signal: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if config.as_worker {
        return Bootstrap::new(config, ListenerRole::PooledWorker).run(signal).await;
    }

    let count = resolve_worker_count(config.workers);
    if count == 1 {
        return Bootstrap::new(config, ListenerRole::Standalone).run(signal).await;
    }

    let started = launcher
        .context("failed to locate the current executable")
        .and_then(|launcher| ProcessGroup::start_with(&launcher, Arc::clone(&config), count));

    match started {
        Ok(group) => {
            tracing::info!(pids = ?group.pids(), "Started {} grpc workers", group.len());
            group.wait_with_shutdown(signal).await
        }
        Err(e) => {
            tracing::warn!("Multi-process start failed, falling back to single process: {e:#}");
            Bootstrap::new(config, ListenerRole::Standalone).run(signal).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::bootstrap::bind_listener;
    use std::time::Duration;

    fn config_for(address: &str) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            address: address.to_string(),
            ..ServerConfig::default()
        })
    }

    #[test]
    fn worker_count_resolution() {
        assert_eq!(resolve_worker_count(None), 1);
        assert_eq!(resolve_worker_count(Some(1)), 1);
        assert_eq!(resolve_worker_count(Some(3)), 3);
        assert_eq!(resolve_worker_count(Some(0)), num_cpus::get().max(1));
        assert_eq!(resolve_worker_count(Some(-1)), num_cpus::get().max(1));
    }

    #[cfg(unix)]
    #[test]
    fn reserved_port_accepts_pooled_listeners() {
        let reserved = reserve_port("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = reserved.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(addr.port(), 0);

        let first = bind_listener(addr, true).unwrap();
        let second = bind_listener(addr, true).unwrap();
        assert_eq!(first.local_addr().unwrap(), addr);
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn group_waits_for_every_worker() {
        let launcher = WorkerLauncher::new("sh", ["-c", "exit 0"]);
        let group = ProcessGroup::start_with(&launcher, config_for("127.0.0.1:0"), 3).unwrap();
        assert_eq!(group.len(), 3);
        assert!(!group.is_empty());
        assert_ne!(group.addr().port(), 0);

        for worker in &group.workers {
            let reserved = worker.reserved_socket().local_addr().unwrap().as_socket();
            assert_eq!(reserved, Some(group.addr()));
            assert_eq!(worker.config().address, "127.0.0.1:0");
        }

        tokio::time::timeout(
            Duration::from_secs(10),
            group.wait_with_shutdown(std::future::pending()),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_is_forwarded_to_workers() {
        let launcher = WorkerLauncher::new("sh", ["-c", "trap 'exit 0' TERM; while :; do sleep 0.1; done"]);
        let group = ProcessGroup::start_with(&launcher, config_for("127.0.0.1:0"), 2).unwrap();

        let signal = tokio::time::sleep(Duration::from_millis(300));
        tokio::time::timeout(Duration::from_secs(10), group.wait_with_shutdown(signal))
            .await
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn failing_workers_are_reported() {
        let launcher = WorkerLauncher::new("sh", ["-c", "exit 3"]);
        let group = ProcessGroup::start_with(&launcher, config_for("127.0.0.1:0"), 2).unwrap();
        let err = group
            .wait_with_shutdown(std::future::pending())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 of 2"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let launcher = WorkerLauncher::new("/nonexistent/echo-rpc-worker", Vec::<String>::new());
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(async {
            ProcessGroup::start_with(&launcher, config_for("127.0.0.1:0"), 2)
        });
        assert!(result.is_err());
    }
}
