use crate::server::config::ServerConfig;
use socket2::Socket;
use std::{
    ffi::OsString,
    io,
    net::SocketAddr,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
};
use tokio::process::{Child, Command};

/// How worker processes are started: a program and the arguments every
/// worker receives before `--as-worker --address <addr>`.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-executes the running binary with its own arguments.
    pub fn current_process() -> io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            std::env::args_os().skip(1),
        ))
    }

    fn command(&self, addr: SocketAddr) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--as-worker")
            .arg("--address")
            .arg(addr.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// A running worker process.
///
/// Holds a reference to the socket reserved by the supervisor; the socket
/// stays open for as long as any worker record is alive.
#[derive(Debug)]
pub struct WorkerProcess {
    index: usize,
    child: Child,
    reserved: Arc<Socket>,
    config: Arc<ServerConfig>,
}

impl WorkerProcess {
    pub fn spawn(
        index: usize,
        launcher: &WorkerLauncher,
        addr: SocketAddr,
        reserved: Arc<Socket>,
        config: Arc<ServerConfig>,
    ) -> io::Result<Self> {
        let child = launcher.command(addr).spawn()?;
        tracing::info!(
            worker = index,
            pid = child.id(),
            "grpc worker spawned @{addr}"
        );
        Ok(Self {
            index,
            child,
            reserved,
            config,
        })
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    /// OS process id, `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn reserved_socket(&self) -> &Socket {
        &self.reserved
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Sends SIGKILL. Used to tear down a partially started group.
    pub fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Asks process `pid` to shut down gracefully by sending it SIGTERM.
#[cfg(unix)]
pub async fn terminate(pid: u32) -> io::Result<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("kill -TERM {pid} exited with {status}")))
    }
}

#[cfg(not(unix))]
pub async fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "graceful termination is not supported on this platform",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn terminate_delivers_sigterm() {
        let mut child = Command::new("sh")
            .args(["-c", "trap 'exit 7' TERM; while :; do sleep 0.1; done"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        terminate(child.id().unwrap()).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn terminating_a_missing_process_fails() {
        let mut child = Command::new("sh").args(["-c", "exit 0"]).spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(terminate(pid).await.is_err());
    }
}
