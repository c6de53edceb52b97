//! Tunnel backend process.
//!
//! The network tunnel talks to a local network-emulation process over a
//! length-prefixed local socket. [`Backend`] owns that process: it spawns it,
//! drains its stdout/stderr into the log, watches for it to exit and connects
//! to its socket. Dropping a `Backend` kills the process.

use crate::domain::settings::TunnelSettings;
use crate::domain::tunnel_frame::TunnelFrameError;
use interprocess::local_socket::tokio::{prelude::*, RecvHalf, SendHalf, Stream};
use interprocess::local_socket::GenericFilePath;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Placeholder in backend arguments replaced by the socket path.
pub const SOCKET_PLACEHOLDER: &str = "{socket}";

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend process exited: {0}")]
    ProcessExited(String),
    #[error("backend socket closed")]
    SocketClosed,
    #[error("backend socket I/O error: {0}")]
    SocketIo(#[source] io::Error),
    #[error("failed to spawn backend: {0}")]
    Spawn(#[source] io::Error),
    #[error("backend socket {0} did not accept a connection in time")]
    ConnectTimeout(PathBuf),
    #[error(transparent)]
    Frame(#[from] TunnelFrameError),
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub program: String,
    pub args: Vec<String>,
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
}

impl From<&TunnelSettings> for BackendConfig {
    fn from(settings: &TunnelSettings) -> Self {
        Self {
            program: settings.backend_program.clone(),
            args: settings.backend_args.clone(),
            socket_path: settings.socket_path.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            max_frame_len: settings.max_frame_len,
        }
    }
}

impl BackendConfig {
    fn resolved_args(&self) -> Vec<String> {
        let socket = self.socket_path.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(SOCKET_PLACEHOLDER, &socket))
            .collect()
    }
}

/// Running backend process plus its helper tasks.
pub struct Backend {
    watcher: Option<JoinHandle<()>>,
    log_drains: Vec<JoinHandle<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: Option<oneshot::Receiver<String>>,
}

impl Backend {
    /// Spawn the backend and connect to its socket.
    pub async fn launch(config: &BackendConfig) -> Result<(Self, RecvHalf, SendHalf), BackendError> {
        info!(
            program = %config.program,
            socket = %config.socket_path.display(),
            "Launching tunnel backend"
        );

        let mut child = Command::new(&config.program)
            .args(config.resolved_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BackendError::Spawn)?;

        let mut log_drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            log_drains.push(tokio::spawn(drain_log(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            log_drains.push(tokio::spawn(drain_log(stderr, "stderr")));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_process(child, kill_rx, exit_tx));

        let mut backend = Self {
            watcher: Some(watcher),
            log_drains,
            kill_tx: Some(kill_tx),
            exit_rx: Some(exit_rx),
        };

        let stream = backend.connect(config).await?;
        let (recv, send) = stream.split();
        info!("Tunnel backend connected");
        Ok((backend, recv, send))
    }

    /// Poll the socket until the backend accepts, it dies, or time runs out.
    async fn connect(&mut self, config: &BackendConfig) -> Result<Stream, BackendError> {
        let deadline = tokio::time::Instant::now() + config.connect_timeout;
        loop {
            if let Some(status) = self.try_exit_status() {
                return Err(BackendError::ProcessExited(status));
            }

            let name = config
                .socket_path
                .as_path()
                .to_fs_name::<GenericFilePath>()
                .map_err(BackendError::SocketIo)?;
            match Stream::connect(name).await {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!("Backend socket not ready yet: {}", e),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(BackendError::ConnectTimeout(config.socket_path.clone()));
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }
    }

    fn try_exit_status(&mut self) -> Option<String> {
        let rx = self.exit_rx.as_mut()?;
        match rx.try_recv() {
            Ok(status) => {
                self.exit_rx = None;
                Some(status)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.exit_rx = None;
                Some("process watcher stopped".to_string())
            }
        }
    }

    /// Resolves when the process exits on its own.
    pub async fn exited(&mut self) -> BackendError {
        let status = match self.exit_rx.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| "process watcher stopped".to_string()),
            None => std::future::pending().await,
        };
        BackendError::ProcessExited(status)
    }

    /// Kill the process and wait for it to be reaped.
    pub async fn shutdown(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Some(watcher) = self.watcher.take() {
            if tokio::time::timeout(Duration::from_secs(2), watcher)
                .await
                .is_err()
            {
                warn!("Tunnel backend did not stop in time");
            }
        }
        info!("Tunnel backend stopped");
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        // Aborting the watcher drops the Child, which kills the process.
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for drain in self.log_drains.drain(..) {
            drain.abort();
        }
    }
}

async fn watch_process(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<String>,
) {
    tokio::select! {
        status = child.wait() => {
            let status = match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };
            warn!("Tunnel backend exited: {}", status);
            let _ = exit_tx.send(status);
        }
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill tunnel backend: {}", e);
            }
        }
    }
}

async fn drain_log<R: AsyncRead + Unpin>(reader: R, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "tunnel_backend", stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "tunnel_backend", stream, "log stream error: {}", e);
                break;
            }
        }
    }
}
