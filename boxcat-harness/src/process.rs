//! Launch, supervise and tear down the server under test.
//!
//! [`harness`] builds the server (once per process), starts it on a fresh
//! loopback port and returns only once it accepts connections. While the
//! returned [`ServerHarness`] lives, two tasks log the server's stderr and
//! stdout and a third waits for it to exit.

use boxcat_core::config::{HarnessConfig, LaunchConfig, ListenStrategy};
use boxcat_core::error::{BoxcatError, Result};
use std::os::fd::RawFd;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::builder::SERVER_BUILD;
use crate::conf::{INHERITED_PORT, ServerConf};
use crate::listener::{INHERITED_FD, InheritedListener, ephemeral_port, inherit_listener};
use crate::logs::spawn_log_drain;

// Bound on reading leftover output from a server that failed to start.
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// A running server under test.
///
/// Dropping it without calling [`ServerHarness::stop`] still kills the
/// server, but does not wait for it.
pub struct ServerHarness {
    name: String,
    port: u16,
    pid: Option<u32>,
    config_dir: TempDir,
    kill_tx: oneshot::Sender<()>,
    exit_task: JoinHandle<Option<ExitStatus>>,
    log_drains: Vec<JoinHandle<()>>,
}

struct Launched {
    child: Child,
    port: u16,
}

/// Build the server if needed and launch it.
pub async fn harness(config: &HarnessConfig) -> Result<ServerHarness> {
    SERVER_BUILD
        .ensure(&config.server, config.build.as_ref())
        .await?;

    ServerHarness::launch(config).await
}

impl ServerHarness {
    /// Launch without building.
    pub async fn launch(config: &HarnessConfig) -> Result<Self> {
        let config_dir = tempfile::Builder::new().prefix("boxcat-").tempdir()?;

        let mut launched = match config.launch.strategy {
            ListenStrategy::InheritFd => launch_inherited(config, config_dir.path()).await?,
            ListenStrategy::EphemeralPort => launch_ephemeral(config, config_dir.path()).await?,
        };

        let name = config.server.name.clone();
        let pid = launched.child.id();

        let mut log_drains = Vec::with_capacity(2);
        if let Some(stderr) = launched.child.stderr.take() {
            log_drains.push(spawn_log_drain(format!("{name} stderr"), stderr));
        }
        if let Some(stdout) = launched.child.stdout.take() {
            log_drains.push(spawn_log_drain(format!("{name} stdout"), stdout));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let exit_task = tokio::spawn(watch_exit(name.clone(), launched.child, kill_rx));

        info!("{} listening on 127.0.0.1:{} (pid {:?})", name, launched.port, pid);

        Ok(Self {
            name,
            port: launched.port,
            pid,
            config_dir,
            kill_tx,
            exit_task,
            log_drains,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn config_dir(&self) -> &Path {
        self.config_dir.path()
    }

    /// Kill the server, wait for its exit and both log drains, then remove
    /// the temporary config directory.
    ///
    /// Returns the exit status, or `None` if it could not be collected.
    pub async fn stop(self) -> Result<Option<ExitStatus>> {
        let Self {
            name,
            config_dir,
            kill_tx,
            exit_task,
            log_drains,
            ..
        } = self;

        // Err: the server already exited on its own.
        let _ = kill_tx.send(());

        let status = match exit_task.await {
            Ok(status) => status,
            Err(e) => {
                error!("{}: exit watcher failed: {}", name, e);
                None
            }
        };

        for drain in log_drains {
            if let Err(e) = drain.await {
                error!("{}: log drain failed: {}", name, e);
            }
        }

        config_dir.close().map_err(|e| {
            BoxcatError::Io(std::io::Error::new(
                e.kind(),
                format!("error cleaning up temporary directory: {e}"),
            ))
        })?;

        info!("{} stopped", name);
        Ok(status)
    }
}

async fn watch_exit(name: String, mut child: Child, kill_rx: oneshot::Receiver<()>) -> Option<ExitStatus> {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => {
                warn!("{} exited: {}", name, status);
                Some(status)
            }
            Err(e) => {
                error!("{}: error waiting for exit: {}", name, e);
                None
            }
        },
        // Fires on stop() and when the harness is dropped.
        _ = kill_rx => {
            if let Err(e) = child.kill().await {
                error!("{}: error killing: {}", name, e);
            }
            match child.wait().await {
                Ok(status) => {
                    debug!("{} killed: {}", name, status);
                    Some(status)
                }
                Err(e) => {
                    error!("{}: error waiting for exit: {}", name, e);
                    None
                }
            }
        }
    }
}

async fn launch_inherited(config: &HarnessConfig, dir: &Path) -> Result<Launched> {
    let listener = InheritedListener::bind()?;
    let port = listener.port();

    let conf = ServerConf {
        listen_port: INHERITED_PORT,
        server_name: config.server.name.clone(),
    };
    let conf_path = conf.write_to(dir).await?;

    let mut child = spawn_server(config, &conf_path, Some(listener.raw_fd()))?;
    // The child holds its own copy now.
    drop(listener);

    wait_until_ready(&mut child, port, &config.launch).await?;
    Ok(Launched { child, port })
}

async fn launch_ephemeral(config: &HarnessConfig, dir: &Path) -> Result<Launched> {
    let attempts = config.launch.start_attempts;
    let mut last_error = None;

    for attempt in 1..=attempts {
        let port = ephemeral_port()?;
        let conf = ServerConf {
            listen_port: i32::from(port),
            server_name: config.server.name.clone(),
        };
        let conf_path = conf.write_to(dir).await?;

        let mut child = spawn_server(config, &conf_path, None)?;
        match wait_until_ready(&mut child, port, &config.launch).await {
            Ok(()) => return Ok(Launched { child, port }),
            Err(e) => {
                warn!(
                    "{} failed to start on port {} (attempt {}/{}): {}",
                    config.server.name, port, attempt, attempts, e
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        BoxcatError::Launch(format!("gave up trying to start {}", config.server.name))
    }))
}

fn spawn_server(config: &HarnessConfig, conf_path: &Path, listen_fd: Option<RawFd>) -> Result<Child> {
    let binary = config.server.binary_path();

    let mut cmd = Command::new(binary.as_std_path());
    cmd.current_dir(&config.server.directory)
        .args(&config.server.args)
        .arg(&config.server.conf_flag)
        .arg(conf_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(fd) = listen_fd {
        cmd.arg(&config.server.listen_fd_flag)
            .arg(INHERITED_FD.to_string());
        // SAFETY: inherit_listener only calls dup2/fcntl, which are
        // async-signal-safe. `fd` is a plain integer captured by value.
        unsafe {
            cmd.pre_exec(move || inherit_listener(fd));
        }
    }

    debug!("Launching {} with config {}", binary, conf_path.display());
    cmd.spawn()
        .map_err(|e| BoxcatError::Launch(format!("error starting {binary}: {e}")))
}

/// Poll-connect until the server accepts, it exits, or the timeout passes.
/// On failure the child is killed and its output attached to the error.
async fn wait_until_ready(child: &mut Child, port: u16, launch: &LaunchConfig) -> Result<()> {
    let address = format!("127.0.0.1:{port}");
    let deadline = Instant::now() + launch.ready_timeout();

    let reason = loop {
        match child.try_wait() {
            Ok(Some(status)) => break format!("exited during startup: {status}"),
            Ok(None) => {}
            Err(e) => break format!("error checking process: {e}"),
        }

        if let Ok(Ok(stream)) = timeout(launch.poll_interval(), TcpStream::connect(&address)).await {
            drop(stream);
            return Ok(());
        }

        if Instant::now() >= deadline {
            break format!("not accepting connections after {:?}", launch.ready_timeout());
        }
        sleep(launch.poll_interval()).await;
    };

    if let Err(e) = child.kill().await {
        debug!("kill after failed start: {}", e);
    }

    let stderr = read_leftover(child.stderr.take()).await;
    let stdout = read_leftover(child.stdout.take()).await;

    Err(BoxcatError::NotReady {
        address,
        reason,
        stderr,
        stdout,
    })
}

async fn read_leftover<R: AsyncRead + Unpin>(stream: Option<R>) -> String {
    let Some(mut stream) = stream else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = timeout(OUTPUT_GRACE, stream.read_to_end(&mut buf)).await {
        debug!("gave up reading server output: {}", e);
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}
