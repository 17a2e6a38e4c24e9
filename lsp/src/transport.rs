//! Byte channel to a language server.
//!
//! A [`Transport`] owns a writer task, a reader task and (for spawned
//! servers) a process watcher task. Everything the connection loop needs to
//! know arrives as a [`TransportEvent`].

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use lsprobe_types::{ClientError, ExitInfo};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const READ_CHUNK_BYTES: usize = 16 * 1024;

/// How long to wait for a killed process to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// A language server executable and how to launch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ServerCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Where the server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEndpoint {
    /// Spawn a process and talk over its stdin/stdout.
    Process(ServerCommand),
    /// Connect to a server already listening on TCP.
    Tcp { host: String, port: u16 },
    /// Connect to a server listening on a unix domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(cmd) => {
                f.write_str(&cmd.command)?;
                for arg in &cmd.args {
                    write!(f, " {arg}")?;
                }
                Ok(())
            }
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Exponential backoff for socket connects.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRetry {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
    /// Give up once this much time has passed since the first attempt.
    pub budget: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            budget: Duration::from_secs(10),
        }
    }
}

impl ConnectRetry {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A chunk of inbound bytes. No message boundary guarantees.
    Data(Vec<u8>),
    /// The read half reached EOF (`None`) or failed.
    ReadClosed(Option<String>),
    /// The server process exited. Emitted at most once.
    Exited(ExitInfo),
}

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

pub struct Transport {
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    process: Option<ProcessHandle>,
    reader_handle: JoinHandle<()>,
    grace: Duration,
    closed: bool,
}

impl Transport {
    /// Launch or connect to `endpoint`.
    ///
    /// `grace` bounds how long [`Transport::close`] waits for a process to
    /// exit on its own before killing it.
    pub async fn start(
        endpoint: &ServerEndpoint,
        retry: ConnectRetry,
        grace: Duration,
    ) -> Result<Self, ClientError> {
        match endpoint {
            ServerEndpoint::Process(cmd) => Self::spawn(cmd, grace),
            ServerEndpoint::Tcp { host, port } => {
                let addr = (host.clone(), *port);
                let stream = connect_with_retry(endpoint, retry, || {
                    tokio::net::TcpStream::connect(addr.clone())
                })
                .await?;
                let (read, write) = stream.into_split();
                Ok(Self::attach(read, write, grace))
            }
            #[cfg(unix)]
            ServerEndpoint::Unix(path) => {
                let stream =
                    connect_with_retry(endpoint, retry, || tokio::net::UnixStream::connect(path))
                        .await?;
                let (read, write) = stream.into_split();
                Ok(Self::attach(read, write, grace))
            }
        }
    }

    fn spawn(cmd: &ServerCommand, grace: Duration) -> Result<Self, ClientError> {
        let spawn_error = |reason: String| ClientError::ProcessSpawn {
            command: cmd.command.clone(),
            reason,
        };

        let resolved = which::which(&cmd.command)
            .map_err(|e| spawn_error(format!("not found in PATH: {e}")))?;
        let mut command = Command::new(&resolved);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| spawn_error(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("no stdout from child".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("no stdin from child".into()))?;
        let pid = child.id();
        tracing::info!(command = %resolved.display(), pid = ?pid, "spawned language server");

        let (mut transport, events_tx) = Self::from_parts(Box::new(stdout), Box::new(stdin), grace);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_process(child, kill_rx, exit_tx, events_tx));
        transport.process = Some(ProcessHandle {
            pid,
            kill_tx: Some(kill_tx),
            exit_rx,
        });
        Ok(transport)
    }

    /// Wrap an existing byte stream, e.g. one half of a `tokio::io::duplex`.
    pub fn attach<R, W>(reader: R, writer: W, grace: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_parts(Box::new(reader), Box::new(writer), grace).0
    }

    /// Start the reader and writer tasks. The returned sender lets a process
    /// watcher feed the same event stream.
    fn from_parts(
        reader: BoxReader,
        writer: BoxWriter,
        grace: Duration,
    ) -> (Self, mpsc::UnboundedSender<TransportEvent>) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, writer_rx));
        let reader_handle = tokio::spawn(read_loop(reader, events_tx.clone()));
        let transport = Self {
            writer_tx,
            events,
            process: None,
            reader_handle,
            grace,
            closed: false,
        };
        (transport, events_tx)
    }

    /// Enqueue bytes for delivery.
    pub fn write(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::TransportClosed("transport closed".into()));
        }
        self.writer_tx
            .send(WriterCommand::Send(bytes))
            .map_err(|_| ClientError::TransportClosed("writer task is gone".into()))
    }

    /// Next inbound event; `None` once every producer has finished.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.pid)
    }

    /// Exit status, if the process has already been reaped.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.process.as_ref().and_then(|p| *p.exit_rx.borrow())
    }

    /// Wait up to `timeout` for the process to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> Option<ExitInfo> {
        let mut rx = self.process.as_ref()?.exit_rx.clone();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(info)) => *info,
            _ => None,
        }
    }

    /// Best-effort graceful teardown: close the write half (the server's
    /// stdin), give the process `grace` to exit, then kill it.
    ///
    /// Idempotent. The exit event is produced by the watcher, never here, so a
    /// second call cannot emit another one.
    pub async fn close(&mut self) {
        self.close_within(self.grace).await;
    }

    /// [`Transport::close`] with an explicit grace period.
    pub async fn close_within(&mut self, grace: Duration) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.writer_tx.send(WriterCommand::Shutdown);

        let Some(process) = self.process.as_mut() else {
            self.reader_handle.abort();
            return;
        };
        let kill_tx = process.kill_tx.take();

        if self.wait_exit(grace).await.is_some() {
            return;
        }
        tracing::debug!(pid = ?self.pid(), "language server didn't exit in time, killing");
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }
        if self.wait_exit(KILL_WAIT).await.is_none() {
            tracing::warn!(pid = ?self.pid(), "language server did not exit after kill");
        }
    }
}

async fn write_loop(mut writer: BoxWriter, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Send(bytes) => {
                let result = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = result {
                    tracing::warn!("LSP write error: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

async fn read_loop(mut reader: BoxReader, events: mpsc::UnboundedSender<TransportEvent>) {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                let _ = events.send(TransportEvent::ReadClosed(None));
                break;
            }
            Ok(n) => {
                tracing::trace!(bytes = n, "LSP read");
                if events.send(TransportEvent::Data(chunk[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("LSP read error: {e}");
                let _ = events.send(TransportEvent::ReadClosed(Some(e.to_string())));
                break;
            }
        }
    }
}

/// Owns the child until it exits. Dropping the kill sender also kills it.
async fn watch_process(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("kill failed: {e}");
            }
            child.wait().await
        }
    };
    let info = match status {
        Ok(status) => exit_info(status),
        Err(e) => {
            tracing::warn!("waiting for language server failed: {e}");
            ExitInfo::default()
        }
    };
    tracing::info!(status = %info, "language server exited");
    exit_tx.send_replace(Some(info));
    let _ = events.send(TransportEvent::Exited(info));
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;
    ExitInfo {
        code: status.code(),
        signal,
    }
}

async fn connect_with_retry<T, F, Fut>(
    endpoint: &ServerEndpoint,
    retry: ConnectRetry,
    mut connect: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    let started = tokio::time::Instant::now();
    let mut attempt = 0;
    loop {
        match connect().await {
            Ok(stream) => {
                tracing::info!(%endpoint, attempts = attempt + 1, "connected to language server");
                return Ok(stream);
            }
            Err(e) => {
                let delay = retry.delay(attempt);
                if started.elapsed() + delay > retry.budget {
                    return Err(ClientError::ProcessSpawn {
                        command: endpoint.to_string(),
                        reason: format!("connect failed after {} attempts: {e}", attempt + 1),
                    });
                }
                tracing::debug!(%endpoint, attempt, ?delay, "connect failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
