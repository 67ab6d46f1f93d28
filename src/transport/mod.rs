pub mod custom_cmd;
pub mod expand;
pub mod ssh_lib;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

pub use custom_cmd::CustomCmdTransport;
pub use ssh_lib::SshLibTransport;

/// Echoed to stdin after the session starts; the session is considered
/// established once the same line comes back on stdout.
pub const MARKER_CONNECTED: &str = "__CONNECTED__";

/// Shell command used by the ssh-bin transport. Interpreted by the built-in
/// expansion in [`expand`], not by an external shell.
pub const DEFAULT_SSH_SHELL_COMMAND: &str =
    "ssh -o 'BatchMode=yes' ${NLPORT:+-p ${NLPORT}} ${NLUSER:+${NLUSER}@}${NLHOST} /bin/sh";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timeout waiting for connection marker")]
    Timeout,

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Expand(#[from] expand::ExpandError),
}

#[derive(Debug, Error)]
#[error("invalid transport mode '{0}'")]
pub struct TransportModeError(String);

/// How to reach a host: library SSH, the external ssh binary, or an
/// arbitrary custom command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMode {
    SshLib,
    SshBin,
    Custom(String),
}

impl TransportMode {
    /// Parse the string form: `ssh-lib` | `ssh-bin` | `custom:<command>`.
    pub fn parse(spec: &str) -> Result<Self, TransportModeError> {
        match spec {
            "ssh-lib" => Ok(TransportMode::SshLib),
            "ssh-bin" => Ok(TransportMode::SshBin),
            _ => match spec.strip_prefix("custom:") {
                Some(cmd) => Ok(TransportMode::Custom(cmd.to_string())),
                None => Err(TransportModeError(spec.to_string())),
            },
        }
    }

    /// The shell command for command-based modes; `None` for ssh-lib.
    pub fn shell_command(&self) -> Option<&str> {
        match self {
            TransportMode::SshLib => None,
            TransportMode::SshBin => Some(DEFAULT_SSH_SHELL_COMMAND),
            TransportMode::Custom(cmd) => Some(cmd),
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::SshLib => write!(f, "ssh-lib"),
            TransportMode::SshBin => write!(f, "ssh-bin"),
            TransportMode::Custom(cmd) => write!(f, "custom:{}", cmd),
        }
    }
}

/// Progress reported while a connection is being established.
#[derive(Debug, Clone)]
pub struct ConnUpdate {
    pub message: String,
}

impl ConnUpdate {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Terminates the underlying session once stdin close alone is not enough.
pub trait ConnGuard: Send {
    fn terminate(&mut self);
}

/// An established bidirectional shell session.
///
/// `stdout` is handed over *after* the connection marker, so the first byte
/// read belongs to the session proper.
pub struct ShellConn {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    /// Lines the remote wrote to stderr, forwarded as they arrive.
    pub stderr_lines: mpsc::UnboundedReceiver<String>,
    guard: Box<dyn ConnGuard>,
}

impl ShellConn {
    pub fn new(
        stdin: Box<dyn AsyncWrite + Send + Unpin>,
        stdout: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
        stderr_lines: mpsc::UnboundedReceiver<String>,
        guard: Box<dyn ConnGuard>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr_lines,
            guard,
        }
    }

    /// Close stdin first so a healthy remote shell exits on its own, then
    /// terminate the session for the stuck case.
    pub async fn close(mut self) {
        let _ = self.stdin.shutdown().await;
        self.guard.terminate();
    }

    /// Terminate without the graceful stdin close.
    pub fn abort(mut self) {
        self.guard.terminate();
    }

    /// Decompose into raw parts for callers that manage the streams
    /// themselves.
    #[allow(clippy::type_complexity)]
    pub fn into_parts(
        self,
    ) -> (
        Box<dyn AsyncWrite + Send + Unpin>,
        BufReader<Box<dyn AsyncRead + Send + Unpin>>,
        mpsc::UnboundedReceiver<String>,
        Box<dyn ConnGuard>,
    ) {
        (self.stdin, self.stdout, self.stderr_lines, self.guard)
    }
}

/// Capability contract all transport variants satisfy.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    /// Open a session. Progress is reported over `updates`; the established
    /// connection (or the failure) is the return value.
    async fn connect(
        &self,
        updates: mpsc::Sender<ConnUpdate>,
    ) -> Result<ShellConn, TransportError>;

    /// Whether the byte stream may be wrapped in a compressed framing. When
    /// false, payloads are base64 per line.
    fn supports_compression(&self) -> bool {
        false
    }
}

/// Build the transport for one connection descriptor.
pub fn for_descriptor(
    mode: &TransportMode,
    desc: &crate::resolve::ConnectionDescriptor,
    ssh_config: &crate::config::ssh::SshConfig,
) -> Box<dyn ShellTransport> {
    match mode {
        TransportMode::SshLib => Box::new(SshLibTransport::new(desc, ssh_config)),
        TransportMode::SshBin | TransportMode::Custom(_) => {
            let mut env = HashMap::new();
            env.insert("NLHOST".to_string(), desc.host.clone());
            if let Some(port) = desc.port {
                env.insert("NLPORT".to_string(), port.to_string());
            }
            if let Some(user) = &desc.user {
                env.insert("NLUSER".to_string(), user.clone());
            }
            let command = mode
                .shell_command()
                .unwrap_or(DEFAULT_SSH_SHELL_COMMAND)
                .to_string();
            Box::new(CustomCmdTransport::new(command, env))
        }
    }
}

/// Drive the `__CONNECTED__` handshake: write the echo, then consume stdout
/// line-by-line until the marker comes back. Returns the reader positioned
/// at the first post-marker byte.
pub(crate) async fn await_marker(
    stdin: &mut (dyn AsyncWrite + Send + Unpin),
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    stderr_lines: &mut mpsc::UnboundedReceiver<String>,
    connect_timeout: Duration,
) -> Result<BufReader<Box<dyn AsyncRead + Send + Unpin>>, TransportError> {
    let mut reader = BufReader::new(stdout);

    let wait = async {
        let echo = format!("echo {}\n", MARKER_CONNECTED);
        if stdin.write_all(echo.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            // A broken stdin means the session died immediately; the cause
            // is on stderr.
            return Err(TransportError::ConnectFailed(
                drain_stderr(stderr_lines).await,
            ));
        }

        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                // EOF before the marker: the session never came up.
                return Err(TransportError::ConnectFailed(
                    drain_stderr(stderr_lines).await,
                ));
            }
            let trimmed = line.trim_end_matches(['\n', '\r']);
            if trimmed == MARKER_CONNECTED {
                return Ok(());
            }
            debug!(line = trimmed, "pre-marker output");
        }
    };

    match tokio::time::timeout(connect_timeout, wait).await {
        Ok(Ok(())) => Ok(reader),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Collect whatever the failed session wrote to stderr. The reader task
/// closes the channel at EOF, so this normally ends promptly; the timeout
/// covers half-dead processes keeping the pipe open.
async fn drain_stderr(stderr_lines: &mut mpsc::UnboundedReceiver<String>) -> String {
    let mut text = String::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(line) = stderr_lines.recv().await {
            text.push_str(&line);
            text.push('\n');
        }
    })
    .await;
    text.trim().to_string()
}

/// Spawn a task forwarding stderr lines into an unbounded channel.
pub(crate) fn spawn_stderr_reader(
    stderr: Box<dyn AsyncRead + Send + Unpin>,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    if tx.send(trimmed.to_string()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}
