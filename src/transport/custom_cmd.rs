use super::{
    await_marker, expand, spawn_stderr_reader, ConnGuard, ConnUpdate, ShellConn, ShellTransport,
    TransportError, DEFAULT_CONNECT_TIMEOUT,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Opens a shell session by running an external command (such as ssh).
///
/// The command string is interpreted by [`expand::expand_fields`], not by an
/// external shell: only `${VAR}` forms are expanded, with `env_override`
/// taking precedence over the process environment. An empty override value
/// unsets the variable entirely, so a process-environment `FOO=123` combined
/// with an override `FOO=""` reads as if `FOO` did not exist.
pub struct CustomCmdTransport {
    shell_command: String,
    env_override: HashMap<String, String>,
    connect_timeout: Duration,
}

impl CustomCmdTransport {
    pub fn new(shell_command: String, env_override: HashMap<String, String>) -> Self {
        Self {
            shell_command,
            env_override,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(value) = self.env_override.get(name) {
            if value.is_empty() {
                return None;
            }
            return Some(value.clone());
        }
        std::env::var(name).ok()
    }
}

struct ProcessGuard {
    child: Child,
}

impl ConnGuard for ProcessGuard {
    fn terminate(&mut self) {
        // Closing stdin is normally enough for a graceful exit; the kill
        // covers sessions that keep hanging (e.g. after an OS suspend).
        let _ = self.child.start_kill();
    }
}

#[async_trait]
impl ShellTransport for CustomCmdTransport {
    async fn connect(
        &self,
        updates: mpsc::Sender<ConnUpdate>,
    ) -> Result<ShellConn, TransportError> {
        let fields = expand::expand_fields(&self.shell_command, &|name| self.lookup(name))?;

        let cmd_debug: String = fields
            .iter()
            .map(|f| expand::shell_quote(f))
            .collect::<Vec<_>>()
            .join(" ");

        let _ = updates
            .send(ConnUpdate::new(format!(
                "Trying to connect using external command: {}",
                cmd_debug
            )))
            .await;
        info!(command = %cmd_debug, "executing external command");

        let mut child = Command::new(&fields[0])
            .args(&fields[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(command = %cmd_debug, error = %e, "failed to start external command");
                TransportError::ConnectFailed(format!("starting '{}': {}", cmd_debug, e))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectFailed("child stdin not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectFailed("child stdout not captured".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::ConnectFailed("child stderr not captured".to_string())
        })?;

        let mut stderr_lines = spawn_stderr_reader(Box::new(stderr));

        let _ = updates
            .send(ConnUpdate::new(
                "Command started, writing the connection marker and waiting for the echo",
            ))
            .await;

        let mut stdin: Box<dyn AsyncWrite + Send + Unpin> = Box::new(stdin);
        let stdout: Box<dyn AsyncRead + Send + Unpin> = Box::new(stdout);

        let reader = match await_marker(
            stdin.as_mut(),
            stdout,
            &mut stderr_lines,
            self.connect_timeout,
        )
        .await
        {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.start_kill();
                error!(command = %cmd_debug, error = %e, "connection failed");
                return Err(match e {
                    TransportError::ConnectFailed(stderr_text) => TransportError::ConnectFailed(
                        format!(
                            "failed to connect using external command '{}': {}",
                            cmd_debug, stderr_text
                        ),
                    ),
                    other => other,
                });
            }
        };

        let _ = updates
            .send(ConnUpdate::new("Got the marker, connected successfully"))
            .await;

        Ok(ShellConn::new(
            stdin,
            reader,
            stderr_lines,
            Box::new(ProcessGuard { child }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn transport(command: &str) -> CustomCmdTransport {
        CustomCmdTransport::new(command.to_string(), HashMap::new())
            .with_connect_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_handshake_with_real_shell() {
        let (tx, _rx) = mpsc::channel(16);
        let conn = transport("/bin/sh").connect(tx).await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn test_pre_marker_noise_is_skipped() {
        let (tx, _rx) = mpsc::channel(16);
        let conn = transport("sh -c 'echo booting; exec /bin/sh'")
            .connect(tx)
            .await
            .unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn test_post_marker_stream_is_usable() {
        let (tx, _rx) = mpsc::channel(16);
        let mut conn = transport("/bin/sh").connect(tx).await.unwrap();

        conn.stdin.write_all(b"echo hello\n").await.unwrap();
        conn.stdin.flush().await.unwrap();

        let mut line = String::new();
        conn.stdout.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim_end(), "hello");

        conn.close().await;
    }

    #[tokio::test]
    async fn test_eof_before_marker_reports_stderr() {
        let (tx, _rx) = mpsc::channel(16);
        let result = transport("sh -c 'echo kaboom >&2; exit 1'").connect(tx).await;

        match result {
            Err(TransportError::ConnectFailed(message)) => {
                assert!(message.contains("kaboom"), "message: {}", message);
            }
            other => panic!("expected ConnectFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_marker_timeout() {
        let (tx, _rx) = mpsc::channel(16);
        let result = CustomCmdTransport::new("sh -c 'sleep 30'".to_string(), HashMap::new())
            .with_connect_timeout(Duration::from_millis(200))
            .connect(tx)
            .await;
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_env_override_expands_in_command() {
        let mut env = HashMap::new();
        env.insert("SHELL_BIN".to_string(), "/bin/sh".to_string());
        let transport = CustomCmdTransport::new("${SHELL_BIN}".to_string(), env)
            .with_connect_timeout(Duration::from_secs(5));

        let (tx, _rx) = mpsc::channel(16);
        let conn = transport.connect(tx).await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn test_nonexistent_binary() {
        let (tx, _rx) = mpsc::channel(16);
        let result = transport("/definitely/not/a/binary").connect(tx).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
    }
}
