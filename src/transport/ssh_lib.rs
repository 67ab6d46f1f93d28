use super::{
    await_marker, spawn_stderr_reader, ConnGuard, ConnUpdate, ShellConn, ShellTransport,
    TransportError, DEFAULT_CONNECT_TIMEOUT,
};
use crate::config::ssh::{SshConfig, SshHostParams};
use crate::resolve::ConnectionDescriptor;
use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

/// Opens a shell session through libssh2 instead of an external binary.
///
/// Host, port, user and identity file may come from the restricted SSH
/// config view; the connection descriptor wins where both specify a value.
#[derive(Clone)]
pub struct SshLibTransport {
    host: String,
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshLibTransport {
    pub fn new(desc: &ConnectionDescriptor, ssh_config: &SshConfig) -> Self {
        let SshHostParams {
            host_name,
            port,
            user,
            identity_file,
        } = ssh_config.lookup(&desc.host);

        let resolved_user = desc
            .user
            .clone()
            .or(user)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        Self {
            host: host_name.unwrap_or_else(|| desc.host.clone()),
            port: desc.port.or(port).unwrap_or(22),
            user: resolved_user,
            identity_file,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn open_session(&self) -> Result<(ssh2::Session, ssh2::Channel), TransportError> {
        let addr = format!("{}:{}", self.host, self.port);
        let socket_addr = std::net::ToSocketAddrs::to_socket_addrs(&addr)
            .map_err(|e| TransportError::ConnectFailed(format!("resolving {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| {
                TransportError::ConnectFailed(format!("no address for {}", addr))
            })?;

        let tcp = TcpStream::connect_timeout(&socket_addr, self.connect_timeout)
            .map_err(|e| TransportError::ConnectFailed(format!("connecting {}: {}", addr, e)))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| TransportError::ConnectFailed(format!("ssh session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| TransportError::ConnectFailed(format!("ssh handshake: {}", e)))?;

        self.authenticate(&session)?;

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::ConnectFailed(format!("opening channel: {}", e)))?;
        channel
            .shell()
            .map_err(|e| TransportError::ConnectFailed(format!("starting shell: {}", e)))?;

        Ok((session, channel))
    }

    fn authenticate(&self, session: &ssh2::Session) -> Result<(), TransportError> {
        // Agent auth first; it is the only way to use an encrypted key.
        match session.userauth_agent(&self.user) {
            Ok(()) => return Ok(()),
            Err(e) => debug!(error = %e, "agent authentication unavailable"),
        }

        if let Some(identity) = &self.identity_file {
            session
                .userauth_pubkey_file(&self.user, None, identity, None)
                .map_err(|e| {
                    TransportError::ConnectFailed(format!(
                        "public key authentication with {} failed (an encrypted private \
                         key requires a running ssh-agent): {}",
                        identity.display(),
                        e
                    ))
                })?;
            return Ok(());
        }

        Err(TransportError::ConnectFailed(format!(
            "no authentication method available for {}@{}",
            self.user, self.host
        )))
    }
}

struct SessionGuard {
    shutdown: Arc<AtomicBool>,
}

impl ConnGuard for SessionGuard {
    fn terminate(&mut self) {
        // The pump thread notices the flag, closes the channel and drops the
        // session, which closes the socket.
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Single pump owning the session. libssh2 must be driven from one thread
/// at a time, so stdin, stdout and stderr are all multiplexed here over a
/// non-blocking poll loop; the async side talks to it through channels.
fn pump_session(
    session: ssh2::Session,
    mut channel: ssh2::Channel,
    stdout_tx: mpsc::UnboundedSender<Vec<u8>>,
    stderr_tx: mpsc::UnboundedSender<Vec<u8>>,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
) {
    session.set_blocking(false);

    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::new();
    let mut pending_pos = 0;
    let mut stdin_open = true;
    let mut stdout_open = true;
    let mut stderr_open = true;

    while !shutdown.load(Ordering::Relaxed) {
        let mut progressed = false;

        if stdout_open {
            match channel.read(&mut buf) {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    progressed = true;
                    if stdout_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if stderr_open {
            match channel.stderr().read(&mut buf) {
                Ok(0) => stderr_open = false,
                Ok(n) => {
                    progressed = true;
                    let _ = stderr_tx.send(buf[..n].to_vec());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => stderr_open = false,
            }
        }

        if stdin_open && pending_pos >= pending.len() {
            match stdin_rx.try_recv() {
                Ok(bytes) => {
                    pending = bytes;
                    pending_pos = 0;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    stdin_open = false;
                    let _ = channel.send_eof();
                }
            }
        }
        if pending_pos < pending.len() {
            match channel.write(&pending[pending_pos..]) {
                Ok(n) if n > 0 => {
                    pending_pos += n;
                    progressed = true;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
        }

        if !stdout_open && channel.eof() {
            break;
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    // Dropping the senders reads as EOF on the async side.
    let _ = channel.close();
    drop(session);
}

/// AsyncRead over the byte chunks the pump emits. A closed channel is EOF.
struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            rx,
            leftover: Vec::new(),
            pos: 0,
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pos < this.leftover.len() {
                let n = buf.remaining().min(this.leftover.len() - this.pos);
                buf.put_slice(&this.leftover[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    this.leftover = bytes;
                    this.pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// AsyncWrite handing byte chunks to the pump. Shutdown drops the sender,
/// which the pump turns into a channel EOF.
struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ChannelWriter {
    fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match &this.tx {
            Some(tx) if tx.send(data.to_vec()).is_ok() => Poll::Ready(Ok(data.len())),
            _ => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "ssh session is gone",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.get_mut().tx = None;
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl ShellTransport for SshLibTransport {
    async fn connect(
        &self,
        updates: mpsc::Sender<ConnUpdate>,
    ) -> Result<ShellConn, TransportError> {
        let _ = updates
            .send(ConnUpdate::new(format!(
                "Connecting to {}@{}:{} over libssh2",
                self.user, self.host, self.port
            )))
            .await;
        info!(host = %self.host, port = self.port, user = %self.user, "ssh-lib connect");

        let host = self.host.clone();
        let transport = self.clone();
        let (session, channel) = tokio::task::spawn_blocking(move || transport.open_session())
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("join error: {}", e)))?
            .map_err(|e| {
                warn!(host = %host, error = %e, "ssh-lib connection failed");
                e
            })?;

        let _ = updates
            .send(ConnUpdate::new(
                "Shell channel open, writing the connection marker",
            ))
            .await;

        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        {
            let shutdown = shutdown.clone();
            std::thread::spawn(move || {
                pump_session(session, channel, stdout_tx, stderr_tx, stdin_rx, shutdown)
            });
        }

        let mut stderr_lines = spawn_stderr_reader(Box::new(ChannelReader::new(stderr_rx)));

        let mut stdin: Box<dyn AsyncWrite + Send + Unpin> =
            Box::new(ChannelWriter::new(stdin_tx));
        let stdout: Box<dyn AsyncRead + Send + Unpin> = Box::new(ChannelReader::new(stdout_rx));

        let mut guard = SessionGuard { shutdown };

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
                guard.terminate();
                return Err(e);
            }
        };

        let _ = updates
            .send(ConnUpdate::new("Got the marker, connected successfully"))
            .await;

        Ok(ShellConn::new(stdin, reader, stderr_lines, Box::new(guard)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_channel_reader_delivers_chunks_then_eof() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reader = ChannelReader::new(rx);

        tx.send(b"hello ".to_vec()).unwrap();
        tx.send(b"world".to_vec()).unwrap();
        drop(tx);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_channel_reader_partial_reads() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reader = ChannelReader::new(rx);
        tx.send(b"abcdef".to_vec()).unwrap();
        drop(tx);

        let mut buf = [0u8; 4];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_channel_writer_forwards_and_shutdown_closes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writer = ChannelWriter::new(tx);

        writer.write_all(b"payload").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"payload");

        writer.shutdown().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(writer.write_all(b"late").await.is_err());
    }
}
