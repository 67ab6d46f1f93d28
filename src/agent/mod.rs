pub mod bootstrap;
pub mod script;

use crate::index::{FileIndex, IndexSet};
use crate::protocol::{
    encode_command, parse_frame, Frame, IndexArgs, LogMessage, Query, QueryArgs,
};
use crate::resolve::ConnectionDescriptor;
use crate::transport::{ConnGuard, ConnUpdate, ShellTransport, TransportError};
use bootstrap::BootstrapParams;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a cancelled query may take to produce its terminal frame before
/// the transport is torn down.
pub const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// Log-source token selecting the system journal instead of files.
pub const JOURNAL_SOURCE: &str = "journalctl";

const DEBUG_TAIL_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Disconnected,
    Connecting,
    Idle,
    Busy,
    Failed,
}

/// Error taxonomy surfaced per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    ConfigInvalid,
    Timeout,
    TransportFailure,
    BootstrapError,
    ProtocolError,
    RemoteFailure,
    /// An `execute` call raced an in-flight query.
    Busy,
}

#[derive(Debug, Clone)]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
    /// Recent remote stderr/debug lines, newest last.
    pub debug_tail: Vec<String>,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            debug_tail: Vec::new(),
        }
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StreamError {}

/// One frame of a result stream.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    Histogram { minute: i64, count: u64 },
    Message(LogMessage),
    Stderr(String),
    Done {
        total: u64,
        error: Option<StreamError>,
    },
}

enum AgentCommand {
    Connect {
        updates: Option<mpsc::Sender<ConnUpdate>>,
        done: oneshot::Sender<Result<(), StreamError>>,
    },
    Execute {
        query: Query,
        frames: mpsc::Sender<ExecEvent>,
        accepted: oneshot::Sender<Result<(), StreamError>>,
    },
    Cancel,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    DebugTail {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Message-passing handle to one per-host agent task.
#[derive(Clone)]
pub struct AgentHandle {
    stream_id: String,
    cmd_tx: mpsc::Sender<AgentCommand>,
    status_rx: watch::Receiver<AgentStatus>,
}

impl AgentHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn status(&self) -> AgentStatus {
        *self.status_rx.borrow()
    }

    /// Watchable status for callers that want change notifications.
    pub fn status_watch(&self) -> watch::Receiver<AgentStatus> {
        self.status_rx.clone()
    }

    pub async fn connect(&self) -> Result<(), StreamError> {
        self.connect_with_updates(None).await
    }

    pub async fn connect_with_updates(
        &self,
        updates: Option<mpsc::Sender<ConnUpdate>>,
    ) -> Result<(), StreamError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(AgentCommand::Connect {
            updates,
            done: done_tx,
        })
        .await?;
        done_rx
            .await
            .unwrap_or_else(|_| Err(agent_gone_error()))
    }

    /// Start one query. Frames arrive on `frames`; the returned result only
    /// reports acceptance (`Busy` when a query is already in flight).
    pub async fn execute(
        &self,
        query: Query,
        frames: mpsc::Sender<ExecEvent>,
    ) -> Result<(), StreamError> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        self.send(AgentCommand::Execute {
            query,
            frames,
            accepted: accepted_tx,
        })
        .await?;
        accepted_rx
            .await
            .unwrap_or_else(|_| Err(agent_gone_error()))
    }

    pub async fn cancel(&self) {
        let _ = self.cmd_tx.send(AgentCommand::Cancel).await;
    }

    pub async fn disconnect(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(AgentCommand::Disconnect { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    pub async fn debug_tail(&self) -> Vec<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(AgentCommand::DebugTail { reply: reply_tx })
            .await
            .is_ok()
        {
            return reply_rx.await.unwrap_or_default();
        }
        Vec::new()
    }

    async fn send(&self, cmd: AgentCommand) -> Result<(), StreamError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| agent_gone_error())
    }
}

fn agent_gone_error() -> StreamError {
    StreamError::new(StreamErrorKind::TransportFailure, "agent task is gone")
}

/// Spawn the agent task for one connection descriptor.
pub fn spawn_agent(
    descriptor: ConnectionDescriptor,
    transport: Box<dyn ShellTransport>,
    bootstrap: BootstrapParams,
) -> AgentHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (status_tx, status_rx) = watch::channel(AgentStatus::Disconnected);
    let stream_id = descriptor.stream_id.clone();

    let task = AgentTask {
        descriptor,
        transport,
        bootstrap,
        status_tx,
        conn: None,
        indexes: IndexSet::new(),
        probed_sources: None,
        debug_tail: VecDeque::new(),
    };
    tokio::spawn(task.run(cmd_rx));

    AgentHandle {
        stream_id,
        cmd_tx,
        status_rx,
    }
}

struct Connection {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout_lines: mpsc::Receiver<String>,
    stderr_lines: mpsc::UnboundedReceiver<String>,
    guard: Box<dyn ConnGuard>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    async fn close(mut self) {
        let _ = self.stdin.shutdown().await;
        self.guard.terminate();
        self.reader_task.abort();
    }
}

enum Event {
    StdoutLine(String),
    StderrLine(String),
    StdoutClosed,
    Cmd(AgentCommand),
    CmdChannelClosed,
}

async fn next_event(conn: &mut Connection, cmd_rx: &mut mpsc::Receiver<AgentCommand>) -> Event {
    tokio::select! {
        line = conn.stdout_lines.recv() => match line {
            Some(line) => Event::StdoutLine(line),
            None => Event::StdoutClosed,
        },
        Some(line) = conn.stderr_lines.recv() => Event::StderrLine(line),
        cmd = cmd_rx.recv() => match cmd {
            Some(cmd) => Event::Cmd(cmd),
            None => Event::CmdChannelClosed,
        },
    }
}

/// What ended an in-flight query, besides normal terminal frames.
enum ExecEnd {
    Finished {
        total: u64,
        error: Option<StreamError>,
    },
    /// Terminal frame never arrived; the transport was torn down.
    Broken(StreamError),
    /// Disconnect requested mid-query.
    Disconnected,
}

struct AgentTask {
    descriptor: ConnectionDescriptor,
    transport: Box<dyn ShellTransport>,
    bootstrap: BootstrapParams,
    status_tx: watch::Sender<AgentStatus>,
    conn: Option<Connection>,
    indexes: IndexSet,
    probed_sources: Option<Vec<String>>,
    debug_tail: VecDeque<String>,
}

impl AgentTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<AgentCommand>) {
        loop {
            let cmd = match &mut self.conn {
                Some(conn) => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => cmd,
                        Some(line) = conn.stderr_lines.recv() => {
                            push_tail(&mut self.debug_tail, line);
                            continue;
                        }
                    }
                }
                None => cmd_rx.recv().await,
            };

            let Some(cmd) = cmd else { break };

            match cmd {
                AgentCommand::Connect { updates, done } => {
                    let result = self.handle_connect(updates).await;
                    let _ = done.send(result);
                }
                AgentCommand::Execute {
                    query,
                    frames,
                    accepted,
                } => {
                    self.handle_execute(query, frames, accepted, &mut cmd_rx).await;
                }
                AgentCommand::Cancel => {
                    // Nothing in flight.
                }
                AgentCommand::Disconnect { done } => {
                    self.handle_disconnect().await;
                    let _ = done.send(());
                }
                AgentCommand::DebugTail { reply } => {
                    let _ = reply.send(self.debug_tail.iter().cloned().collect());
                }
            }
        }

        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }

    fn set_status(&self, status: AgentStatus) {
        let _ = self.status_tx.send_replace(status);
    }

    fn stream_error(&self, kind: StreamErrorKind, message: impl Into<String>) -> StreamError {
        StreamError {
            kind,
            message: message.into(),
            debug_tail: self.debug_tail.iter().cloned().collect(),
        }
    }

    async fn handle_connect(
        &mut self,
        updates: Option<mpsc::Sender<ConnUpdate>>,
    ) -> Result<(), StreamError> {
        if self.conn.is_some() && *self.status_tx.borrow() == AgentStatus::Idle {
            return Ok(());
        }

        if let Some(old) = self.conn.take() {
            old.close().await;
        }

        self.set_status(AgentStatus::Connecting);
        info!(stream = %self.descriptor.stream_id, host = %self.descriptor.host, "connecting");

        let (updates_tx, drain) = match updates {
            Some(tx) => (tx, None),
            None => {
                // Nobody is listening; drain progress updates ourselves so
                // the transport never blocks on them.
                let (tx, mut rx) = mpsc::channel::<ConnUpdate>(16);
                let handle = tokio::spawn(async move { while rx.recv().await.is_some() {} });
                (tx, Some(handle))
            }
        };

        let connect_result = self.transport.connect(updates_tx).await;
        if let Some(handle) = drain {
            handle.abort();
        }

        let shell_conn = match connect_result {
            Ok(conn) => conn,
            Err(e) => {
                let kind = match &e {
                    TransportError::Timeout => StreamErrorKind::Timeout,
                    _ => StreamErrorKind::TransportFailure,
                };
                let err = self.stream_error(kind, e.to_string());
                self.set_status(AgentStatus::Failed);
                return Err(err);
            }
        };

        let (mut stdin, stdout, stderr_lines, guard) = shell_conn.into_parts();
        let (stdout_lines, reader_task) = spawn_stdout_lines(stdout);
        let mut stdout_lines = stdout_lines;

        let bootstrap_result = bootstrap::ensure_script(
            stdin.as_mut(),
            &mut stdout_lines,
            &self.bootstrap,
            bootstrap::DEFAULT_BOOTSTRAP_TIMEOUT,
        )
        .await;

        let mut conn = Connection {
            stdin,
            stdout_lines,
            stderr_lines,
            guard,
            reader_task,
        };

        if let Err(e) = bootstrap_result {
            // Pull in whatever stderr accumulated; it usually names the cause.
            while let Ok(line) = conn.stderr_lines.try_recv() {
                push_tail(&mut self.debug_tail, line);
            }
            conn.close().await;
            let err = self.stream_error(StreamErrorKind::BootstrapError, e.to_string());
            self.set_status(AgentStatus::Failed);
            return Err(err);
        }

        self.conn = Some(conn);
        self.set_status(AgentStatus::Idle);
        info!(stream = %self.descriptor.stream_id, "connected");
        Ok(())
    }

    async fn handle_disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        self.probed_sources = None;
        self.set_status(AgentStatus::Disconnected);
    }

    async fn handle_execute(
        &mut self,
        query: Query,
        frames: mpsc::Sender<ExecEvent>,
        accepted: oneshot::Sender<Result<(), StreamError>>,
        cmd_rx: &mut mpsc::Receiver<AgentCommand>,
    ) {
        if self.conn.is_none() || *self.status_tx.borrow() != AgentStatus::Idle {
            let _ = accepted.send(Err(self.stream_error(
                StreamErrorKind::TransportFailure,
                "agent is not connected",
            )));
            return;
        }

        let Some(mut conn) = self.conn.take() else {
            let _ = accepted.send(Err(self.stream_error(
                StreamErrorKind::TransportFailure,
                "agent is not connected",
            )));
            return;
        };
        self.set_status(AgentStatus::Busy);
        let _ = accepted.send(Ok(()));
        let end = self.exec_query(&mut conn, &query, &frames, cmd_rx).await;

        match end {
            ExecEnd::Finished { total, error } => {
                self.conn = Some(conn);
                self.set_status(AgentStatus::Idle);
                let _ = frames.send(ExecEvent::Done { total, error }).await;
            }
            ExecEnd::Broken(error) => {
                conn.close().await;
                self.set_status(AgentStatus::Failed);
                let _ = frames
                    .send(ExecEvent::Done {
                        total: 0,
                        error: Some(error),
                    })
                    .await;
            }
            ExecEnd::Disconnected => {
                conn.close().await;
                self.probed_sources = None;
                self.set_status(AgentStatus::Disconnected);
                let _ = frames
                    .send(ExecEvent::Done {
                        total: 0,
                        error: Some(StreamError::new(
                            StreamErrorKind::TransportFailure,
                            "disconnected during query",
                        )),
                    })
                    .await;
            }
        }
    }

    /// Drive one query end to end: resolve sources, refresh indexes, run
    /// the scan, pump frames.
    async fn exec_query(
        &mut self,
        conn: &mut Connection,
        query: &Query,
        frames: &mpsc::Sender<ExecEvent>,
        cmd_rx: &mut mpsc::Receiver<AgentCommand>,
    ) -> ExecEnd {
        // Phase 1: which sources does this stream read from?
        let sources = match self.resolve_sources(conn, query, frames, cmd_rx).await {
            Ok(sources) => sources,
            Err(end) => return end,
        };

        let journal = sources.len() == 1 && sources[0] == JOURNAL_SOURCE;

        // Phase 2: per-file index refresh and byte windows.
        let mut files = Vec::new();
        if !journal {
            for (file, optional) in expand_rotation_pairs(&sources) {
                let args = IndexArgs {
                    file: file.clone(),
                    rebuild: query.rebuild_index,
                };
                let line = match encode_command("IDX", &args) {
                    Ok(line) => line,
                    Err(e) => {
                        return ExecEnd::Finished {
                            total: 0,
                            error: Some(self.stream_error(
                                StreamErrorKind::ProtocolError,
                                e.to_string(),
                            )),
                        }
                    }
                };
                let reply = match self
                    .command_reply(conn, &line, frames, cmd_rx)
                    .await
                {
                    Ok(reply) => reply,
                    Err(end) => return end,
                };

                match reply.failure {
                    Some(reason) => {
                        if optional {
                            debug!(file = %file, reason = %reason, "rotated sibling unavailable");
                        } else {
                            let _ = frames
                                .send(ExecEvent::Stderr(format!("{}: {}", file, reason)))
                                .await;
                        }
                        continue;
                    }
                    None => {
                        let mut index = FileIndex::new();
                        let mut valid = true;
                        for frame in reply.frames {
                            if let Frame::IndexRow { minute, offset } = frame {
                                if let Err(e) = index.push(minute, offset) {
                                    warn!(file = %file, error = %e, "bad index row, dropping snapshot");
                                    valid = false;
                                    break;
                                }
                            }
                        }
                        let range = if valid {
                            self.indexes.replace(&file, index);
                            self.indexes
                                .get(&file)
                                .map(|i| i.byte_range(query.from_minute(), query.to_minute() - 1))
                                .unwrap_or((0, None))
                        } else {
                            (0, None)
                        };
                        files.push(crate::protocol::FileScan {
                            file,
                            start_offset: range.0,
                            end_offset: range.1,
                        });
                    }
                }
            }

            if files.is_empty() {
                return ExecEnd::Finished {
                    total: 0,
                    error: Some(self.stream_error(
                        StreamErrorKind::RemoteFailure,
                        "no readable log source on remote",
                    )),
                };
            }
        }

        // Phase 3: the scan itself.
        let args = QueryArgs {
            query_id: Uuid::new_v4().to_string(),
            from_minute: query.from_minute(),
            to_minute: query.to_minute(),
            files,
            journal,
            pattern: query.pattern.clone(),
            max_messages: query.max_messages,
            timezone: query.timezone.clone(),
        };
        let line = match encode_command("RUN", &args) {
            Ok(line) => line,
            Err(e) => {
                return ExecEnd::Finished {
                    total: 0,
                    error: Some(
                        self.stream_error(StreamErrorKind::ProtocolError, e.to_string()),
                    ),
                }
            }
        };
        debug!(stream = %self.descriptor.stream_id, query_id = %args.query_id, "running query");

        if let Err(e) = write_line(conn, &line).await {
            return ExecEnd::Broken(
                self.stream_error(StreamErrorKind::TransportFailure, e.to_string()),
            );
        }

        let mut total = 0u64;
        loop {
            match next_event(conn, cmd_rx).await {
                Event::StdoutLine(line) => match parse_frame(&line) {
                    Ok(Some(frame)) => match frame {
                        Frame::Histogram { minute, count } => {
                            let _ = frames.send(ExecEvent::Histogram { minute, count }).await;
                        }
                        Frame::Message(wire) => {
                            let msg =
                                LogMessage::from_wire(wire, &self.descriptor.stream_id);
                            let _ = frames.send(ExecEvent::Message(msg)).await;
                        }
                        Frame::Total(t) => total = t,
                        Frame::Error(e) => {
                            push_tail(&mut self.debug_tail, e.clone());
                            let _ = frames.send(ExecEvent::Stderr(e)).await;
                        }
                        Frame::Done => {
                            return ExecEnd::Finished { total, error: None }
                        }
                        Frame::Failed(reason) => {
                            return ExecEnd::Finished {
                                total,
                                error: Some(self.stream_error(
                                    StreamErrorKind::RemoteFailure,
                                    reason,
                                )),
                            }
                        }
                        // Index and source rows do not belong in a RUN reply
                        // but are harmless.
                        Frame::IndexRow { .. } | Frame::Source(_) => {}
                    },
                    Ok(None) => {}
                    Err(e) => {
                        // Framing is desynchronised; the stream cannot be
                        // trusted any more.
                        return ExecEnd::Broken(
                            self.stream_error(StreamErrorKind::ProtocolError, e.to_string()),
                        );
                    }
                },
                Event::StderrLine(line) => {
                    push_tail(&mut self.debug_tail, line.clone());
                    let _ = frames.send(ExecEvent::Stderr(line)).await;
                }
                Event::StdoutClosed => {
                    return ExecEnd::Broken(self.stream_error(
                        StreamErrorKind::TransportFailure,
                        "connection lost during query",
                    ));
                }
                Event::Cmd(AgentCommand::Cancel) => {
                    return self.cancel_and_drain(conn, frames, total).await;
                }
                Event::Cmd(AgentCommand::Execute { accepted, .. }) => {
                    let _ = accepted.send(Err(self.stream_error(
                        StreamErrorKind::Busy,
                        "a query is already in flight",
                    )));
                }
                Event::Cmd(AgentCommand::Connect { done, .. }) => {
                    let _ = done.send(Err(self.stream_error(
                        StreamErrorKind::Busy,
                        "a query is already in flight",
                    )));
                }
                Event::Cmd(AgentCommand::DebugTail { reply }) => {
                    let _ = reply.send(self.debug_tail.iter().cloned().collect());
                }
                Event::Cmd(AgentCommand::Disconnect { done }) => {
                    let _ = done.send(());
                    return ExecEnd::Disconnected;
                }
                Event::CmdChannelClosed => return ExecEnd::Disconnected,
            }
        }
    }

    async fn resolve_sources(
        &mut self,
        conn: &mut Connection,
        query: &Query,
        frames: &mpsc::Sender<ExecEvent>,
        cmd_rx: &mut mpsc::Receiver<AgentCommand>,
    ) -> Result<Vec<String>, ExecEnd> {
        if let Some(source) = &query.log_source {
            return Ok(vec![source.clone()]);
        }
        if !self.descriptor.log_sources.is_empty() {
            return Ok(self.descriptor.log_sources.clone());
        }
        if let Some(cached) = &self.probed_sources {
            return Ok(cached.clone());
        }

        let reply = self.command_reply(conn, "LS\n", frames, cmd_rx).await?;
        if let Some(reason) = reply.failure {
            return Err(ExecEnd::Finished {
                total: 0,
                error: Some(self.stream_error(StreamErrorKind::RemoteFailure, reason)),
            });
        }

        let sources: Vec<String> = reply
            .frames
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Source(source) => Some(source),
                _ => None,
            })
            .collect();
        if sources.is_empty() {
            return Err(ExecEnd::Finished {
                total: 0,
                error: Some(self.stream_error(
                    StreamErrorKind::RemoteFailure,
                    "remote reported no log sources",
                )),
            });
        }

        info!(stream = %self.descriptor.stream_id, sources = ?sources, "probed log sources");
        self.probed_sources = Some(sources.clone());
        Ok(sources)
    }

    /// Send one command line and collect its reply frames up to the
    /// terminal. Commands arriving meanwhile get the busy treatment.
    async fn command_reply(
        &mut self,
        conn: &mut Connection,
        line: &str,
        frames: &mpsc::Sender<ExecEvent>,
        cmd_rx: &mut mpsc::Receiver<AgentCommand>,
    ) -> Result<CommandReply, ExecEnd> {
        if let Err(e) = write_line(conn, line).await {
            return Err(ExecEnd::Broken(
                self.stream_error(StreamErrorKind::TransportFailure, e.to_string()),
            ));
        }

        let mut collected = Vec::new();
        loop {
            match next_event(conn, cmd_rx).await {
                Event::StdoutLine(line) => match parse_frame(&line) {
                    Ok(Some(Frame::Done)) => {
                        return Ok(CommandReply {
                            frames: collected,
                            failure: None,
                        })
                    }
                    Ok(Some(Frame::Failed(reason))) => {
                        return Ok(CommandReply {
                            frames: collected,
                            failure: Some(reason),
                        })
                    }
                    Ok(Some(frame)) => collected.push(frame),
                    Ok(None) => {}
                    Err(e) => {
                        return Err(ExecEnd::Broken(
                            self.stream_error(StreamErrorKind::ProtocolError, e.to_string()),
                        ))
                    }
                },
                Event::StderrLine(line) => {
                    push_tail(&mut self.debug_tail, line.clone());
                    let _ = frames.send(ExecEvent::Stderr(line)).await;
                }
                Event::StdoutClosed => {
                    return Err(ExecEnd::Broken(self.stream_error(
                        StreamErrorKind::TransportFailure,
                        "connection lost during query",
                    )));
                }
                Event::Cmd(AgentCommand::Cancel) => {
                    return Err(self.cancel_and_drain(conn, frames, 0).await);
                }
                Event::Cmd(AgentCommand::Execute { accepted, .. }) => {
                    let _ = accepted.send(Err(self.stream_error(
                        StreamErrorKind::Busy,
                        "a query is already in flight",
                    )));
                }
                Event::Cmd(AgentCommand::Connect { done, .. }) => {
                    let _ = done.send(Err(self.stream_error(
                        StreamErrorKind::Busy,
                        "a query is already in flight",
                    )));
                }
                Event::Cmd(AgentCommand::DebugTail { reply }) => {
                    let _ = reply.send(self.debug_tail.iter().cloned().collect());
                }
                Event::Cmd(AgentCommand::Disconnect { done }) => {
                    let _ = done.send(());
                    return Err(ExecEnd::Disconnected);
                }
                Event::CmdChannelClosed => return Err(ExecEnd::Disconnected),
            }
        }
    }

    /// Soft-interrupt the remote, then drain to the terminal frame within
    /// the grace window. Overrunning the window tears the transport down.
    async fn cancel_and_drain(
        &mut self,
        conn: &mut Connection,
        frames: &mpsc::Sender<ExecEvent>,
        mut total: u64,
    ) -> ExecEnd {
        info!(stream = %self.descriptor.stream_id, "cancelling query");
        if write_line(conn, "\x03\nCANCEL\n").await.is_err() {
            return ExecEnd::Broken(self.stream_error(
                StreamErrorKind::TransportFailure,
                "connection lost during cancellation",
            ));
        }

        let drain = async {
            loop {
                match conn.stdout_lines.recv().await {
                    Some(line) => match parse_frame(&line) {
                        Ok(Some(Frame::Done)) => return Ok(None),
                        Ok(Some(Frame::Failed(reason))) => return Ok(Some(reason)),
                        Ok(Some(Frame::Total(t))) => total = t,
                        Ok(Some(_)) | Ok(None) => {}
                        Err(_) => {}
                    },
                    None => return Err(()),
                }
            }
        };

        match tokio::time::timeout(CANCEL_GRACE, drain).await {
            Ok(Ok(_reason)) => {
                // Terminal frame received: the session is still usable.
                let _ = frames
                    .send(ExecEvent::Stderr("query cancelled".to_string()))
                    .await;
                ExecEnd::Finished { total, error: None }
            }
            Ok(Err(())) => ExecEnd::Broken(self.stream_error(
                StreamErrorKind::TransportFailure,
                "connection lost during cancellation",
            )),
            Err(_) => ExecEnd::Broken(self.stream_error(
                StreamErrorKind::Timeout,
                "cancellation grace period exceeded",
            )),
        }
    }
}

struct CommandReply {
    frames: Vec<Frame>,
    failure: Option<String>,
}

/// Candidate scan files in oldest-first order. Each named file gains its
/// rotated `.1` sibling ahead of it; siblings are optional on the remote.
fn expand_rotation_pairs(sources: &[String]) -> Vec<(String, bool)> {
    let mut out: Vec<(String, bool)> = Vec::new();
    for source in sources {
        let sibling = format!("{}.1", source);
        if !source.ends_with(".1")
            && !sources.iter().any(|s| s == &sibling)
            && !out.iter().any(|(f, _)| f == &sibling)
        {
            out.push((sibling, true));
        }
        if !out.iter().any(|(f, _)| f == source) {
            out.push((source.clone(), false));
        }
    }
    out
}

async fn write_line(conn: &mut Connection, line: &str) -> std::io::Result<()> {
    conn.stdin.write_all(line.as_bytes()).await?;
    conn.stdin.flush().await
}

fn spawn_stdout_lines(
    mut reader: tokio::io::BufReader<Box<dyn tokio::io::AsyncRead + Send + Unpin>>,
) -> (mpsc::Receiver<String>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1024);
    let handle = tokio::spawn(async move {
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(trimmed).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    (rx, handle)
}

fn push_tail(tail: &mut VecDeque<String>, line: String) {
    if tail.len() >= DEBUG_TAIL_LIMIT {
        tail.pop_front();
    }
    tail.push_back(line);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_rotation_pairs() {
        let sources = vec!["/var/log/syslog".to_string()];
        let pairs = expand_rotation_pairs(&sources);
        assert_eq!(
            pairs,
            vec![
                ("/var/log/syslog.1".to_string(), true),
                ("/var/log/syslog".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_expand_rotation_pairs_explicit_sibling() {
        let sources = vec![
            "/var/log/syslog.1".to_string(),
            "/var/log/syslog".to_string(),
        ];
        let pairs = expand_rotation_pairs(&sources);
        // Explicitly listed files stay mandatory and are not duplicated.
        assert_eq!(
            pairs,
            vec![
                ("/var/log/syslog.1".to_string(), false),
                ("/var/log/syslog".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_push_tail_bounded() {
        let mut tail = VecDeque::new();
        for i in 0..100 {
            push_tail(&mut tail, format!("line {}", i));
        }
        assert_eq!(tail.len(), DEBUG_TAIL_LIMIT);
        assert_eq!(tail.front().unwrap(), "line 50");
        assert_eq!(tail.back().unwrap(), "line 99");
    }
}
