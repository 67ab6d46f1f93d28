pub mod merge;

use crate::agent::{
    bootstrap::BootstrapParams, spawn_agent, AgentHandle, AgentStatus, ExecEvent,
};
use crate::config::options::Options;
use crate::config::ssh::SshConfig;
use crate::config::types::Config;
use crate::protocol::Query;
use crate::resolve::{resolve_host_spec, ResolveError};
use crate::transport;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use merge::{AggregatedResult, ResultMerger, StreamSummary};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad spec, no hosts matched: nothing was attempted.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// One user query: which streams, and what to ask them.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    /// Comma-separated host spec, globs allowed.
    pub streams: String,
    pub query: Query,
}

/// Owns the per-host agents; fans queries out and merges the results.
pub struct Orchestrator {
    config: Config,
    ssh_config: SshConfig,
    options: Options,
    bootstrap: BootstrapParams,
    agents: HashMap<String, AgentHandle>,
}

impl Orchestrator {
    pub fn new(config: Config, ssh_config: SshConfig, options: Options) -> Self {
        Self {
            config,
            ssh_config,
            options,
            bootstrap: BootstrapParams::default(),
            agents: HashMap::new(),
        }
    }

    /// Replace the bootstrap parameters (script body, version, remote dir).
    pub fn with_bootstrap(mut self, bootstrap: BootstrapParams) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Current status per known stream.
    pub fn agent_statuses(&self) -> Vec<(String, AgentStatus)> {
        let mut statuses: Vec<(String, AgentStatus)> = self
            .agents
            .iter()
            .map(|(id, agent)| (id.clone(), agent.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub async fn debug_tail(&self, stream_id: &str) -> Option<Vec<String>> {
        match self.agents.get(stream_id) {
            Some(agent) => Some(agent.debug_tail().await),
            None => None,
        }
    }

    pub async fn disconnect_all(&mut self) {
        for agent in self.agents.values() {
            agent.disconnect().await;
        }
    }

    /// Run one query against every stream the spec resolves to.
    pub async fn query(&mut self, spec: &QuerySpec) -> Result<AggregatedResult, OrchestratorError> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.query_with_cancel(spec, cancel_rx).await
    }

    /// Like [`query`], aborting in-flight executions when `cancel` flips to
    /// true. The aggregate is still returned with whatever arrived.
    pub async fn query_with_cancel(
        &mut self,
        spec: &QuerySpec,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<AggregatedResult, OrchestratorError> {
        let descriptors = resolve_host_spec(&spec.streams, &self.config, &self.ssh_config)?;
        info!(streams = descriptors.len(), "query fan-out");

        let mut query = spec.query.clone();
        query.timezone = self.options.timezone.remote_name().to_string();

        let mut merger = ResultMerger::new(query.max_messages);

        // Make sure every referenced agent exists.
        for desc in &descriptors {
            if !self.agents.contains_key(&desc.stream_id) {
                let transport =
                    transport::for_descriptor(&self.options.transport, desc, &self.ssh_config);
                let agent = spawn_agent(desc.clone(), transport, self.bootstrap.clone());
                self.agents.insert(desc.stream_id.clone(), agent.clone());
            }
        }

        // Connect whatever is not idle yet, in parallel. A failed connect
        // becomes a per-stream error; it never aborts the query.
        let mut connect_tasks = Vec::new();
        for desc in &descriptors {
            let agent = self.agents[&desc.stream_id].clone();
            if agent.status() != AgentStatus::Idle {
                connect_tasks.push(tokio::spawn(async move {
                    let result = agent.connect().await;
                    (agent.stream_id().to_string(), result)
                }));
            }
        }
        let mut failed: HashSet<String> = HashSet::new();
        for task in connect_tasks {
            if let Ok((stream_id, result)) = task.await {
                if let Err(error) = result {
                    warn!(stream = %stream_id, error = %error, "connect failed");
                    merger.fail_stream(&stream_id, error);
                    failed.insert(stream_id);
                }
            }
        }

        // Fan out, multiplexing every stream's frames into one channel.
        let (mux_tx, mut mux_rx) = mpsc::channel::<(String, ExecEvent)>(256);
        let mut pending: HashSet<String> = HashSet::new();

        for desc in &descriptors {
            if failed.contains(&desc.stream_id) {
                continue;
            }
            let agent = self.agents[&desc.stream_id].clone();
            let (frames_tx, mut frames_rx) = mpsc::channel::<ExecEvent>(64);

            match agent.execute(query.clone(), frames_tx).await {
                Ok(()) => {
                    pending.insert(desc.stream_id.clone());
                    let mux = mux_tx.clone();
                    let stream_id = desc.stream_id.clone();
                    tokio::spawn(async move {
                        while let Some(event) = frames_rx.recv().await {
                            if mux.send((stream_id.clone(), event)).await.is_err() {
                                break;
                            }
                        }
                    });
                }
                Err(error) => {
                    warn!(stream = %desc.stream_id, error = %error, "execute rejected");
                    merger.fail_stream(&desc.stream_id, error);
                }
            }
        }
        drop(mux_tx);

        // Fan in until every stream reported its terminal frame.
        let mut cancelled = false;
        while !pending.is_empty() {
            tokio::select! {
                event = mux_rx.recv() => {
                    let Some((stream_id, event)) = event else { break };
                    match event {
                        ExecEvent::Histogram { minute, count } => {
                            merger.add_histogram(minute, count);
                        }
                        ExecEvent::Message(message) => {
                            merger.add_message(message);
                        }
                        ExecEvent::Stderr(line) => {
                            debug!(stream = %stream_id, line = %line, "remote stderr");
                        }
                        ExecEvent::Done { total, error } => {
                            pending.remove(&stream_id);
                            merger.complete_stream(&stream_id, total, error);
                        }
                    }
                }
                changed = cancel.changed(), if !cancelled => {
                    if changed.is_err() {
                        // Sender gone: cancellation can never arrive.
                        cancelled = true;
                    } else if *cancel.borrow() {
                        cancelled = true;
                        info!("cancelling {} in-flight streams", pending.len());
                        for stream_id in &pending {
                            self.agents[stream_id].cancel().await;
                        }
                    }
                }
            }
        }

        let result = merger.finalize();
        info!(
            succeeded = result.succeeded_count(),
            failed = result.failed_count(),
            messages = result.messages.len(),
            "query complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_aborts_before_connecting() {
        let orchestrator = Orchestrator::new(
            Config::default(),
            SshConfig::default(),
            Options::default(),
        );
        // Glob against an empty config cannot match.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let mut orchestrator = orchestrator;
        let spec = QuerySpec {
            streams: "nothing-*".to_string(),
            query: Query::new(
                chrono::DateTime::from_timestamp(0, 0).unwrap(),
                chrono::DateTime::from_timestamp(60, 0).unwrap(),
            ),
        };
        let result = runtime.block_on(orchestrator.query(&spec));
        assert!(matches!(
            result,
            Err(OrchestratorError::Resolve(ResolveError::NoHostsMatched(_)))
        ));
        assert!(orchestrator.agent_statuses().is_empty());
    }
}
