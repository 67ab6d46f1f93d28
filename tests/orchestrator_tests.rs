//! Fan-out/fan-in tests driving the orchestrator against local /bin/sh
//! "remotes". The transport command execs `${NLHOST}`, so each configured
//! hostname decides whether that stream connects (a real shell) or fails
//! (a missing binary).

use loghive::agent::bootstrap::BootstrapParams;
use loghive::agent::StreamErrorKind;
use loghive::config::ssh::SshConfig;
use loghive::config::types::{Config, LogStreamConfig};
use loghive::config::Options;
use loghive::orchestrator::{Orchestrator, QuerySpec};
use loghive::protocol::Query;
use chrono::DateTime;
use std::collections::HashMap;
use tempfile::TempDir;

const FAKE_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
--version) echo "loghive-agent testfake"; exit 0 ;;
esac
while IFS= read -r line; do
    case "$line" in
    LS)
        echo "S /var/log/fake"
        echo "D"
        ;;
    IDX\ *)
        echo "I 6000 0"
        echo "D"
        ;;
    RUN\ *)
        echo "H 6000 2"
        echo "H 6001 1"
        enc=$(printf '%s' 'merged line' | base64)
        echo "M 360000000000000 /var/log/fake:0 $enc"
        echo "M 360060000000000 /var/log/fake:64 $enc"
        echo "M 360090000000000 /var/log/fake:128 $enc"
        echo "T 3"
        echo "D"
        ;;
    esac
done
"#;

fn fake_bootstrap(dir: &TempDir) -> BootstrapParams {
    BootstrapParams {
        script_body: FAKE_SCRIPT.to_string(),
        script_version: "testfake".to_string(),
        remote_dir: Some(dir.path().to_string_lossy().into_owned()),
    }
}

fn stream_entry(hostname: &str) -> LogStreamConfig {
    LogStreamConfig {
        hostname: hostname.to_string(),
        port: None,
        user: None,
        log_files: Some(vec!["/var/log/fake".to_string()]),
    }
}

fn options_with_local_transport() -> Options {
    let mut options = Options::default();
    // The hostname is the shell to exec: /bin/sh connects, anything else
    // fails like an unreachable host.
    options
        .set("transport", r#"custom:sh -c "exec ${NLHOST}""#)
        .unwrap();
    options
}

fn test_query() -> Query {
    let from = DateTime::from_timestamp(6000 * 60, 0).unwrap();
    let to = DateTime::from_timestamp(6060 * 60, 0).unwrap();
    Query::new(from, to)
}

#[tokio::test]
async fn test_two_streams_merge() {
    let dir_a = TempDir::new().unwrap();
    let mut log_streams = HashMap::new();
    log_streams.insert("my-a".to_string(), stream_entry("/bin/sh"));
    log_streams.insert("my-b".to_string(), stream_entry("sh"));
    let config = Config { log_streams };

    let mut orchestrator = Orchestrator::new(
        config,
        SshConfig::default(),
        options_with_local_transport(),
    )
    .with_bootstrap(fake_bootstrap(&dir_a));

    let spec = QuerySpec {
        streams: "my-*".to_string(),
        query: test_query(),
    };
    let result = orchestrator.query(&spec).await.unwrap();

    assert_eq!(result.failed_count(), 0);
    assert_eq!(result.succeeded_count(), 2);

    // Histogram counts sum across both streams.
    assert_eq!(result.histogram, vec![(6000, 4), (6001, 2)]);

    // Histogram conservation: bucket sum equals the per-stream totals.
    let histogram_sum: u64 = result.histogram.iter().map(|(_, c)| c).sum();
    let total_sum: u64 = result.per_stream.values().map(|s| s.total).sum();
    assert_eq!(histogram_sum, total_sum);

    // All six messages fit the default bound; ascending and interleaved.
    assert_eq!(result.messages.len(), 6);
    let mut sorted = result.messages.clone();
    sorted.sort_by_key(|m| (m.timestamp, m.stream_id.clone(), m.offset));
    assert_eq!(
        result.messages.iter().map(|m| m.offset).collect::<Vec<_>>(),
        sorted.iter().map(|m| m.offset).collect::<Vec<_>>()
    );

    // Equal timestamps break ties by stream id.
    assert_eq!(result.messages[0].stream_id, "my-a");
    assert_eq!(result.messages[1].stream_id, "my-b");
}

#[tokio::test]
async fn test_partial_failure_keeps_good_stream() {
    let dir = TempDir::new().unwrap();
    let mut log_streams = HashMap::new();
    log_streams.insert("my-good".to_string(), stream_entry("/bin/sh"));
    log_streams.insert(
        "my-gone".to_string(),
        stream_entry("/definitely/not/a/shell"),
    );
    let config = Config { log_streams };

    let mut orchestrator = Orchestrator::new(
        config,
        SshConfig::default(),
        options_with_local_transport(),
    )
    .with_bootstrap(fake_bootstrap(&dir));

    let spec = QuerySpec {
        streams: "my-*".to_string(),
        query: test_query(),
    };
    let result = orchestrator.query(&spec).await.unwrap();

    assert_eq!(result.succeeded_count(), 1);
    assert_eq!(result.failed_count(), 1);

    let gone = &result.per_stream["my-gone"];
    assert_eq!(
        gone.error.as_ref().unwrap().kind,
        StreamErrorKind::TransportFailure
    );

    let good = &result.per_stream["my-good"];
    assert!(good.error.is_none());
    assert_eq!(good.total, 3);
    assert_eq!(result.messages.len(), 3);
}

#[tokio::test]
async fn test_message_bound_trims_to_latest() {
    let dir = TempDir::new().unwrap();
    let mut log_streams = HashMap::new();
    log_streams.insert("my-a".to_string(), stream_entry("/bin/sh"));
    log_streams.insert("my-b".to_string(), stream_entry("sh"));
    let config = Config { log_streams };

    let mut orchestrator = Orchestrator::new(
        config,
        SshConfig::default(),
        options_with_local_transport(),
    )
    .with_bootstrap(fake_bootstrap(&dir));

    let mut query = test_query();
    query.max_messages = 2;
    let spec = QuerySpec {
        streams: "my-*".to_string(),
        query,
    };
    let result = orchestrator.query(&spec).await.unwrap();

    // Six candidates, bound two: only the newest timestamp survives, from
    // both streams.
    assert_eq!(result.messages.len(), 2);
    for message in &result.messages {
        assert_eq!(message.timestamp.timestamp(), 360090);
    }

    // Histogram is not truncated alongside.
    let histogram_sum: u64 = result.histogram.iter().map(|(_, c)| c).sum();
    assert_eq!(histogram_sum, 6);
}

#[tokio::test]
async fn test_unknown_spec_aborts() {
    let mut orchestrator = Orchestrator::new(
        Config::default(),
        SshConfig::default(),
        options_with_local_transport(),
    );
    let spec = QuerySpec {
        streams: "absent-*".to_string(),
        query: test_query(),
    };
    assert!(orchestrator.query(&spec).await.is_err());
}

#[tokio::test]
async fn test_agents_are_reused_between_queries() {
    let dir = TempDir::new().unwrap();
    let mut log_streams = HashMap::new();
    log_streams.insert("my-a".to_string(), stream_entry("/bin/sh"));
    let config = Config { log_streams };

    let mut orchestrator = Orchestrator::new(
        config,
        SshConfig::default(),
        options_with_local_transport(),
    )
    .with_bootstrap(fake_bootstrap(&dir));

    let spec = QuerySpec {
        streams: "my-a".to_string(),
        query: test_query(),
    };
    let first = orchestrator.query(&spec).await.unwrap();
    let second = orchestrator.query(&spec).await.unwrap();

    assert_eq!(first.messages.len(), second.messages.len());
    assert_eq!(orchestrator.agent_statuses().len(), 1);
}
