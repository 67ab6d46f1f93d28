use crate::config::ssh::SshConfig;
use crate::config::types::Config;
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("empty logstream spec")]
    EmptySpec,

    #[error("no hosts matched '{0}'")]
    NoHostsMatched(String),

    #[error("invalid glob '{pattern}': {source}")]
    InvalidGlob {
        pattern: String,
        source: glob::PatternError,
    },
}

/// Identifies one target logstream. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Stable stream id used for merging and tie-breaks.
    pub stream_id: String,
    pub host: String,
    pub port: Option<u16>,
    pub user: Option<String>,
    /// Candidate log sources in order; empty means probe on the remote at
    /// first query.
    pub log_sources: Vec<String>,
}

#[derive(Debug, Default)]
struct SpecToken {
    user: Option<String>,
    name: String,
    port: Option<u16>,
    log_file: Option<String>,
}

/// Expand a comma-separated host spec into connection descriptors.
///
/// Glob entries match against the union of logstreams-config names and SSH
/// config host names. The logstreams config is the source of truth for
/// hostname/port/user/log files when it has an entry; an explicit
/// `:logfile` suffix beats the config's `log_files`.
pub fn resolve_host_spec(
    spec: &str,
    config: &Config,
    ssh_config: &SshConfig,
) -> Result<Vec<ConnectionDescriptor>, ResolveError> {
    let tokens: Vec<&str> = spec
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.is_empty() {
        return Err(ResolveError::EmptySpec);
    }

    let mut descriptors = Vec::new();
    let mut seen = HashSet::new();

    for raw_token in tokens {
        let token = parse_token(raw_token);

        let names: Vec<String> = if is_glob(&token.name) {
            expand_glob(&token.name, config, ssh_config)?
        } else {
            vec![token.name.clone()]
        };

        for name in names {
            let descriptor = build_descriptor(&name, &token, config);
            let key = (
                descriptor.host.clone(),
                descriptor.port,
                descriptor.user.clone(),
                descriptor.log_sources.clone(),
            );
            if seen.insert(key) {
                descriptors.push(descriptor);
            }
        }
    }

    Ok(descriptors)
}

fn parse_token(raw: &str) -> SpecToken {
    let (user, rest) = match raw.split_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        _ => (None, raw),
    };

    let mut parts = rest.splitn(2, ':');
    let name = parts.next().unwrap_or_default().to_string();
    let mut token = SpecToken {
        user,
        name,
        ..SpecToken::default()
    };

    if let Some(tail) = parts.next() {
        // `host:2222`, `host:/var/log/foo`, or `host:2222:/var/log/foo`.
        match tail.split_once(':') {
            Some((first, rest)) => {
                if let Ok(port) = first.parse() {
                    token.port = Some(port);
                    token.log_file = Some(rest.to_string());
                } else {
                    token.log_file = Some(tail.to_string());
                }
            }
            None => {
                if let Ok(port) = tail.parse() {
                    token.port = Some(port);
                } else {
                    token.log_file = Some(tail.to_string());
                }
            }
        }
    }

    token
}

fn is_glob(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

fn expand_glob(
    pattern: &str,
    config: &Config,
    ssh_config: &SshConfig,
) -> Result<Vec<String>, ResolveError> {
    let compiled = glob::Pattern::new(pattern).map_err(|source| ResolveError::InvalidGlob {
        pattern: pattern.to_string(),
        source,
    })?;

    // Union of known names, config entries first, insertion-ordered and
    // deduplicated.
    let mut candidates: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut config_names: Vec<&String> = config.log_streams.keys().collect();
    config_names.sort();
    for name in config_names {
        if seen.insert(name.clone()) {
            candidates.push(name.clone());
        }
    }
    for name in ssh_config.literal_hosts() {
        if seen.insert(name.clone()) {
            candidates.push(name);
        }
    }

    let matched: Vec<String> = candidates
        .into_iter()
        .filter(|name| compiled.matches(name))
        .collect();

    if matched.is_empty() {
        warn!(pattern, "host glob matched nothing");
        return Err(ResolveError::NoHostsMatched(pattern.to_string()));
    }

    Ok(matched)
}

fn build_descriptor(name: &str, token: &SpecToken, config: &Config) -> ConnectionDescriptor {
    let entry = config.log_streams.get(name);

    let host = entry
        .map(|e| e.hostname.clone())
        .unwrap_or_else(|| name.to_string());
    let port = entry.and_then(|e| e.port).or(token.port);
    let user = entry.and_then(|e| e.user.clone()).or_else(|| token.user.clone());

    let log_sources = if let Some(file) = &token.log_file {
        vec![file.clone()]
    } else if let Some(files) = entry.and_then(|e| e.log_files.clone()) {
        files
    } else {
        Vec::new()
    };

    // The stream id mirrors how the user wrote the token, so two entries for
    // the same name (different user or log file) stay distinct streams.
    let mut stream_id = String::new();
    if let Some(user) = &token.user {
        stream_id.push_str(user);
        stream_id.push('@');
    }
    stream_id.push_str(name);
    if let Some(file) = &token.log_file {
        stream_id.push(':');
        stream_id.push_str(file);
    }

    ConnectionDescriptor {
        stream_id,
        host,
        port,
        user,
        log_sources,
    }
}
