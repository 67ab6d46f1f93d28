use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level logstreams configuration, loaded from YAML.
///
/// `log_streams` maps a logical stream name to its connection parameters.
/// Logical names may be referenced directly in a host spec or matched by
/// glob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log_streams: HashMap<String, LogStreamConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogStreamConfig {
    pub hostname: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub user: Option<String>,

    /// Ordered list of candidate log files. When absent, the remote probes
    /// standard locations on first query.
    #[serde(default)]
    pub log_files: Option<Vec<String>>,
}
