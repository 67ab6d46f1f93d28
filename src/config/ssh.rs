use std::path::{Path, PathBuf};
use tracing::warn;

/// Restricted view of the user's SSH client configuration.
///
/// Only `Host` patterns and the `HostName`, `Port`, `User` and `IdentityFile`
/// keywords are read. Everything else in the file is ignored.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<HostBlock>,
}

#[derive(Debug, Clone, Default)]
struct HostBlock {
    patterns: Vec<String>,
    host_name: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    identity_file: Option<PathBuf>,
}

/// Connection parameters resolved for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshHostParams {
    pub host_name: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl SshConfig {
    /// The conventional location, `~/.ssh/config`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".ssh/config"))
    }

    /// Parse an SSH config file. A missing file yields an empty config.
    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut blocks = Vec::new();
        let mut current: Option<HostBlock> = None;

        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, rest) = match split_keyword(line) {
                Some(parts) => parts,
                None => continue,
            };

            match keyword.to_ascii_lowercase().as_str() {
                "host" => {
                    if let Some(block) = current.take() {
                        blocks.push(block);
                    }
                    current = Some(HostBlock {
                        patterns: rest.split_whitespace().map(str::to_string).collect(),
                        ..HostBlock::default()
                    });
                }
                "hostname" => {
                    if let Some(block) = &mut current {
                        block.host_name = Some(rest.to_string());
                    }
                }
                "port" => {
                    if let Some(block) = &mut current {
                        match rest.parse() {
                            Ok(port) => block.port = Some(port),
                            Err(_) => warn!(line = raw_line, "ignoring unparseable Port"),
                        }
                    }
                }
                "user" => {
                    if let Some(block) = &mut current {
                        block.user = Some(rest.to_string());
                    }
                }
                "identityfile" => {
                    if let Some(block) = &mut current {
                        block.identity_file =
                            Some(crate::config::expand_tilde(Path::new(rest)));
                    }
                }
                _ => {}
            }
        }

        if let Some(block) = current {
            blocks.push(block);
        }

        Self { blocks }
    }

    /// Host patterns that are plain names (no glob metacharacters, no
    /// negation). These participate in host-spec glob expansion.
    pub fn literal_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for block in &self.blocks {
            for pattern in &block.patterns {
                if !pattern.contains(['*', '?', '!']) {
                    hosts.push(pattern.clone());
                }
            }
        }
        hosts
    }

    /// Resolve the effective parameters for one host. Per SSH semantics the
    /// first obtained value for each field wins.
    pub fn lookup(&self, host: &str) -> SshHostParams {
        let mut params = SshHostParams::default();

        for block in &self.blocks {
            if !block.patterns.iter().any(|p| pattern_matches(p, host)) {
                continue;
            }
            if params.host_name.is_none() {
                params.host_name = block.host_name.clone();
            }
            if params.port.is_none() {
                params.port = block.port;
            }
            if params.user.is_none() {
                params.user = block.user.clone();
            }
            if params.identity_file.is_none() {
                params.identity_file = block.identity_file.clone();
            }
        }

        params
    }
}

fn split_keyword(line: &str) -> Option<(&str, &str)> {
    // SSH config allows both "Key value" and "Key=value".
    let (keyword, rest) = match line.split_once(['=', ' ', '\t']) {
        Some(parts) => parts,
        None => return None,
    };
    let rest = rest.trim();
    if rest.is_empty() {
        return None;
    }
    Some((keyword.trim(), rest))
}

fn pattern_matches(pattern: &str, host: &str) -> bool {
    if let Some(negated) = pattern.strip_prefix('!') {
        // Restricted subset: treat a negated pattern as a non-match rather
        // than implementing full exclusion semantics.
        return negated == host;
    }
    match glob::Pattern::new(pattern) {
        Ok(compiled) => compiled.matches(host),
        Err(_) => pattern == host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# comment
Host web-01 web-02
    HostName web-01.internal
    User deploy
    Port 2200

Host my-*
    User fleet
    IdentityFile ~/.ssh/fleet_ed25519

Host *
    User fallback
"#;

    #[test]
    fn test_literal_hosts() {
        let config = SshConfig::parse(SAMPLE);
        assert_eq!(config.literal_hosts(), vec!["web-01", "web-02"]);
    }

    #[test]
    fn test_lookup_first_match_wins() {
        let config = SshConfig::parse(SAMPLE);
        let params = config.lookup("web-01");
        assert_eq!(params.host_name.as_deref(), Some("web-01.internal"));
        assert_eq!(params.port, Some(2200));
        // "Host web-01" wins over "Host *" for User.
        assert_eq!(params.user.as_deref(), Some("deploy"));
    }

    #[test]
    fn test_lookup_glob_block() {
        let config = SshConfig::parse(SAMPLE);
        let params = config.lookup("my-db");
        assert_eq!(params.user.as_deref(), Some("fleet"));
        assert!(params.identity_file.is_some());
        assert!(params.host_name.is_none());
    }

    #[test]
    fn test_lookup_fallback_block() {
        let config = SshConfig::parse(SAMPLE);
        let params = config.lookup("unrelated");
        assert_eq!(params.user.as_deref(), Some("fallback"));
        assert_eq!(params.port, None);
    }

    #[test]
    fn test_equals_separator() {
        let config = SshConfig::parse("Host a\nPort=22\nUser=x\n");
        let params = config.lookup("a");
        assert_eq!(params.port, Some(22));
        assert_eq!(params.user.as_deref(), Some("x"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let config = SshConfig::load(Path::new("/nonexistent/ssh_config")).unwrap();
        assert!(config.literal_hosts().is_empty());
    }
}
