use super::types::Config;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),
}

/// Load the logstreams config from a YAML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string)?;

    let config: Config = serde_yaml::from_str(&yaml_string)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    for (name, stream) in &config.log_streams {
        if name.trim().is_empty() {
            errors.push("log stream with empty name".to_string());
        }
        if stream.hostname.trim().is_empty() {
            errors.push(format!("log stream '{}': hostname is empty", name));
        }
        if let Some(user) = &stream.user {
            if user.trim().is_empty() {
                errors.push(format!("log stream '{}': user is empty", name));
            }
        }
        if let Some(files) = &stream.log_files {
            for file in files {
                if !file.starts_with('/') && file != "journalctl" {
                    errors.push(format!(
                        "log stream '{}': log file '{}' is not an absolute path",
                        name, file
                    ));
                }
            }
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::ValidationList(errors));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(yaml: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_minimal_config() {
        let file = write_config(
            r#"
log_streams:
  web-01:
    hostname: web-01.example.com
"#,
        );

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.log_streams.len(), 1);
        let stream = &config.log_streams["web-01"];
        assert_eq!(stream.hostname, "web-01.example.com");
        assert!(stream.port.is_none());
        assert!(stream.user.is_none());
        assert!(stream.log_files.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let file = write_config(
            r#"
log_streams:
  db-01:
    hostname: 10.0.0.5
    port: 2222
    user: ops
    log_files:
      - /var/log/syslog
      - /var/log/auth.log
"#,
        );

        let config = load_config(file.path()).unwrap();
        let stream = &config.log_streams["db-01"];
        assert_eq!(stream.port, Some(2222));
        assert_eq!(stream.user.as_deref(), Some("ops"));
        assert_eq!(
            stream.log_files.as_deref().unwrap(),
            &["/var/log/syslog".to_string(), "/var/log/auth.log".to_string()]
        );
    }

    #[test]
    fn test_empty_hostname_rejected() {
        let file = write_config(
            r#"
log_streams:
  bad:
    hostname: ""
"#,
        );

        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationList(_))));
    }

    #[test]
    fn test_relative_log_file_rejected() {
        let file = write_config(
            r#"
log_streams:
  bad:
    hostname: host
    log_files:
      - messages
"#,
        );

        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::ValidationList(_))));
    }

    #[test]
    fn test_journalctl_token_allowed() {
        let file = write_config(
            r#"
log_streams:
  jrn:
    hostname: host
    log_files:
      - journalctl
"#,
        );

        assert!(load_config(file.path()).is_ok());
    }

    #[test]
    fn test_invalid_yaml() {
        let file = write_config("log_streams: [not a map");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::YamlParse(_))));
    }
}
