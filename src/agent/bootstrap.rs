use super::script;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(20);

const MARKER_NO_SCRIPT: &str = "__LOGHIVE_NOSCRIPT__";
const MARKER_UPLOAD_FAILED: &str = "__LOGHIVE_UPLOAD_FAILED__";
const HEREDOC_EOF: &str = "__LOGHIVE_SCRIPT_EOF__";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("io error during bootstrap: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout waiting for bootstrap reply")]
    Timeout,

    #[error("remote shell closed during bootstrap")]
    SessionClosed,

    #[error("cannot install remote script: {0}")]
    UploadFailed(String),

    #[error("remote script reports unexpected version line '{0}'")]
    VersionMismatch(String),
}

/// Where the remote script lives and what it must identify as.
#[derive(Debug, Clone)]
pub struct BootstrapParams {
    pub script_body: String,
    pub script_version: String,
    /// Directory for the script and its index sidecars. The default is a
    /// per-user temp dir, resolved by the remote shell itself.
    pub remote_dir: Option<String>,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        Self {
            script_body: script::SCRIPT_BODY.to_string(),
            script_version: script::SCRIPT_VERSION.to_string(),
            remote_dir: None,
        }
    }
}

impl BootstrapParams {
    fn dir_assignment(&self) -> String {
        match &self.remote_dir {
            Some(dir) => format!("LH_DIR='{}'", dir.replace('\'', r"'\''")),
            None => r#"LH_DIR="${TMPDIR:-/tmp}/loghive-$(id -u)""#.to_string(),
        }
    }

    fn expected_version_line(&self) -> String {
        script::version_line(&self.script_version)
    }
}

/// Ensure the analysis script is installed and runnable on the remote,
/// then `exec` into its command loop. Idempotent: a script already at the
/// expected version is not re-uploaded.
///
/// Drives the still-plain remote shell through `stdin`, reading replies
/// from the connection's stdout line channel.
pub async fn ensure_script(
    stdin: &mut (dyn AsyncWrite + Send + Unpin),
    stdout_lines: &mut mpsc::Receiver<String>,
    params: &BootstrapParams,
    timeout: Duration,
) -> Result<(), BootstrapError> {
    let expected = params.expected_version_line();

    // Probe before uploading anything.
    let probe = format!(
        "{} && LH_BIN=\"$LH_DIR/agent.sh\"; \"$LH_BIN\" --version 2>/dev/null || echo {}\n",
        params.dir_assignment(),
        MARKER_NO_SCRIPT
    );
    stdin.write_all(probe.as_bytes()).await?;
    stdin.flush().await?;

    let reply = read_reply_line(stdout_lines, timeout).await?;
    if reply == expected {
        debug!("remote script already at expected version");
    } else {
        if reply != MARKER_NO_SCRIPT {
            info!(found = %reply, expected = %expected, "remote script outdated, re-uploading");
        }
        upload(stdin, stdout_lines, params, &expected, timeout).await?;
    }

    // Hand the session over to the script's command loop.
    stdin.write_all(b"exec \"$LH_BIN\"\n").await?;
    stdin.flush().await?;

    Ok(())
}

async fn upload(
    stdin: &mut (dyn AsyncWrite + Send + Unpin),
    stdout_lines: &mut mpsc::Receiver<String>,
    params: &BootstrapParams,
    expected: &str,
    timeout: Duration,
) -> Result<(), BootstrapError> {
    // The staging name carries the shell's pid so concurrent sessions to
    // the same host cannot clobber each other's upload; the final mv is
    // atomic and both writers carry identical content.
    let mut block = String::new();
    block.push_str(&format!(
        "mkdir -p \"$LH_DIR\" && cat > \"$LH_BIN.$$.tmp\" <<'{}'\n",
        HEREDOC_EOF
    ));
    block.push_str(&params.script_body);
    if !params.script_body.ends_with('\n') {
        block.push('\n');
    }
    block.push_str(&format!("{}\n", HEREDOC_EOF));
    block.push_str(&format!(
        "chmod +x \"$LH_BIN.$$.tmp\" && mv \"$LH_BIN.$$.tmp\" \"$LH_BIN\" && \"$LH_BIN\" --version || echo {}\n",
        MARKER_UPLOAD_FAILED
    ));

    stdin.write_all(block.as_bytes()).await?;
    stdin.flush().await?;

    let reply = read_reply_line(stdout_lines, timeout).await?;
    if reply == MARKER_UPLOAD_FAILED {
        return Err(BootstrapError::UploadFailed(
            "remote could not write or run the script".to_string(),
        ));
    }
    if reply != expected {
        return Err(BootstrapError::VersionMismatch(reply));
    }

    info!("remote script installed");
    Ok(())
}

async fn read_reply_line(
    stdout_lines: &mut mpsc::Receiver<String>,
    timeout: Duration,
) -> Result<String, BootstrapError> {
    match tokio::time::timeout(timeout, stdout_lines.recv()).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(BootstrapError::SessionClosed),
        Err(_) => Err(BootstrapError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_use_embedded_script() {
        let params = BootstrapParams::default();
        assert_eq!(params.script_version, script::SCRIPT_VERSION);
        assert!(params.script_body.contains("loghive-agent"));
        assert!(params
            .dir_assignment()
            .contains("loghive-$(id -u)"));
    }

    #[test]
    fn test_remote_dir_override_is_quoted() {
        let params = BootstrapParams {
            remote_dir: Some("/tmp/it's here".to_string()),
            ..BootstrapParams::default()
        };
        assert_eq!(params.dir_assignment(), r"LH_DIR='/tmp/it'\''s here'");
    }
}
