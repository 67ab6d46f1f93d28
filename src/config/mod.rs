pub mod options;
pub mod parse;
pub mod ssh;
pub mod types;

use std::path::{Path, PathBuf};

pub use options::{Options, OptionsError};
pub use parse::{load_config, ConfigError};
pub use types::{Config, LogStreamConfig};

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided)
/// 2. ~/.config/loghive/config.yml
/// 3. /etc/loghive/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Some(home_dir) = dirs::home_dir() {
        let user_config = home_dir.join(".config/loghive/config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/loghive/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Expands a leading tilde in a path using the current home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
