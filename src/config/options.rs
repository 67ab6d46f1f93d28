use crate::transport::TransportMode;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("option 'numlines' must be a positive integer, got '{0}'")]
    InvalidNumLines(String),

    #[error("option 'timezone' must be an IANA zone name, 'Local' or 'UTC', got '{0}'")]
    InvalidTimezone(String),

    #[error(transparent)]
    InvalidTransport(#[from] crate::transport::TransportModeError),
}

/// Output timezone for remote scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timezone {
    Local,
    Utc,
    Named(chrono_tz::Tz),
}

impl Timezone {
    /// The name handed to the remote side (exported as TZ before scanning).
    pub fn remote_name(&self) -> &str {
        match self {
            // An empty TZ on the remote means its own local time, which is
            // what the log lines are written in.
            Timezone::Local => "",
            Timezone::Utc => "UTC",
            Timezone::Named(tz) => tz.name(),
        }
    }
}

impl std::fmt::Display for Timezone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timezone::Local => write!(f, "Local"),
            Timezone::Utc => write!(f, "UTC"),
            Timezone::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

/// The recognised options are a closed set; unknown names and invalid values
/// fail at set time, not at use time.
#[derive(Debug, Clone)]
pub struct Options {
    pub numlines: usize,
    pub timezone: Timezone,
    pub transport: TransportMode,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            numlines: 250,
            timezone: Timezone::Local,
            transport: TransportMode::SshBin,
        }
    }
}

impl Options {
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), OptionsError> {
        match key {
            "numlines" => {
                let parsed: usize = value
                    .parse()
                    .map_err(|_| OptionsError::InvalidNumLines(value.to_string()))?;
                if parsed == 0 {
                    return Err(OptionsError::InvalidNumLines(value.to_string()));
                }
                self.numlines = parsed;
            }
            "timezone" => {
                self.timezone = parse_timezone(value)?;
            }
            "transport" => {
                self.transport = TransportMode::parse(value)?;
            }
            other => return Err(OptionsError::UnknownOption(other.to_string())),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<String, OptionsError> {
        match key {
            "numlines" => Ok(self.numlines.to_string()),
            "timezone" => Ok(self.timezone.to_string()),
            "transport" => Ok(self.transport.to_string()),
            other => Err(OptionsError::UnknownOption(other.to_string())),
        }
    }
}

pub fn parse_timezone(value: &str) -> Result<Timezone, OptionsError> {
    match value {
        "Local" | "local" => Ok(Timezone::Local),
        "UTC" | "utc" => Ok(Timezone::Utc),
        name => chrono_tz::Tz::from_str(name)
            .map(Timezone::Named)
            .map_err(|_| OptionsError::InvalidTimezone(value.to_string())),
    }
}
