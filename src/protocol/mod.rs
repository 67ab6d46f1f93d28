use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed '{tag}' frame: {reason}")]
    MalformedFrame { tag: char, reason: String },

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// One user-level query against a set of logstreams.
#[derive(Debug, Clone)]
pub struct Query {
    /// Minute-aligned range start, inclusive.
    pub from: DateTime<Utc>,
    /// Minute-aligned range end, exclusive.
    pub to: DateTime<Utc>,
    /// Awk-compatible filter expression, e.g. `/oops/ && !/noise/`.
    pub pattern: Option<String>,
    /// Overrides the stream's configured/probed log source.
    pub log_source: Option<String>,
    pub max_messages: usize,
    pub rebuild_index: bool,
    /// IANA zone name forwarded to the remote; empty means the remote's
    /// own local time.
    pub timezone: String,
}

impl Query {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            pattern: None,
            log_source: None,
            max_messages: 250,
            rebuild_index: false,
            timezone: String::new(),
        }
    }

    pub fn from_minute(&self) -> i64 {
        self.from.timestamp() / 60
    }

    pub fn to_minute(&self) -> i64 {
        self.to.timestamp() / 60
    }
}

/// One file to scan, with the byte window derived from the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileScan {
    pub file: String,
    pub start_offset: u64,
    /// `None` scans to EOF.
    pub end_offset: Option<u64>,
}

/// Arguments shipped to the remote script as one `RUN` line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryArgs {
    pub query_id: String,
    pub from_minute: i64,
    pub to_minute: i64,
    /// Files in scan order (oldest first); empty means journal mode.
    pub files: Vec<FileScan>,
    pub journal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub max_messages: usize,
    /// IANA zone name for the remote scan; empty means the remote's own
    /// local time.
    pub timezone: String,
}

/// Arguments for one `IDX` index refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexArgs {
    pub file: String,
    pub rebuild: bool,
}

/// Encode a command line carrying a base64 JSON payload.
pub fn encode_command<T: Serialize>(verb: &str, args: &T) -> Result<String, ProtocolError> {
    let json = serde_json::to_vec(args)?;
    Ok(format!("{} {}\n", verb, BASE64_STANDARD.encode(json)))
}

/// A message row as it appears on the wire, before the owning stream is
/// attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub timestamp: DateTime<Utc>,
    pub file: String,
    pub offset: u64,
    pub raw_line: String,
}

/// A fully-attributed log message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub stream_id: String,
    pub file_name: String,
    pub offset: u64,
    pub raw_line: String,
    pub context_tags: HashMap<String, String>,
}

impl LogMessage {
    pub fn from_wire(wire: WireMessage, stream_id: &str) -> Self {
        let context_tags = parse_context_tags(&wire.raw_line);
        Self {
            timestamp: wire.timestamp,
            stream_id: stream_id.to_string(),
            file_name: wire.file,
            offset: wire.offset,
            raw_line: wire.raw_line,
            context_tags,
        }
    }
}

/// One line-framed unit of remote output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `H <minuteEpoch> <count>`
    Histogram { minute: i64, count: u64 },
    /// `M <timestampNs> <file>:<offset> <rawline-base64>`
    Message(WireMessage),
    /// `T <totalMatched>`
    Total(u64),
    /// `E <message>` — non-fatal
    Error(String),
    /// `I <minuteEpoch> <offset>` — index row
    IndexRow { minute: i64, offset: u64 },
    /// `S <source>` — probed log source
    Source(String),
    /// `D` — done, success
    Done,
    /// `F <reason>` — done, failure
    Failed(String),
}

impl Frame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Done | Frame::Failed(_))
    }
}

/// Parse one line of remote output. Unknown tags return `Ok(None)` so newer
/// remote scripts stay compatible; a recognised tag with a malformed body is
/// an error.
pub fn parse_frame(line: &str) -> Result<Option<Frame>, ProtocolError> {
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        return Ok(None);
    }

    let mut parts = line.splitn(2, ' ');
    let tag = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();

    match tag {
        "H" => {
            let (minute, count) = split_two_ints(body)
                .ok_or_else(|| malformed('H', body))?;
            if count < 0 {
                return Err(malformed('H', body));
            }
            Ok(Some(Frame::Histogram {
                minute,
                count: count as u64,
            }))
        }
        "M" => parse_message(body).map(|m| Some(Frame::Message(m))),
        "T" => {
            let total = body
                .parse()
                .map_err(|_| malformed('T', body))?;
            Ok(Some(Frame::Total(total)))
        }
        "E" => Ok(Some(Frame::Error(body.to_string()))),
        "I" => {
            let (minute, offset) = split_two_ints(body)
                .ok_or_else(|| malformed('I', body))?;
            if offset < 0 {
                return Err(malformed('I', body));
            }
            Ok(Some(Frame::IndexRow {
                minute,
                offset: offset as u64,
            }))
        }
        "S" => {
            if body.is_empty() {
                return Err(malformed('S', body));
            }
            Ok(Some(Frame::Source(body.to_string())))
        }
        "D" => Ok(Some(Frame::Done)),
        "F" => Ok(Some(Frame::Failed(body.to_string()))),
        _ => Ok(None),
    }
}

fn malformed(tag: char, body: &str) -> ProtocolError {
    ProtocolError::MalformedFrame {
        tag,
        reason: format!("body '{}'", body),
    }
}

fn split_two_ints(body: &str) -> Option<(i64, i64)> {
    let mut parts = body.split_whitespace();
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((a, b))
}

fn parse_message(body: &str) -> Result<WireMessage, ProtocolError> {
    let mut parts = body.split_whitespace();
    let ts_ns: i64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed('M', body))?;
    let location = parts.next().ok_or_else(|| malformed('M', body))?;
    let payload = parts.next().ok_or_else(|| malformed('M', body))?;
    if parts.next().is_some() {
        return Err(malformed('M', body));
    }

    // The file path may itself contain ':'; the offset is after the last one.
    let (file, offset_str) = location
        .rsplit_once(':')
        .ok_or_else(|| malformed('M', location))?;
    let offset: u64 = offset_str
        .parse()
        .map_err(|_| malformed('M', location))?;

    let raw_bytes = BASE64_STANDARD.decode(payload)?;
    let raw_line = String::from_utf8_lossy(&raw_bytes).into_owned();

    Ok(WireMessage {
        timestamp: DateTime::from_timestamp_nanos(ts_ns),
        file: file.to_string(),
        offset,
        raw_line,
    })
}

/// Extract small context tags from a raw line. Syslog-style
/// `program[pid]:` prefixes yield `program` and `pid` tags.
pub fn parse_context_tags(raw_line: &str) -> HashMap<String, String> {
    static TAG_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = TAG_RE.get_or_init(|| {
        regex::Regex::new(r"(?:^|\s)(?P<program>[A-Za-z0-9_./-]+)(?:\[(?P<pid>\d+)\])?:\s")
            .expect("static regex")
    });

    let mut tags = HashMap::new();
    if let Some(captures) = re.captures(raw_line) {
        if let Some(program) = captures.name("program") {
            tags.insert("program".to_string(), program.as_str().to_string());
        }
        if let Some(pid) = captures.name("pid") {
            tags.insert("pid".to_string(), pid.as_str().to_string());
        }
    }
    tags
}
