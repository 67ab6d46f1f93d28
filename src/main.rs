use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use loghive::config::ssh::SshConfig;
use loghive::config::{self, Options};
use loghive::orchestrator::{Orchestrator, QuerySpec};
use loghive::protocol::Query;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "loghive")]
#[command(about = "Query logs on remote hosts over shell transports", long_about = None)]
struct Cli {
    /// Logstreams config file (default: ~/.config/loghive/config.yml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one query against a set of logstreams and print the merged result
    Query {
        /// Comma-separated host spec; globs match config and SSH hosts
        #[arg(long)]
        streams: String,

        /// Range start, e.g. '2026-08-01 12:00' or RFC 3339 (UTC)
        #[arg(long)]
        from: String,

        /// Range end, exclusive
        #[arg(long)]
        to: String,

        /// Awk-compatible filter, e.g. '/oops/ && !/noise/'
        #[arg(long)]
        pattern: Option<String>,

        /// Maximum messages to return (newest win)
        #[arg(long)]
        numlines: Option<String>,

        /// Output timezone: IANA name, 'Local' or 'UTC'
        #[arg(long)]
        timezone: Option<String>,

        /// Transport: ssh-lib | ssh-bin | custom:<command>
        #[arg(long)]
        transport: Option<String>,

        /// Rebuild every remote index from scratch
        #[arg(long)]
        rebuild_index: bool,

        /// Also print the per-minute histogram
        #[arg(long)]
        histogram: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loghive=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Query {
            streams,
            from,
            to,
            pattern,
            numlines,
            timezone,
            transport,
            rebuild_index,
            histogram,
        } => {
            let mut options = Options::default();
            if let Some(value) = &numlines {
                options.set("numlines", value)?;
            }
            if let Some(value) = &timezone {
                options.set("timezone", value)?;
            }
            if let Some(value) = &transport {
                options.set("transport", value)?;
            }

            let config = match config::resolve_config_path(cli.config.as_deref()) {
                Some(path) => config::load_config(&path)?,
                None => config::Config::default(),
            };
            let ssh_config = match SshConfig::default_path() {
                Some(path) => SshConfig::load(&path)?,
                None => SshConfig::default(),
            };

            let mut query = Query::new(parse_time(&from)?, parse_time(&to)?);
            query.pattern = pattern;
            query.max_messages = options.numlines;
            query.rebuild_index = rebuild_index;

            let mut orchestrator = Orchestrator::new(config, ssh_config, options);

            let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = cancel_tx.send(true);
                }
            });

            let spec = QuerySpec { streams, query };
            let result = orchestrator.query_with_cancel(&spec, cancel_rx).await?;

            if histogram {
                for (minute, count) in &result.histogram {
                    let bucket = Utc
                        .timestamp_opt(minute * 60, 0)
                        .single()
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| minute.to_string());
                    println!("# {} {}", bucket, count);
                }
            }

            for message in &result.messages {
                println!(
                    "{} [{}] {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.stream_id,
                    message.raw_line
                );
            }

            let mut stream_ids: Vec<&String> = result.per_stream.keys().collect();
            stream_ids.sort();
            for stream_id in stream_ids {
                let summary = &result.per_stream[stream_id];
                match &summary.error {
                    Some(error) => eprintln!("{}: {}", stream_id, error),
                    None => eprintln!(
                        "{}: {} matched, {} returned",
                        stream_id, summary.total, summary.messages_returned
                    ),
                }
            }
            eprintln!(
                "{} stream(s) succeeded, {} failed",
                result.succeeded_count(),
                result.failed_count()
            );

            if result.succeeded_count() == 0 && result.failed_count() > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Accepts RFC 3339 or a handful of human formats, all read as UTC.
fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(format!("unrecognised time '{}'", value))
}
