//! Tracing setup for datalab processes.
//!
//! Logs always go to stderr: stdout carries the request/response stream for
//! `serve` and the response document for workers.

#![warn(missing_docs, clippy::pedantic)]

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Accepted log levels.
pub const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Third-party targets kept quieter than the base level.
const QUIET_TARGETS: &[(&str, &str)] = &[("sqlparser", "warn"), ("rusqlite", "warn")];

/// Output layout of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Single-line text.
    #[default]
    Compact,
    /// Multi-line human-oriented text.
    Pretty,
    /// JSON lines.
    Json,
}

impl LogFormat {
    /// Stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" | "jsonl" => Ok(Self::Json),
            other => Err(anyhow!(
                "invalid log format '{other}'; expected compact, pretty, or json"
            )),
        }
    }
}

/// Returns true if `level` is one of [`LOG_LEVELS`].
#[must_use]
pub fn is_valid_level(level: &str) -> bool {
    LOG_LEVELS.contains(&level)
}

/// Filter directives for `level` plus the quiet third-party targets.
#[must_use]
pub fn directives(level: &str) -> String {
    let mut directives = vec![level.to_owned()];
    directives.extend(
        QUIET_TARGETS
            .iter()
            .map(|(target, lvl)| format!("{target}={lvl}")),
    );
    directives.join(",")
}

/// Builds the filter: `RUST_LOG` when set, otherwise the configured level.
///
/// # Errors
///
/// Returns an error if `RUST_LOG` or the level cannot be parsed.
pub fn build_env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return EnvFilter::try_from_default_env().context("invalid RUST_LOG filter");
    }
    if !is_valid_level(level) {
        return Err(anyhow!(
            "invalid log level '{level}'; expected one of {}",
            LOG_LEVELS.join(", ")
        ));
    }
    let filter = directives(level);
    EnvFilter::try_new(&filter).with_context(|| format!("invalid tracing filter '{filter}'"))
}

/// Installs the global subscriber writing to stderr.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber is
/// already installed.
pub fn init_tracing(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = build_env_filter(level)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))?;

    tracing::debug!(level, %format, "tracing initialized");
    Ok(())
}
