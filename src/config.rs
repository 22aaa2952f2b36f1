//! Runtime settings shared by every action.
//!
//! Values arrive from global command-line flags, which fall back to
//! `KUBECTL_OPERATOR_*` environment variables and then to the defaults below.

use std::str::FromStr;
use std::time::Duration;

use crate::k8s::FIELD_MANAGER;
use crate::transport::TransportKind;
use crate::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub cleanup_timeout: Duration,
    pub field_manager: String,
    pub transport: TransportKind,
    pub output: OutputFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
            field_manager: FIELD_MANAGER.to_string(),
            transport: TransportKind::default(),
            output: OutputFormat::default(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be greater than zero".to_string()));
        }
        if self.timeout < self.poll_interval {
            return Err(Error::Config(format!(
                "timeout {:?} is shorter than the poll interval {:?}",
                self.timeout, self.poll_interval
            )));
        }
        if self.field_manager.trim().is_empty() {
            return Err(Error::Config("field manager must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Parses `500ms`, `30s`, `5m` or `1h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1u64)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000u64)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000u64)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000u64)
    } else {
        return Err(Error::Config(format!(
            "invalid duration {s:?}. Use: 30s, 5m, 1h, 500ms"
        )));
    };

    let value = u64::from_str(num.trim())
        .map_err(|_| Error::Config(format!("invalid duration number in {s:?}")))?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| Error::Config(format!("duration {s:?} is too large")))
}
