use crate::data_transfer::schema::DistributionKeyArity;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const ENV_PREFIX: &str = "TABLEPIPE_";
const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 10;
const DEFAULT_CLEANUP_TIMEOUT_SECONDS: u64 = 10;

/// Where the gpfdist streaming service listens and where it expects pipes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    pub host: String,
    pub write_port: u16,
    pub read_port: u16,
    pub ssl_enabled: bool,
    pub data_dir: PathBuf,
    /// Overrides the scheme derived from `ssl_enabled` on the writable side.
    pub write_protocol: Option<String>,
    pub read_protocol: Option<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            write_port: 8000,
            read_port: 8001,
            ssl_enabled: false,
            data_dir: PathBuf::from("/tmp/gpfdist"),
            write_protocol: None,
            read_protocol: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub streaming: StreamingConfig,
    pub timeout_seconds: u64,
    pub grace_period_seconds: u64,
    pub cleanup_timeout_seconds: u64,
    pub distribution_key_arity: DistributionKeyArity,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            grace_period_seconds: DEFAULT_GRACE_PERIOD_SECONDS,
            cleanup_timeout_seconds: DEFAULT_CLEANUP_TIMEOUT_SECONDS,
            distribution_key_arity: DistributionKeyArity::default(),
        }
    }
}

impl TransferConfig {
    pub fn from_json(contents: &str) -> Result<Self, String> {
        serde_json::from_str(contents).map_err(|e| e.to_string())
    }

    /// Applies `TABLEPIPE_*` variables on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        self.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(host) = value("GPFDIST_HOST") {
            self.streaming.host = host;
        }
        if let Some(raw) = value("GPFDIST_WRITE_PORT") {
            self.streaming.write_port = parse_env("GPFDIST_WRITE_PORT", &raw)?;
        }
        if let Some(raw) = value("GPFDIST_READ_PORT") {
            self.streaming.read_port = parse_env("GPFDIST_READ_PORT", &raw)?;
        }
        if let Some(raw) = value("GPFDIST_SSL_ENABLED") {
            self.streaming.ssl_enabled = parse_bool_env("GPFDIST_SSL_ENABLED", &raw)?;
        }
        if let Some(dir) = value("GPFDIST_DATA_DIR") {
            self.streaming.data_dir = PathBuf::from(dir);
        }
        if let Some(raw) = value("TIMEOUT_SECONDS") {
            self.timeout_seconds = parse_env("TIMEOUT_SECONDS", &raw)?;
        }
        if let Some(raw) = value("GRACE_PERIOD_SECONDS") {
            self.grace_period_seconds = parse_env("GRACE_PERIOD_SECONDS", &raw)?;
        }
        if let Some(raw) = value("CLEANUP_TIMEOUT_SECONDS") {
            self.cleanup_timeout_seconds = parse_env("CLEANUP_TIMEOUT_SECONDS", &raw)?;
        }
        Ok(())
    }

    pub fn merge_cli(&mut self, args: &CliArgs) {
        if let Some(seconds) = args.timeout_seconds {
            self.timeout_seconds = seconds;
        }
        if let Some(seconds) = args.grace_period_seconds {
            self.grace_period_seconds = seconds;
        }
        if let Some(host) = &args.gpfdist_host {
            self.streaming.host = host.clone();
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.streaming.host.trim().is_empty() {
            return Err("streaming.host is required".to_string());
        }
        if self.streaming.write_port == 0 || self.streaming.read_port == 0 {
            return Err("streaming ports must be non-zero".to_string());
        }
        if self.streaming.data_dir.as_os_str().is_empty() {
            return Err("streaming.data_dir is required".to_string());
        }
        if self.timeout_seconds == 0 {
            return Err("timeout_seconds must be greater than zero".to_string());
        }
        if self.grace_period_seconds == 0 {
            return Err("grace_period_seconds must be greater than zero".to_string());
        }
        if self.cleanup_timeout_seconds == 0 {
            return Err("cleanup_timeout_seconds must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_seconds)
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| format!("Invalid {}{} value '{}': {}", ENV_PREFIX, key, raw, e))
}

fn parse_bool_env(key: &str, raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("Invalid {}{} value '{}'", ENV_PREFIX, key, raw)),
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the JSON configuration file (streaming service, timeouts, instances)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Path to the JSON transfer job
    #[arg(short, long)]
    pub job: String,

    /// User whose instance accounts are used for both connections
    #[arg(short, long)]
    pub user: String,

    #[arg(long)]
    pub timeout_seconds: Option<u64>,
    #[arg(long)]
    pub grace_period_seconds: Option<u64>,
    #[arg(long)]
    pub gpfdist_host: Option<String>,
}
