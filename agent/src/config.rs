//! Configuration types for the sampling agent
//!
//! Configuration is read from an INI file and `STAT_*` environment variables
//! through the `config` crate. Every key is optional:
//!
//! ```ini
//! samples  = 10000
//! interval = 100
//! arginfo  = off
//! strings  = 32M
//! stream   = unix:///run/stat.sock
//! control  = zend.stat.control
//! dump     = /tmp/stat.dump
//! samplers = 0
//! ```

use crate::io::Endpoint;
use anyhow::{Context, Result};
use serde::Deserialize;
use stat_shared::utils::parse_size;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lowest accepted sampling interval, in microseconds
pub const MIN_INTERVAL_MICROS: u64 = 10;

/// Smallest string budget that fits the opcode table with room to spare
pub const MIN_STRINGS_BUDGET: usize = 64 * 1024;

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of slots in the sample ring buffer
    pub samples: usize,

    /// Sampling interval in microseconds
    pub interval: u64,

    /// Capture argument type tags
    pub arginfo: bool,

    /// Byte budget of the string table, with optional K/M/G suffix
    pub strings: String,

    /// Endpoint serving sample streams; empty disables
    pub stream: String,

    /// Endpoint accepting control messages; empty disables
    pub control: String,

    /// File receiving remaining samples at shutdown; empty disables
    pub dump: String,

    /// Maximum concurrent samplers, 0 for no limit
    pub samplers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            samples: 10_000,
            interval: 100,
            arginfo: false,
            strings: "32M".to_string(),
            stream: "zend.stat.stream".to_string(),
            control: "zend.stat.control".to_string(),
            dump: String::new(),
            samplers: 0,
        }
    }
}

fn enabled(value: &str) -> Option<&str> {
    match value.trim() {
        "" | "0" | "off" | "none" => None,
        v => Some(v),
    }
}

impl Config {
    /// Load from an optional INI file, then apply `STAT_*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            let name = path
                .to_str()
                .with_context(|| format!("Config path is not UTF-8: {}", path.display()))?;
            builder = builder.add_source(config::File::new(name, config::FileFormat::Ini));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("STAT"))
            .build()
            .context("Failed to read configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Sampling interval, never below [`MIN_INTERVAL_MICROS`]
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_micros(self.interval.max(MIN_INTERVAL_MICROS))
    }

    /// String table budget in bytes
    pub fn strings_budget(&self) -> Result<usize> {
        parse_size(&self.strings).context("Invalid strings budget")
    }

    pub fn stream_endpoint(&self) -> Result<Option<Endpoint>> {
        let endpoint = enabled(&self.stream).map(Endpoint::parse).transpose()?;
        Ok(endpoint)
    }

    pub fn control_endpoint(&self) -> Result<Option<Endpoint>> {
        let endpoint = enabled(&self.control).map(Endpoint::parse).transpose()?;
        Ok(endpoint)
    }

    pub fn dump_path(&self) -> Option<PathBuf> {
        enabled(&self.dump).map(PathBuf::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.samples == 0 {
            anyhow::bail!("Sample buffer must have at least one slot");
        }

        if self.interval == 0 {
            anyhow::bail!("Sampling interval must be greater than 0");
        }

        let budget = self.strings_budget()?;
        if budget < MIN_STRINGS_BUDGET {
            anyhow::bail!(
                "Strings budget too small ({} bytes, min {})",
                budget,
                MIN_STRINGS_BUDGET
            );
        }

        self.stream_endpoint()?;
        self.control_endpoint()?;

        Ok(())
    }
}
