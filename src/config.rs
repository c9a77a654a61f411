use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::coherence::protocol::Protocol;
use crate::common::ConfigError;

const DEFAULT_LINE_BYTES: u64 = 64;
const DEFAULT_LINES: usize = 256;
const DEFAULT_WAYS: usize = 8;
const DEFAULT_MSHR_ENTRIES: usize = 16;

const ACCESS_LATENCY: u64 = 4;
const TAG_LATENCY: u64 = 1;
const MSHR_LATENCY: u64 = 2;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub cache: CacheConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Config::from_toml(&content)
    }

    /// Parses and validates a TOML configuration string.
    pub fn from_toml(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects geometries the cache cannot be built with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.cache;
        if !c.line_bytes.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "line size {} is not a power of two",
                c.line_bytes
            )));
        }
        if c.lines == 0 || c.ways == 0 {
            return Err(ConfigError::Invalid("number of lines not set correctly".into()));
        }
        if c.lines % c.ways != 0 {
            return Err(ConfigError::Invalid(format!(
                "{} lines cannot be split into {}-way sets",
                c.lines, c.ways
            )));
        }
        if c.mshr_entries == 0 {
            return Err(ConfigError::Invalid("MSHR size not specified correctly".into()));
        }
        if c.upstream.is_empty() {
            return Err(ConfigError::Invalid("no upstream ports configured".into()));
        }
        if c.lower_level.is_empty() {
            return Err(ConfigError::Invalid("no lower level configured".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_protocol")]
    pub protocol: Protocol,

    #[serde(default = "default_line_bytes")]
    pub line_bytes: u64,

    #[serde(default = "default_lines")]
    pub lines: usize,

    #[serde(default = "default_ways")]
    pub ways: usize,

    #[serde(default = "default_mshr_entries")]
    pub mshr_entries: usize,

    /// Names of the requestors above, in port-id order.
    pub upstream: Vec<String>,

    /// Names of the next-level caches or memories, interleaved by line.
    #[serde(default = "default_lower_level")]
    pub lower_level: Vec<String>,
}

/// Latencies, in cycles, added to "now" to produce delivery times.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    #[serde(default = "default_access_latency")]
    pub access_latency: u64,

    #[serde(default = "default_tag_latency")]
    pub tag_latency: u64,

    #[serde(default = "default_mshr_latency")]
    pub mshr_latency: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            access_latency: ACCESS_LATENCY,
            tag_latency: TAG_LATENCY,
            mshr_latency: MSHR_LATENCY,
        }
    }
}

fn default_name() -> String {
    "cache".to_string()
}

fn default_protocol() -> Protocol {
    Protocol::Mesi
}

fn default_line_bytes() -> u64 {
    DEFAULT_LINE_BYTES
}

fn default_lines() -> usize {
    DEFAULT_LINES
}

fn default_ways() -> usize {
    DEFAULT_WAYS
}

fn default_mshr_entries() -> usize {
    DEFAULT_MSHR_ENTRIES
}

fn default_lower_level() -> Vec<String> {
    vec!["memory".to_string()]
}

fn default_access_latency() -> u64 {
    ACCESS_LATENCY
}

fn default_tag_latency() -> u64 {
    TAG_LATENCY
}

fn default_mshr_latency() -> u64 {
    MSHR_LATENCY
}
