// SPDX-License-Identifier: BSD-3-Clause

//! The resolved configuration object.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

fn default_memory() -> u64 {
    64 * 1024 * 1024
}

fn default_segment_size() -> u64 {
    256 * 1024 * 1024
}

fn default_query_port() -> u16 {
    44444
}

fn default_batch_max_pkts() -> usize {
    8192
}

fn default_flush_ivl() -> Duration {
    Duration::from_secs(1)
}

fn default_share_threshold() -> f64 {
    0.34
}

fn default_module_quota() -> f64 {
    0.25
}

/// The whole resolved configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Size of the shared memory region, in bytes.
    #[serde(default = "default_memory", deserialize_with = "crate::byte_units::deserialize")]
    pub memory: u64,

    /// Storage layout.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Query service settings.
    #[serde(default)]
    pub query: QueryConfig,

    /// Capture tuning knobs.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Sniffers to attach, in configuration order.
    #[serde(default)]
    pub sniffers: Vec<SnifferSpec>,

    /// Modules to run, in configuration order. Position is the module id.
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
}

/// Storage layout settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory under which every stream lives.
    pub basedir: PathBuf,

    /// Maximum size of one stream segment file, in bytes.
    #[serde(
        default = "default_segment_size",
        deserialize_with = "crate::byte_units::deserialize"
    )]
    pub segment_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            basedir: PathBuf::from("/var/lib/como"),
            segment_size: default_segment_size(),
        }
    }
}

/// Query service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    /// TCP port the supervisor answers queries on.
    #[serde(default = "default_query_port")]
    pub port: u16,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig { port: default_query_port() }
    }
}

/// Capture tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// A batch closes at this many packets even if the interval has not
    /// elapsed.
    #[serde(default = "default_batch_max_pkts")]
    pub batch_max_pkts: usize,

    /// Default flush interval for modules that do not declare one.
    #[serde(default = "default_flush_ivl", with = "humantime_serde")]
    pub flush_ivl: Duration,

    /// Fraction of the shared region one lagging capture client may pin
    /// before its subscription is dropped.
    #[serde(default = "default_share_threshold")]
    pub client_share_threshold: f64,

    /// Fraction of the shared region one module's live flow records may
    /// occupy before an early flush is forced.
    #[serde(default = "default_module_quota")]
    pub module_quota: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            batch_max_pkts: default_batch_max_pkts(),
            flush_ivl: default_flush_ivl(),
            client_share_threshold: default_share_threshold(),
            module_quota: default_module_quota(),
        }
    }
}

/// One sniffer to attach.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnifferSpec {
    /// Unique sniffer name, used in logs and drop counters.
    pub name: String,

    /// Driver kind (`pcap`, `synth`, ...).
    pub kind: String,

    /// Device or file the driver opens.
    #[serde(default)]
    pub device: String,

    /// Driver-specific arguments.
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// One module to run.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    /// Unique module name.
    pub name: String,

    /// Implementation to instantiate; defaults to the module name.
    #[serde(default)]
    pub kind: Option<String>,

    /// Filter source text; when absent the filter is projected from the
    /// module's input metadesc.
    #[serde(default)]
    pub filter: Option<String>,

    /// Output stream name; defaults to the module name.
    #[serde(default)]
    pub output: Option<String>,

    /// Module-specific arguments (`interval`, `topn`, ...).
    #[serde(default)]
    pub args: HashMap<String, String>,
}

impl ModuleSpec {
    /// The implementation kind, falling back to the module name.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(&self.name)
    }

    /// The output stream name, falling back to the module name.
    #[must_use]
    pub fn output(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.name)
    }
}

impl Config {
    /// Parses and validates a YAML document.
    pub fn from_yaml(text: &str) -> Result<Config, Error> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads, parses and validates a configuration file.
    pub fn from_file(path: &Path) -> Result<Config, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        Config::from_yaml(&text)
    }
}
