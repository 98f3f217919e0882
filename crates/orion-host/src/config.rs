//! Host configuration
//!
//! A `HostConfig` file has two sections:
//!
//! ```yaml
//! runtime:
//!   entry_point: _start
//!   max_fuel: 10000000
//!   timeout_ms: 5000
//! wasi:
//!   args: [app, --verbose]
//!   env: ["HOME=/", "MODE=${MODE}"]
//!   inherit_env: false
//! ```
//!
//! ## Features
//!
//! - Auto-detection of format from file extension (YAML, TOML, JSON)
//! - Environment variable substitution (`${VAR}` and `$VAR` syntax)
//! - `ORION__SECTION__FIELD` environment overrides

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::ConfigError;
use crate::runtime::{OptimizationLevel, ResourceLimits, RuntimeConfig};
use crate::sink::OutputSink;
use crate::wasi::ImportBinding;

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "ORION";

/// Detect configuration format from file extension
///
/// - YAML: `.yaml`, `.yml`
/// - TOML: `.toml`
/// - JSON: `.json`
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
///
/// Supports `${VAR_NAME}` and `$VAR_NAME`. Unset variables are left as written.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let mut result = content.to_string();

    let re_braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    result = re_braced
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    let re_simple = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    result = re_simple
        .replace_all(&result, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string();

    Ok(result)
}

fn deserialize<T: DeserializeOwned>(builder: config::ConfigBuilder<config::builder::DefaultState>) -> ConfigResult<T> {
    let config = builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content)?;
    deserialize(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Load configuration from a file, then apply `PREFIX__SECTION__FIELD`
/// environment overrides.
pub fn load_with_env<T>(path: &str, prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content)?;

    deserialize(
        Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}

/// `runtime` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub entry_point: String,
    pub max_fuel: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub epoch_tick_ms: u64,
    pub max_memory_pages: u32,
    pub max_table_elements: u32,
    /// Combined stdout and stderr bytes per run, `None` for no cap
    pub max_output_bytes: Option<u64>,
    pub optimization_level: OptimizationLevel,
    pub max_cached_modules: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        let limits = runtime.resource_limits;
        Self {
            entry_point: runtime.entry_point,
            max_fuel: limits.max_fuel,
            timeout_ms: limits.max_execution_time_ms,
            epoch_tick_ms: runtime.epoch_tick_ms,
            max_memory_pages: limits.max_memory_pages,
            max_table_elements: limits.max_table_elements,
            max_output_bytes: limits.max_output_bytes,
            optimization_level: runtime.optimization_level,
            max_cached_modules: runtime.max_cached_modules,
        }
    }
}

/// `wasi` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiSection {
    /// Guest argv, argv\[0\] included
    pub args: Vec<String>,
    /// `KEY=VALUE` entries; later entries win
    pub env: Vec<String>,
    /// Start from the host process environment
    pub inherit_env: bool,
    /// File served to the guest on fd 0
    pub stdin_file: Option<PathBuf>,
}

impl WasiSection {
    /// Resolved environment: inherited variables first, then `env` entries,
    /// keeping the position of the first occurrence of each key.
    pub fn env_pairs(&self) -> ConfigResult<Vec<(String, String)>> {
        let mut pairs: Vec<(String, String)> = if self.inherit_env {
            std::env::vars().collect()
        } else {
            Vec::new()
        };

        for entry in &self.env {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::Parse(format!("env entry without '=': {}", entry)))?;
            if key.is_empty() {
                return Err(ConfigError::Parse(format!("env entry without a key: {}", entry)));
            }
            match pairs.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value.to_string(),
                None => pairs.push((key.to_string(), value.to_string())),
            }
        }
        Ok(pairs)
    }
}

/// Top-level host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub runtime: RuntimeSection,
    pub wasi: WasiSection,
}

impl HostConfig {
    /// Load from `path` with `ORION__` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_string_lossy();
        load_with_env(&path, ENV_PREFIX)
    }

    pub fn parse(content: &str, format: FileFormat) -> ConfigResult<Self> {
        from_str(content, format)
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        let section = &self.runtime;
        RuntimeConfig {
            resource_limits: ResourceLimits {
                max_memory_pages: section.max_memory_pages,
                max_table_elements: section.max_table_elements,
                max_fuel: section.max_fuel,
                max_execution_time_ms: section.timeout_ms,
                max_output_bytes: section.max_output_bytes,
            },
            entry_point: section.entry_point.clone(),
            epoch_tick_ms: section.epoch_tick_ms,
            max_cached_modules: section.max_cached_modules,
            optimization_level: section.optimization_level,
            ..RuntimeConfig::default()
        }
    }

    /// Import table for one run, bound to `sink`.
    pub fn bindings(&self, sink: Arc<dyn OutputSink>) -> ConfigResult<ImportBinding> {
        let env = self.wasi.env_pairs()?;
        let binding = ImportBinding::build(sink, self.wasi.args.clone(), env);
        match &self.wasi.stdin_file {
            Some(path) => Ok(binding.with_stdin(std::fs::read(path)?)),
            None => Ok(binding),
        }
    }
}
