//! Configuration for the inference service

use crate::{generation::SamplingParams, CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the inference service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Model and adapter to load
    pub model: ModelParams,

    /// Number of threads handed to the compute backend
    pub n_threads: usize,

    /// Whether ingested prompt tokens are streamed back to the sink
    pub echo_prompt: bool,

    /// Sampling parameters used by every run unless overridden per request
    pub sampling: SamplingParams,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model: ModelParams::default(),
            n_threads: num_cpus::get_physical(),
            echo_prompt: true,
            sampling: SamplingParams::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Model loading parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Path to the model weights
    pub model: PathBuf,

    /// Optional adapter applied on top of the base weights
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora: Option<PathBuf>,

    /// Whether to memory-map the weights
    pub use_mmap: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: PathBuf::new(),
            lora: None,
            use_mmap: true,
        }
    }
}

impl ModelParams {
    /// Parameters for a model without adapter
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            lora: None,
            use_mmap: true,
        }
    }

    /// Attach an adapter; an empty path means no adapter
    pub fn with_lora(mut self, lora: impl Into<PathBuf>) -> Self {
        let lora = lora.into();
        self.lora = if lora.as_os_str().is_empty() { None } else { Some(lora) };
        self
    }

    /// Memory mapping is unusable while an adapter patches the weights
    pub fn effective_use_mmap(&self) -> bool {
        self.use_mmap && self.lora.is_none()
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,

    /// Extra `EnvFilter` directives, e.g. `spindle_core::sampling=trace`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// Whether to include thread names in log lines
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            filter: None,
            thread_names: true,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl ServiceConfig {
    /// Configuration for the given model with defaults everywhere else
    pub fn for_model(model: impl Into<PathBuf>) -> Self {
        Self {
            model: ModelParams::new(model),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| CoreError::Io {
            code: "CONFIG_READ_FAILED",
            message: err.to_string(),
            path: Some(path.to_path_buf()),
            suggestion: "Check that the configuration file exists and is readable".to_string(),
            source: err,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|err| {
            CoreError::configuration(
                "CONFIG_PARSE_FAILED",
                err.to_string(),
                "Parsing service configuration",
                "Fix the TOML syntax or field types",
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|err| {
            CoreError::configuration(
                "CONFIG_SERIALIZE_FAILED",
                err.to_string(),
                "Serializing service configuration",
                "Report this as a bug",
            )
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.n_threads == 0 {
            return Err(CoreError::invalid_field(
                "CONFIG_INVALID_THREADS",
                "n_threads",
                "n_threads must be greater than 0",
                "Leave n_threads unset to use the number of physical cores",
            ));
        }

        self.sampling.validate()
    }
}
