//! Tracer configuration
//!
//! Layered the usual way: defaults, then an optional TOML file, then
//! `ESTELA_*` environment variables, then CLI flags.
//!
//! ```toml
//! output = "trace.rpd"
//! id_offset = 0
//! stack_frames = "native"   # 0/off, 1/native, 2/helper
//! skip_frames = 0         # shim frames below the tracer's own
//! helper_command = "/usr/local/bin/stack-helper"
//!
//! [buffer]
//! capacity = 16384
//! batch_size = 4096
//! ```
//!
//! `stack_frames` is kept as free text: an unrecognized value is not a
//! configuration error, it degrades capture to zero frames at runtime.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Rows held per table before producers block
pub const DEFAULT_CAPACITY: usize = 4096 * 4;

/// Rows per transaction
pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Caller frames dropped after the tracer's own frames (interposition shims)
pub const DEFAULT_SKIP_FRAMES: usize = 0;

pub const DEFAULT_OUTPUT: &str = "trace.rpd";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid buffer geometry: {0}")]
    InvalidBuffer(String),
}

/// Ring buffer geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    pub batch_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Per-table pipeline settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub batch_size: usize,
    /// Added to id columns at write time
    pub id_offset: i64,
}

impl PipelineConfig {
    pub fn new(capacity: usize, batch_size: usize, id_offset: i64) -> Self {
        Self {
            capacity,
            batch_size,
            id_offset,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidBuffer(
                "capacity must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBuffer(
                "batch_size must be > 0".to_string(),
            ));
        }
        if self.batch_size > self.capacity {
            return Err(ConfigError::InvalidBuffer(format!(
                "batch_size {} exceeds capacity {}",
                self.batch_size, self.capacity
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_BATCH_SIZE, 0)
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Trace database path
    pub output: PathBuf,
    /// Added to every id column so separate traces can share one id space
    pub id_offset: i64,
    /// Stack capture selection (see `stack_capture::CaptureStrategy`)
    pub stack_frames: String,
    /// Native frames to drop past the tracer's own, which always go
    pub skip_frames: usize,
    /// Program launched for external-helper capture
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helper_command: Option<PathBuf>,
    pub buffer: BufferConfig,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            id_offset: 0,
            stack_frames: "0".to_string(),
            skip_frames: DEFAULT_SKIP_FRAMES,
            helper_command: None,
            buffer: BufferConfig::default(),
        }
    }
}

impl TracerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Apply `ESTELA_*` variables from the process environment
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply `ESTELA_*` overrides from an arbitrary lookup
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup("ESTELA_OUTPUT") {
            self.output = PathBuf::from(value);
        }
        if let Some(value) = lookup("ESTELA_ID_OFFSET") {
            self.id_offset = parse_env("ESTELA_ID_OFFSET", value)?;
        }
        if let Some(value) = lookup("ESTELA_STACKFRAMES") {
            self.stack_frames = value;
        }
        if let Some(value) = lookup("ESTELA_SKIP_FRAMES") {
            self.skip_frames = parse_env("ESTELA_SKIP_FRAMES", value)?;
        }
        if let Some(value) = lookup("ESTELA_HELPER") {
            self.helper_command = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("ESTELA_BUFFER_CAPACITY") {
            self.buffer.capacity = parse_env("ESTELA_BUFFER_CAPACITY", value)?;
        }
        if let Some(value) = lookup("ESTELA_BATCH_SIZE") {
            self.buffer.batch_size = parse_env("ESTELA_BATCH_SIZE", value)?;
        }
        Ok(self)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::new(self.buffer.capacity, self.buffer.batch_size, self.id_offset)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline().validate()
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
