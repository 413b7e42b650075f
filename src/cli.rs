//! CLI argument parsing for Estela

use crate::config::TracerConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for run summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "estela")]
#[command(version)]
#[command(about = "Batched, backpressured trace-event recorder with stack capture", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long = "debug", global = true)]
    pub debug: bool,

    /// TOML configuration file
    #[arg(long = "config", value_name = "FILE", env = "ESTELA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record a synthetic multi-threaded copy workload into a trace database
    Record(RecordArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct RecordArgs {
    /// Trace database path
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Number of producer threads
    #[arg(short = 'p', long = "producers", default_value = "4")]
    pub producers: usize,

    /// Events per producer
    #[arg(short = 'n', long = "events", default_value = "10000")]
    pub events: usize,

    /// Stack capture: 0/off, 1/native, 2/helper
    #[arg(long = "stack-frames", value_name = "MODE")]
    pub stack_frames: Option<String>,

    /// Native frames to drop below the tracer's own (e.g. API shims)
    #[arg(long = "skip-frames", value_name = "N")]
    pub skip_frames: Option<usize>,

    /// Offset added to every id column
    #[arg(long = "id-offset", value_name = "N", allow_negative_numbers = true)]
    pub id_offset: Option<i64>,

    /// Rows buffered per table before producers block
    #[arg(long = "capacity", value_name = "ROWS")]
    pub capacity: Option<usize>,

    /// Rows written per transaction
    #[arg(long = "batch-size", value_name = "ROWS")]
    pub batch_size: Option<usize>,

    /// Program launched for helper stack capture
    #[arg(long = "helper", value_name = "PROGRAM")]
    pub helper: Option<PathBuf>,

    /// Summary format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl RecordArgs {
    /// Apply flags on top of a loaded configuration
    pub fn apply(&self, mut config: TracerConfig) -> TracerConfig {
        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if let Some(stack_frames) = &self.stack_frames {
            config.stack_frames = stack_frames.clone();
        }
        if let Some(skip) = self.skip_frames {
            config.skip_frames = skip;
        }
        if let Some(offset) = self.id_offset {
            config.id_offset = offset;
        }
        if let Some(capacity) = self.capacity {
            config.buffer.capacity = capacity;
        }
        if let Some(batch_size) = self.batch_size {
            config.buffer.batch_size = batch_size;
        }
        if let Some(helper) = &self.helper {
            config.helper_command = Some(helper.clone());
        }
        config
    }
}
