use anyhow::{Context, Result};
use clap::Parser;
use estela::cli::{Cli, Command, OutputFormat, RecordArgs};
use estela::config::TracerConfig;
use estela::session::Session;
use estela::workload::Workload;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; warnings always, everything with --debug
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Defaults, then the config file, then `ESTELA_*` variables
fn load_config(cli: &Cli) -> Result<TracerConfig> {
    let config = match &cli.config {
        Some(path) => TracerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TracerConfig::default(),
    };
    config
        .with_env_overrides()
        .context("Invalid ESTELA_* environment override")
}

fn run_record(args: &RecordArgs, config: TracerConfig) -> Result<()> {
    let config = args.apply(config);
    config.validate().context("Invalid buffer configuration")?;
    let output = config.output.clone();

    let session = Session::open(config)
        .with_context(|| format!("Failed to open trace database {}", output.display()))?;
    let report = Workload::new(args.producers, args.events).run(&session);

    match args.format {
        OutputFormat::Text => {
            println!("trace: {}", output.display());
            println!("{}", report);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing before anything can log
    init_tracing(cli.debug);

    let config = load_config(&cli)?;

    match &cli.command {
        Command::Record(args) => run_record(args, config)?,
        Command::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}
