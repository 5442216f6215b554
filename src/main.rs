//! CLI Entry Point for lcr-sweep
//!
//! Runs one frequency sweep on a serial impedance analyzer and streams each
//! sample to stdout as soon as it is accepted. Logs go to stderr.
//!
//! # Usage
//!
//! Sweep with the configured defaults:
//! ```bash
//! lcr-sweep run --config lcr_sweep.toml
//! ```
//!
//! Override a few settings, emit JSON lines:
//! ```bash
//! lcr-sweep run --port /dev/ttyUSB0 --bias 500 --frequencies 100,1000,10000 --format json
//! ```
//!
//! Try it without hardware:
//! ```bash
//! lcr-sweep run --simulate
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use figment::providers::Serialized;
use lcr_sweep::config::AppConfig;
use lcr_sweep::logging::{self, OutputFormat, TracingConfig};
use lcr_sweep::sample::Sample;
use lcr_sweep::session::SessionController;
use lcr_sweep::simulator::{SimulatedAnalyzer, SimulatedConnector};
use std::path::PathBuf;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "lcr-sweep")]
#[command(about = "Frequency sweeps on serial LCR/impedance analyzers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sweep and stream samples to stdout
    Run(RunArgs),

    /// Print the resolved configuration as TOML
    ShowConfig {
        /// Optional TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port (e.g. COM14, /dev/ttyUSB0)
    #[arg(long)]
    port: Option<String>,

    /// Baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// DC bias in millivolts
    #[arg(long, allow_hyphen_values = true)]
    bias: Option<i32>,

    /// AC test level in millivolts
    #[arg(long)]
    level: Option<i32>,

    /// Comma-separated frequencies in Hz
    #[arg(long, value_delimiter = ',')]
    frequencies: Option<Vec<f64>>,

    /// Give up on a frequency after this many fetch attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Give up on a frequency after this long (e.g. "30s")
    #[arg(long)]
    budget: Option<String>,

    /// Read settings back after configuring and abort on mismatch
    #[arg(long)]
    strict: bool,

    /// Talk to a built-in simulated analyzer instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Sample output format
    #[arg(long, value_enum, default_value_t = OutputStyle::Table)]
    format: OutputStyle,

    /// Log line layout on stderr
    #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    /// Log span open/close events
    #[arg(long)]
    log_spans: bool,

    /// Disable colored logs
    #[arg(long)]
    no_color: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputStyle {
    Table,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_sweep(args).await,
        Commands::ShowConfig { config } => show_config(config),
    }
}

fn resolve_config(args: &RunArgs) -> Result<AppConfig> {
    let mut figment = AppConfig::figment(args.config.as_deref());

    if let Some(port) = &args.port {
        figment = figment.merge(Serialized::default("sweep.port", port));
    }
    if let Some(baud) = args.baud {
        figment = figment.merge(Serialized::default("sweep.baud_rate", baud));
    }
    if let Some(bias) = args.bias {
        figment = figment.merge(Serialized::default("sweep.dc_bias_mv", bias));
    }
    if let Some(level) = args.level {
        figment = figment.merge(Serialized::default("sweep.ac_level_mv", level));
    }
    if let Some(frequencies) = &args.frequencies {
        figment = figment.merge(Serialized::default("sweep.frequencies", frequencies));
    }
    if let Some(max_attempts) = args.max_attempts {
        figment = figment.merge(Serialized::default("sweep.retry.max_attempts", max_attempts));
    }
    if let Some(budget) = &args.budget {
        figment = figment.merge(Serialized::default("sweep.retry.budget", budget));
    }
    if args.strict {
        figment = figment.merge(Serialized::default("sweep.strict", true));
    }

    let config = AppConfig::from_figment(figment).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run_sweep(args: RunArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    let tracing_config = TracingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(args.log_format)
        .with_span_events(args.log_spans)
        .with_ansi(!args.no_color);
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    tracing::info!(
        port = %config.sweep.port,
        frequencies = config.sweep.frequencies.len(),
        simulate = args.simulate,
        "Starting sweep"
    );

    let (mut sink, samples) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_samples(samples, args.format));

    let outcome = if args.simulate {
        let connector = SimulatedConnector::new(SimulatedAnalyzer::new().with_busy_fetches(1));
        SessionController::new(connector)
            .run_sweep(&config.sweep, &mut sink)
            .await
    } else {
        SessionController::serial()
            .run_sweep(&config.sweep, &mut sink)
            .await
    };

    drop(sink);
    printer.await.context("Sample printer task failed")?;

    let result = outcome.with_context(|| format!("Sweep on {} failed", config.sweep.port))?;
    tracing::info!(
        samples = result.len(),
        display_style = ?config.application.display_style,
        "Sweep finished"
    );
    Ok(())
}

async fn print_samples(mut samples: mpsc::UnboundedReceiver<Sample>, style: OutputStyle) {
    if style == OutputStyle::Table {
        println!("{:>12}  {:>14}  {:>14}", "freq_hz", "a", "b");
    }
    while let Some(sample) = samples.recv().await {
        match style {
            OutputStyle::Table => println!(
                "{:>12}  {:>14.6}  {:>14.6}",
                sample.frequency, sample.measurement_a, sample.measurement_b
            ),
            OutputStyle::Json => match serde_json::to_string(&sample) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "Failed to encode sample"),
            },
        }
    }
}

fn show_config(path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::from_figment(AppConfig::figment(path.as_deref()))
        .context("Failed to load configuration")?;
    print!("{}", config.to_toml()?);
    Ok(())
}
