//! ATRIUM CLI
//!
//! Loads a runtime configuration, builds the demonstration office and
//! triggers processes on it.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod demo;

use atrium_runtime::{Office, RuntimeConfig};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "atrium")]
#[command(about = "ATRIUM - function execution runtime", long_about = None)]
struct Cli {
    /// Runtime configuration file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger processes on the demonstration office
    Run {
        /// Function to trigger
        #[arg(short, long, default_value = "ingest")]
        function: String,
        /// Number of processes
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Print the effective configuration
    Config,
    /// Check a configuration and the office built from it
    Validate,
}

fn load_config(path: Option<&PathBuf>) -> Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::load(path).wrap_err_with(|| format!("loading {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &RuntimeConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn run(office: &Office, function: &str, count: usize) -> Result<()> {
    if !demo::ENTRY_POINTS.contains(&function) {
        bail!(
            "unknown entry point {}; expected one of {}",
            function,
            demo::ENTRY_POINTS.join(", ")
        );
    }
    office.open()?;

    let completions = (0..count)
        .map(|_| office.invoke_async(function, None))
        .collect::<Result<Vec<_>, _>>()?;
    for completion in completions {
        let id = completion.process().process_id();
        match completion.wait() {
            None => println!("{} completed", id),
            Some(escalation) => println!("{} failed: {}", id, escalation),
        }
    }

    office.close();
    println!("{}", serde_json::to_string_pretty(&office.metrics())?);
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Run { function, count } => {
            let office = demo::build(config)?;
            run(&office, &function, count)
        }
        Commands::Config => {
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
        Commands::Validate => {
            let office = demo::build(config)?;
            println!(
                "office {} valid: {} functions",
                office.name(),
                office.function_names().count()
            );
            Ok(())
        }
    }
}
