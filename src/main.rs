//! bhid daemon entry point

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use bhid::config::DEFAULT_CONFIG_DIR;
use bhid::runtime::{self, Options};

/// Peer-to-peer TCP tunneling daemon
#[derive(Parser, Debug)]
#[command(name = "bhid")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration directory
    #[arg(short, long, default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Socket and pidfile suffix, for running several daemons side by side
    #[arg(short, long)]
    suffix: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(true).init();

    let options = Options {
        config_dir: args.config_dir,
        suffix: args.suffix,
    };

    match runtime::run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
