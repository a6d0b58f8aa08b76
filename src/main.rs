use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rover_motion_runtime::config::Config;

#[derive(Parser, Debug)]
#[command(about = "Motion control runtime for the rover base")]
struct Cli {
    /// Path to a JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the simulated motor bank
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(path) => match Config::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Configuration error: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if cli.simulate {
        config.simulate = true;
    }

    if let Err(e) = rover_motion_runtime::runtime::run(config).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
