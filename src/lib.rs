pub mod assembler;
pub mod cli;
pub mod config;
pub mod decoders;
pub mod error;
pub mod forge_api;
pub mod fsops;
pub mod image_decode;
pub mod overrides;
pub mod params;
pub mod parser;
pub mod payload;
pub mod queue;
pub mod verify;

#[cfg(test)]
mod testing;

use clap::Parser;
use cli::Cli;
use config::AppConfig;
pub use error::{Error, Result};

/// Entry point: parses flags, loads configuration and drives one command.
pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let working_dir = std::env::current_dir()?;
    let mut config = AppConfig::load(cli.config.as_deref(), &working_dir)?;
    cli.apply_to(&mut config);

    let cpu_count = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(8);
    let rayon_threads = config
        .parse_threads
        .unwrap_or_else(|| cpu_count.saturating_sub(1).max(2));
    if rayon::ThreadPoolBuilder::new()
        .num_threads(rayon_threads)
        .build_global()
        .is_ok()
    {
        log::info!(
            "Configured rayon global thread pool with {} workers ({} CPUs detected)",
            rayon_threads,
            cpu_count
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(cli::execute(cli, config))
}
