use clap::Parser;

mod cache;
mod catalog;
mod cli;
mod commands;
mod config;
mod defrag;
mod device;
mod engine;
mod error;
mod namespace;
mod recovery;
mod scheduler;
mod tapeops;
mod writeback;

use cli::{Args, Commands};
use config::load_config;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> error::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("TAPEVAULT_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();
    let config = load_config()?;

    match args.command {
        Commands::Serve => {
            commands::run_serve(&config).await?;
            Ok(0)
        }
        Commands::Reindex => {
            commands::run_reindex(&config).await?;
            Ok(0)
        }
        Commands::Status { json } => {
            commands::show_status(&config, json)?;
            Ok(0)
        }
        Commands::Config { action } => {
            commands::handle_config_command(action)?;
            Ok(0)
        }
    }
}
