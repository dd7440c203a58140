mod cli;
mod handlers;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use dlqueue::ConfigManager;
use std::path::PathBuf;
use std::process;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Validate CLI arguments first
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }

    // Initialize logging based on verbosity
    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let mut config_manager = match &args.config {
        Some(file) => ConfigManager::with_file(PathBuf::from(file))?,
        None => ConfigManager::new()?,
    };

    if !args.skips_config_validation() {
        if let Err(e) = config_manager.validate() {
            eprintln!("Configuration validation failed: {:#}", e);
            eprintln!("Run 'dlqueue config reset' to restore defaults");
            process::exit(1);
        }
    }

    match args.command {
        Commands::Get {
            urls,
            output_dir,
            path,
            headers,
            user_agent,
            timeout,
        } => {
            handlers::handle_get(
                &config_manager,
                urls,
                output_dir,
                path,
                headers,
                user_agent,
                timeout,
            )
            .await?;
        }
        Commands::Config { action } => {
            handlers::handle_config(&mut config_manager, action).await?;
        }
    }

    Ok(())
}
