//! agentbus - topic-based message bus for multi-agent systems.

use clap::Parser;
use std::process::ExitCode;

use agentbus::{logging, Commands};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();
    let (settings, load_notes) = args.settings();

    // Initialize logging; keep the guard alive so the file writer flushes
    let _guard = match logging::init(&settings.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    for note in load_notes {
        tracing::warn!("{}", note);
    }

    // Run the command
    match args.run(&settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
