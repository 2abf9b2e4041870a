use clap::Parser;
use std::process::ExitCode;

use scry::cli::args::{Cli, Commands};
use scry::cli::{backend, serve};
use scry::config::BridgeConfig;
use scry::error::exit_codes;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(e) => {
            let code = e.exit_code();
            // Lock contention maps to exit 0 and is not an error to report.
            if code != exit_codes::SUCCESS {
                eprintln!("Error: {e}");
            }
            ExitCode::from(code as u8)
        }
    }
}

async fn run(cli: Cli) -> scry::Result<()> {
    let config = BridgeConfig::load()?;

    match cli.command {
        Commands::Serve => serve::serve(config).await,
        Commands::Ping => backend::ping(&config).await,
        Commands::Status => backend::status(&config).await,
        Commands::Start => backend::start(&config).await,
        Commands::Stop => backend::stop(&config).await,
        Commands::Tools => backend::tools(&config).await,
        Commands::Call { name, args } => backend::call(&config, &name, &args).await,
    }
}
