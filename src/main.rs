use clap::Parser;
use tracing::error;

use media_dl::commands::{self, Cli};
use media_dl::utils::logging::init_tracing;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match commands::run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("❌ {:#}", err);
            eprintln!("Error: {:#}", err);
            commands::download::EXIT_FAILURE
        }
    };
    std::process::exit(code);
}
