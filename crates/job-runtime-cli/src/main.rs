use clap::Parser;
use job_runtime_cli::{run_cli, Cli};
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli).await {
        error!(error = %e, "jobctl failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
