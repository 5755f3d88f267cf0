//! toolmesh CLI binary entry point.

use std::process::ExitCode;

use clap::Parser;
use toolmesh::cli::commands;
use toolmesh::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    commands::init_tracing();
    let cli = Cli::parse();

    match commands::run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
