#![allow(non_snake_case)]

use std::process::ExitCode;

use clap::Parser;
use rosterSync::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    match cli::cli(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "rosterSync stopped");
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
