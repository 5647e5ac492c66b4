//! Keystone CLI
//!
//! Bootstraps Kubernetes control-plane nodes from a bare OS to a verified cluster.

use std::process::ExitCode;

use clap::Parser;
use keystone_common::telemetry::{init_telemetry, TelemetryConfig};
use tracing::error;

use keystone_cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        log_file: cli.log_file.clone(),
        ..Default::default()
    };
    if let Err(e) = init_telemetry(telemetry) {
        eprintln!("error: {}", e);
        return ExitCode::from(1);
    }

    match cli.run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "keystone failed");
            eprintln!("error: {}", e);
            ExitCode::from(1)
        }
    }
}
