//! Canopy Cluster - launch a fixed-size cluster of relay nodes
//!
//! Child `n` runs `CHILD_COMMAND` with `PORT=3200+n`. Output is forwarded
//! through the log, and every child is killed on Ctrl-C.

mod config;
mod supervisor;

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use crate::config::ClusterConfig;
use crate::supervisor::Supervisor;

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match ClusterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid cluster configuration");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        count = config.count,
        main_port = config.main_port,
        command = %config.program,
        "Starting cluster"
    );

    let supervisor = match Supervisor::launch(&config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start cluster");
            return ExitCode::FAILURE;
        }
    };

    let exits = supervisor.run().await;
    for exit in exits.iter().filter(|e| e.status.is_some_and(|s| !s.success())) {
        tracing::warn!(child = exit.index, port = exit.port, status = ?exit.status, "Child failed");
    }
    tracing::info!(exited = exits.len(), "Cluster stopped");
    ExitCode::SUCCESS
}
