mod config;
mod sim;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{load_config_file, Cli, RuntimeConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load config file if specified.
    let config_file = match load_config_file(cli.config.as_ref()) {
        Ok(cf) => cf,
        Err(e) => {
            eprintln!("error loading config file: {}", e);
            std::process::exit(1);
        }
    };

    // Merge CLI and file config.
    let runtime_config = match RuntimeConfig::from_cli_and_file(&cli, config_file) {
        Ok(rc) => rc,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize logging (after merge so config file log_level is respected).
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&runtime_config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let report = match sim::run(runtime_config).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("simulation error: {}", e);
            std::process::exit(1);
        }
    };

    let m = &report.metrics;
    info!(
        number = report.head.number,
        hash = %report.head.hash,
        elapsed = ?report.elapsed,
        imported = m.imported,
        headers = m.headers.received,
        bodies = m.bodies.received,
        receipts = m.receipts.received,
        state = m.state.received,
        timed_out = m.headers.timed_out + m.bodies.timed_out + m.receipts.timed_out + m.state.timed_out,
        "simulation finished"
    );
    if !report.synced {
        if let Some(err) = &report.last_error {
            warn!(err = %err, "last sync error");
        }
        eprintln!(
            "target {} not reached (head at {})",
            report.target.number, report.head.number
        );
        std::process::exit(1);
    }
}
