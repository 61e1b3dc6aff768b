//! CLI entry point for the Auto Encode Daemon.
//!
//! Parses command line arguments, initializes logging, and starts the
//! daemon with its status server.

use auto_encode_daemon::{Config, Daemon};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

/// Auto Encode Daemon - Automated HEVC transcoding with Dolby Vision support
#[derive(Parser, Debug)]
#[command(name = "auto-encode-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Working directory for encode intermediates and the recovery marker
    #[arg(short, long, default_value = "/tmp/auto-encode-daemon")]
    temp_dir: PathBuf,

    /// Skip startup checks (tool version probes). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        config = %args.config.display(),
        temp_dir = %args.temp_dir.display(),
        "auto encode daemon starting"
    );

    if let Err(e) = std::fs::create_dir_all(&args.temp_dir) {
        tracing::error!(error = %e, "cannot create temp directory");
        return ExitCode::FAILURE;
    }

    let daemon_result = if args.skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks enabled)");
        Config::load(&args.config)
            .map(|config| Daemon::new_without_checks(config, args.temp_dir))
            .map_err(|e| e.into())
    } else {
        Daemon::new(&args.config, args.temp_dir).await
    };

    match daemon_result {
        Ok(daemon) => {
            tracing::info!(
                bind_addr = %daemon.config.status_server.bind_addr,
                "daemon initialized, status server starting"
            );

            if let Err(e) = daemon.run_with_server().await {
                tracing::error!(error = %e, "daemon exited with error");
                return ExitCode::FAILURE;
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
