mod config;
mod telemetry;
#[cfg(test)]
mod testutils;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError};
use relay::RelayError;
use relay::config::ValidationError;
use relay::file_source::FileFlagClientFactory;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use telemetry::TelemetryError;

#[derive(Parser)]
#[command(name = "flag-relay", version, about = "Multi-environment feature flag relay")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Serve flag evaluation requests
    Run(ConfigArgs),
    /// Validate a configuration file and exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        CliCommand::Run(args) => run(&args.config),
        CliCommand::CheckConfig(args) => check_config(&args.config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn check_config(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.relay.validate()?;
    println!(
        "{}: ok, {} environment(s)",
        path.display(),
        config.relay.environments.len()
    );
    Ok(())
}

fn run(path: &Path) -> Result<(), CliError> {
    let config = Config::from_file(path)?;
    config.relay.validate()?;
    let _telemetry = telemetry::init(&config.common, relay::metrics_defs::ALL_METRICS)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    tracing::info!(
        environments = config.relay.environments.len(),
        "Starting flag relay"
    );
    runtime.block_on(relay::run(
        config.relay,
        Arc::new(FileFlagClientFactory),
        shutdown_signal(),
    ))?;
    tracing::info!("Flag relay stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::write_tmp_file;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["flag-relay", "run", "--config", "/etc/relay.yaml"])
            .expect("valid arguments");
        assert!(matches!(
            cli.command,
            CliCommand::Run(ConfigArgs { config }) if config == Path::new("/etc/relay.yaml")
        ));

        let cli = Cli::try_parse_from(["flag-relay", "check-config", "-c", "relay.yaml"])
            .expect("valid arguments");
        assert!(matches!(cli.command, CliCommand::CheckConfig(_)));

        assert!(Cli::try_parse_from(["flag-relay", "run"]).is_err());
    }

    #[test]
    fn check_config_validates() {
        let valid = write_tmp_file(
            r#"
            listener: {host: 0.0.0.0, port: 8030}
            admin_listener: {host: 127.0.0.1, port: 8031}
            environments:
                - name: production
                  server_key: sdk-11111111-1111-4111-a111-111111111111
                  data_source: {type: file, path: /var/lib/relay/production.json}
            "#,
        );
        check_config(valid.path()).expect("valid config");

        let invalid = write_tmp_file(
            r#"
            listener: {host: 0.0.0.0, port: 8030}
            admin_listener: {host: 127.0.0.1, port: 8031}
            environments:
                - name: production
                  server_key: mob-ffffffff-ffff-4fff-afff-ffffffffffff
                  data_source: {type: file, path: /var/lib/relay/production.json}
            "#,
        );
        assert!(matches!(
            check_config(invalid.path()),
            Err(CliError::Validation(ValidationError::InvalidCredential { .. }))
        ));
    }
}
