//! indibus entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::Level;

use indibus_cli::cli::{Cli, Command, ConfigAction};
use indibus_cli::commands::{admin, config as config_cmd, property, serve};
use indibus_cli::config::CliConfig;
use indibus_cli::error::{ClientError, ClientResult};
use indibus_cli::socket::ControlClient;
use indibus_core::{TracingConfig, init_tracing};
use indibus_protocol::DriverSpec;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// The broker logs at the configured level; one-shot commands stay quiet
/// unless `--debug` is given.
fn tracing_config(cli: &Cli, config: &CliConfig) -> ClientResult<TracingConfig> {
    if cli.debug {
        return Ok(TracingConfig::cli_debug());
    }
    match cli.command {
        Command::Serve { .. } => config.logging.tracing_config().map_err(ClientError::Config),
        _ => Ok(TracingConfig::cli_debug().with_level(Level::WARN)),
    }
}

async fn run(cli: Cli) -> ClientResult<()> {
    let config = if let Some(ref path) = cli.config {
        CliConfig::load_from(path).map_err(ClientError::Config)?
    } else {
        CliConfig::load().map_err(ClientError::Config)?
    };

    init_tracing(tracing_config(&cli, &config)?)
        .map_err(|e| ClientError::Config(format!("failed to initialize logging: {}", e)))?;

    let control = || {
        ControlClient::new(
            config.socket_path(cli.socket.as_deref()),
            Duration::from_secs(cli.timeout.unwrap_or(config.server.timeout)),
        )
    };

    match &cli.command {
        Command::Serve {
            listen,
            port,
            drivers,
        } => {
            let options = serve::ServeOptions {
                listen: *listen,
                port: *port,
                drivers: drivers.clone(),
            };
            serve::run(&cli, &config, options).await
        }
        Command::Status => admin::status(&control()).await,
        Command::Devices => admin::devices(&control()).await,
        Command::Load { kind, target } => {
            let spec = DriverSpec {
                kind: *kind,
                target: target.clone(),
            };
            admin::load(&control(), spec).await
        }
        Command::Unload { identifier } => admin::unload(&control(), identifier.clone()).await,
        Command::Stop => admin::stop(&control()).await,
        Command::Watch {
            remote,
            device,
            property: name,
            blobs,
        } => property::watch(remote, device.clone(), name.clone(), *blobs).await,
        Command::Set {
            remote,
            assignments,
            wait,
        } => property::set(remote, assignments, Duration::from_secs(*wait)).await,
        Command::Config { action } => match action {
            ConfigAction::Dump => config_cmd::dump(&config),
            ConfigAction::Validate => config_cmd::validate(&config),
            ConfigAction::Path => config_cmd::path(),
        },
    }
}
