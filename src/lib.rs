#![deny(clippy::disallowed_methods)]

pub mod cli;
pub mod cmd;
pub mod config;
pub mod fs;
pub mod switchroot;
pub mod terminal;
pub mod types;
pub mod unlock;

use anyhow::{Context as _, Result};
use cmd::IntoCommand as _;
use config::BootConfig;
use shadow_rs::shadow;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

shadow!(build);

pub fn run() -> Result<()> {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = cli::Cli::parse_args();
    let command = args
        .command
        .unwrap_or_else(|| cli::Command::Boot(Default::default()));

    if let cli::Command::Boot(_) = command {
        tracing::info!(
            "cryptinit version: v{}  commit: {}  buildtime: {}",
            build::PKG_VERSION,
            build::COMMIT_HASH,
            build::BUILD_TIME
        );
    }

    let mut config = BootConfig::load(args.config.as_deref())?;
    config.apply_overrides(&args.overrides);
    config.validate().context("Invalid configuration")?;

    if config.verbose {
        reload_handle
            .modify(|filter| {
                *filter = tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into())
            })
            .context("Failed to update log level to DEBUG")?;

        tracing::info!("Log level set to DEBUG");
    }
    tracing::debug!("Effective configuration: {config:?}");

    command.into_command(config).run()
}
