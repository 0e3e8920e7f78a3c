use std::{ffi::OsString, path::PathBuf};

use clap::{Args, Parser};

use crate::build::CLAP_LONG_VERSION;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[clap(long_version = CLAP_LONG_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to the configuration file. Default value is /etc/cryptinit.toml, used only if present.
    #[clap(long, short = 'c', env = "CRYPTINIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

/// Settings that take precedence over the configuration file. Each one can also
/// come from the environment, which is how the kernel command line reaches PID 1.
#[derive(Args, Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Identifier of the encrypted volume, e.g. UUID=... or PARTLABEL=...
    #[clap(long, env = "CRYPTINIT_VOLUME")]
    pub volume: Option<String>,

    /// Name of the device-mapper mapping for the unlocked volume.
    #[clap(long, env = "CRYPTINIT_NAME")]
    pub name: Option<String>,

    /// Device holding the real root filesystem.
    #[clap(long, env = "CRYPTINIT_ROOT_DEVICE")]
    pub root_device: Option<PathBuf>,

    /// Init program to execute in the new root.
    #[clap(long, env = "CRYPTINIT_INIT")]
    pub init: Option<PathBuf>,

    /// Number of passphrase attempts.
    #[clap(long, env = "CRYPTINIT_ATTEMPTS")]
    pub attempts: Option<u32>,

    /// Enable debug logging.
    #[clap(long, short = 'v', default_value = "false")]
    pub verbose: bool,
}

#[derive(Parser, Debug)]
pub enum Command {
    /// Unlock the root volume, switch into it and execute the real init (default).
    #[command(name = "boot")]
    Boot(BootOptions),

    /// Close the mapping of the root volume.
    #[command(name = "close")]
    Close,

    /// Print the effective configuration.
    #[command(name = "dump-config")]
    DumpConfig,
}

#[derive(Parser, Debug, Default, Clone)]
pub struct BootOptions {
    /// Arguments passed on to the real init.
    #[arg(last = true)]
    pub init_args: Vec<OsString>,
}

impl Cli {
    /// Parses the process arguments.
    ///
    /// The kernel hands PID 1 every command line word it does not recognise, so
    /// as PID 1 a parse failure is not an error: the boot command runs with
    /// configuration from the environment and the words go to the real init.
    pub fn parse_args() -> Self {
        let args: Vec<OsString> = std::env::args_os().collect();
        Self::parse_args_from(args, std::process::id() == 1)
    }

    pub fn parse_args_from(args: Vec<OsString>, is_pid1: bool) -> Self {
        match Self::try_parse_from(&args) {
            Ok(cli) => cli,
            Err(e) if is_pid1 => {
                tracing::debug!("Arguments are not for us, passing them to init: {e}");
                let argv0 = args
                    .first()
                    .cloned()
                    .unwrap_or_else(|| OsString::from("cryptinit"));
                let mut cli = Self::try_parse_from([argv0]).unwrap_or_else(|e| e.exit());
                cli.command = Some(Command::Boot(BootOptions {
                    init_args: args.into_iter().skip(1).collect(),
                }));
                cli
            }
            Err(e) => e.exit(),
        }
    }
}
