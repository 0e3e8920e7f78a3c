use anyhow::Result;

use crate::config::BootConfig;

pub mod boot;
pub mod close;
pub mod dump_config;

pub trait Command {
    fn run(&self) -> Result<()>;
}

pub trait IntoCommand {
    fn into_command(self, config: BootConfig) -> Box<dyn Command>;
}

impl IntoCommand for crate::cli::Command {
    fn into_command(self, config: BootConfig) -> Box<dyn Command> {
        match self {
            crate::cli::Command::Boot(boot_options) => Box::new(boot::BootCommand {
                config,
                boot_options,
            }),
            crate::cli::Command::Close => Box::new(close::CloseCommand { config }),
            crate::cli::Command::DumpConfig => Box::new(dump_config::DumpConfigCommand { config }),
        }
    }
}
