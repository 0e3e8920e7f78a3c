use anyhow::Result;

use crate::{config::BootConfig, fs::luks2::Cryptsetup, unlock::VolumeSubsystem as _};

pub struct CloseCommand {
    pub config: BootConfig,
}

impl super::Command for CloseCommand {
    fn run(&self) -> Result<()> {
        let volume = &self.config.volume.name;
        tracing::info!("Close volume {volume} now");

        if !crate::fs::luks2::is_active(volume) {
            tracing::info!("The mapping for {volume} is not active, nothing to do");
            return Ok(());
        }

        tracing::info!("Removing mapping for {volume}");
        Cryptsetup::new(self.config.verbose).deactivate(volume)?;
        tracing::info!("The volume {volume} is closed now");

        Ok(())
    }
}
