use anyhow::{Context as _, Result};

use crate::config::BootConfig;

pub struct DumpConfigCommand {
    pub config: BootConfig,
}

impl super::Command for DumpConfigCommand {
    fn run(&self) -> Result<()> {
        let dumped =
            toml::to_string_pretty(&self.config).context("Failed to serialize configuration")?;
        print!("{dumped}");
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_dumped_config_loads_back() -> Result<()> {
        let mut config = BootConfig::default();
        config.volume.max_attempts = 2;
        config.root.read_only = false;

        let dumped = toml::to_string_pretty(&config)?;
        let loaded: BootConfig = toml::from_str(&dumped)?;

        assert_eq!(loaded.volume.max_attempts, 2);
        assert!(!loaded.root.read_only);
        assert_eq!(loaded.transient_mounts, config.transient_mounts);
        Ok(())
    }
}
