use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::{cli::ConfigOverrides, types::VolumeIdentifier};

pub const CRYPTINIT_CONFIG_PATH_DEFAULT: &str = "/etc/cryptinit.toml";

/// Identifier of the encrypted root volume, fixed at build time when
/// `CRYPTINIT_DEFAULT_VOLUME` is set in the build environment.
pub const DEFAULT_VOLUME_IDENTIFIER: &str = match option_env!("CRYPTINIT_DEFAULT_VOLUME") {
    Some(identifier) => identifier,
    None => "PARTLABEL=cryptroot",
};

/// Everything the boot sequence needs to know. Built once at start-up and
/// passed down explicitly.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct BootConfig {
    /// Log at debug level, and let libcryptsetup log too.
    pub verbose: bool,

    /// The real init program executed after the root switch.
    pub init: PathBuf,

    /// Transient mounts of the initramfs that are carried over into the new
    /// root, or detached when that is not possible.
    pub transient_mounts: Vec<PathBuf>,

    pub volume: VolumeConfig,

    pub root: RootConfig,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct VolumeConfig {
    /// `UUID=`, `PARTUUID=`, `LABEL=`, `PARTLABEL=` or an absolute device path.
    pub identifier: String,

    /// Name of the device-mapper mapping, i.e. `/dev/mapper/<name>`.
    pub name: String,

    /// How many passphrases may be tried before giving up.
    pub max_attempts: u32,

    /// Pass discard requests through to the underlying device.
    pub allow_discards: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct RootConfig {
    pub device: PathBuf,
    pub mount_point: PathBuf,
    pub fstype: String,
    pub options: String,
    pub read_only: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            init: PathBuf::from("/sbin/init"),
            transient_mounts: ["/dev", "/proc", "/sys", "/run"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            volume: VolumeConfig::default(),
            root: RootConfig::default(),
        }
    }
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_VOLUME_IDENTIFIER.to_owned(),
            name: "root".to_owned(),
            max_attempts: 4,
            allow_discards: true,
        }
    }
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/mapper/root"),
            mount_point: PathBuf::from("/mnt/root"),
            fstype: "ext4".to_owned(),
            options: "errors=remount-ro,discard,commit=30".to_owned(),
            read_only: true,
        }
    }
}

impl BootConfig {
    /// Loads the configuration file, falling back to the built-in defaults.
    ///
    /// An explicitly given `path` must exist. Without one, the default path is
    /// used only if the file is present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => {
                if !path.is_file() {
                    bail!("Config file {path:?} does not exist or is not a regular file")
                }
                path
            }
            None => {
                let default_path = Path::new(CRYPTINIT_CONFIG_PATH_DEFAULT);
                if !default_path.exists() {
                    tracing::debug!("Config file not found, using defaults: {default_path:?}");
                    return Ok(Self::default());
                }
                default_path
            }
        };

        tracing::debug!("Loading config from: {config_path:?}");
        std::fs::read_to_string(config_path)
            .map_err(anyhow::Error::from)
            .and_then(|content| {
                toml::from_str::<BootConfig>(&content).context("Failed to parse content as TOML")
            })
            .with_context(|| format!("Failed to load config from: {config_path:?}"))
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(volume) = &overrides.volume {
            self.volume.identifier = volume.clone();
        }
        if let Some(name) = &overrides.name {
            // Keep the root device on the mapping unless it points elsewhere.
            let follows_mapping = self.root.device == self.mapped_device();
            self.volume.name = name.clone();
            if follows_mapping {
                self.root.device = self.mapped_device();
            }
        }
        if let Some(attempts) = overrides.attempts {
            self.volume.max_attempts = attempts;
        }
        if let Some(root_device) = &overrides.root_device {
            self.root.device = root_device.clone();
        }
        if let Some(init) = &overrides.init {
            self.init = init.clone();
        }
        if overrides.verbose {
            self.verbose = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.volume_identifier()?;

        if self.volume.name.is_empty() || self.volume.name.contains('/') {
            bail!(
                "Invalid mapping name `{}`: must be non-empty and must not contain '/'",
                self.volume.name
            );
        }
        if self.volume.max_attempts == 0 {
            bail!("volume.max_attempts must be at least 1");
        }

        let absolute = [&self.init, &self.root.mount_point]
            .into_iter()
            .chain(self.transient_mounts.iter());
        for path in absolute {
            if !path.is_absolute() {
                bail!("Path {path:?} must be absolute");
            }
        }

        Ok(())
    }

    pub fn volume_identifier(&self) -> Result<VolumeIdentifier> {
        self.volume
            .identifier
            .parse()
            .with_context(|| format!("Bad volume identifier `{}`", self.volume.identifier))
    }

    /// Path of the mapping once the volume is unlocked.
    pub fn mapped_device(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.volume.name)
    }
}
