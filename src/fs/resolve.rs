use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context as _, Result};

use crate::{types::VolumeIdentifier, unlock::VolumeResolver};

use super::cmd::CheckCommandOutput as _;

/// Resolves identifiers the way libblkid does: udev symlinks first, then a
/// lookup through the `blkid` tool, since there is no udev this early in boot.
pub struct BlkidResolver {
    dev_disk: PathBuf,
}

impl BlkidResolver {
    pub fn new() -> Self {
        Self {
            dev_disk: PathBuf::from("/dev/disk"),
        }
    }

    fn from_udev_link(&self, identifier: &VolumeIdentifier) -> Option<PathBuf> {
        let dir = Path::new(identifier.udev_dir()?);
        let relative = dir.strip_prefix("/dev/disk").ok()?;
        let link = self.dev_disk.join(relative).join(identifier.value());
        match link.canonicalize() {
            Ok(device) => {
                tracing::debug!("Resolved {identifier} via {link:?}");
                Some(device)
            }
            Err(_) => None,
        }
    }

    fn from_blkid(&self, identifier: &VolumeIdentifier) -> Result<PathBuf> {
        let token = identifier.to_string();
        Command::new("blkid")
            .args(["--list-one", "--output", "device"])
            .args(["--match-token", &token])
            .run_with_status_checker(|code, stdout, _| match code {
                0 => Ok(Some(stdout)),
                // Nothing matched the token.
                2 => Ok(None),
                _ => bail!("Bad exit code"),
            })
            .and_then(|stdout| {
                let device = match stdout {
                    Some(stdout) => String::from_utf8(stdout)?.trim().to_owned(),
                    None => String::new(),
                };
                if device.is_empty() {
                    bail!("No block device matches {token}");
                }
                Ok(PathBuf::from(device))
            })
            .with_context(|| format!("Failed to scan block devices for {token}"))
    }
}

impl Default for BlkidResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeResolver for BlkidResolver {
    fn resolve(&self, identifier: &VolumeIdentifier) -> Result<PathBuf> {
        if let VolumeIdentifier::Path(path) = identifier {
            if !path.exists() {
                bail!("Device {path:?} does not exist");
            }
            return Ok(path.clone());
        }

        match self.from_udev_link(identifier) {
            Some(device) => Ok(device),
            None => self.from_blkid(identifier),
        }
    }
}
