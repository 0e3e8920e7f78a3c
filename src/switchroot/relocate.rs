use std::path::{Path, PathBuf};

use crate::types::DeviceId;

use super::{DetachMode, RootOps};

/// Device ids of the current root and of the root that is about to replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootDevices {
    pub old: DeviceId,
    pub new: DeviceId,
}

/// A transient mount of the initramfs and the device it was found on, if it
/// could be stat'ed at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub device: Option<DeviceId>,
}

impl MountPoint {
    pub fn inspect(sys: &impl RootOps, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            device: sys.device_id(path).ok(),
        }
    }

    /// Where this mount lands under `new_root`.
    pub fn target_under(&self, new_root: &Path) -> PathBuf {
        new_root.join(self.path.strip_prefix("/").unwrap_or(&self.path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Lives on the old root itself, so it was never mounted separately.
    Skip,
    /// The target is not a plain directory of the new root (missing, or
    /// something is mounted there already).
    Detach,
    Move { target: PathBuf },
}

/// Decides what happens to `mount`. `target_device` is the device of the
/// mount's prospective location under the new root.
pub fn classify(
    mount: &MountPoint,
    roots: &RootDevices,
    target: PathBuf,
    target_device: Option<DeviceId>,
) -> Disposition {
    if mount.device == Some(roots.old) {
        return Disposition::Skip;
    }

    match target_device {
        Some(device) if device == roots.new => Disposition::Move { target },
        _ => Disposition::Detach,
    }
}

/// Moves each of `mounts` into `new_root`, or detaches it when it cannot be
/// moved. Failures are logged; none of them stops the boot.
pub fn relocate(sys: &impl RootOps, roots: &RootDevices, new_root: &Path, mounts: &[PathBuf]) {
    for path in mounts {
        let mount = MountPoint::inspect(sys, path);
        let target = mount.target_under(new_root);
        let target_device = sys.device_id(&target).ok();

        match classify(&mount, roots, target, target_device) {
            Disposition::Skip => {
                tracing::debug!("{path:?} is not a separate mount, skipping");
            }
            Disposition::Detach => {
                tracing::debug!("{path:?} cannot be moved into the new root, detaching it");
                if let Err(e) = sys.detach(path, DetachMode::Lazy) {
                    tracing::warn!("Failed to detach {path:?}: {e:#}");
                }
            }
            Disposition::Move { target } => {
                tracing::debug!("Moving {path:?} to {target:?}");
                if let Err(e) = sys.move_mount(path, &target) {
                    tracing::warn!("Failed to move {path:?} to {target:?}, forcing unmount: {e:#}");
                    if let Err(e) = sys.detach(path, DetachMode::Force) {
                        tracing::warn!("Failed to force unmount of {path:?}: {e:#}");
                    }
                }
            }
        }
    }
}
