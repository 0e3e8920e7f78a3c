use std::{
    ffi::{OsStr, OsString},
    fs::File,
    os::unix::fs::MetadataExt as _,
    path::Path,
};

use anyhow::{Context as _, Result};
use nix::{
    mount::{MntFlags, MsFlags},
    sys::statfs::{fstatfs, FsType},
};

use crate::{
    switchroot::{
        reaper::{EntryMeta, ReapTree},
        DetachMode, RootOps,
    },
    types::DeviceId,
};

use super::at;

/// The running system's mount table and filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFs;

impl RootOps for HostFs {
    type Dir = File;

    fn device_id(&self, path: &Path) -> Result<DeviceId> {
        let metadata =
            std::fs::metadata(path).with_context(|| format!("Failed to stat {path:?}"))?;
        Ok(DeviceId(metadata.dev()))
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn move_mount(&self, source: &Path, target: &Path) -> Result<()> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_MOVE,
            None::<&str>,
        )
        .with_context(|| format!("Failed to move mount {source:?} to {target:?}"))
    }

    fn detach(&self, target: &Path, mode: DetachMode) -> Result<()> {
        let flags = match mode {
            DetachMode::Lazy => MntFlags::MNT_DETACH,
            DetachMode::Force => MntFlags::MNT_FORCE,
        };
        nix::mount::umount2(target, flags)
            .with_context(|| format!("Failed to unmount {target:?} ({mode:?})"))
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        nix::unistd::chdir(path).with_context(|| format!("Failed to chdir to {path:?}"))
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        nix::unistd::chroot(path).with_context(|| format!("Failed to chroot to {path:?}"))
    }

    fn open_dir(&self, path: &Path) -> Result<File> {
        File::open(path).with_context(|| format!("Failed to open directory {path:?}"))
    }
}

impl ReapTree for HostFs {
    type Dir = File;

    fn fs_magic(&self, dir: &File) -> Result<FsType> {
        Ok(fstatfs(dir).context("fstatfs failed")?.filesystem_type())
    }

    fn device_id(&self, dir: &File) -> Result<DeviceId> {
        Ok(DeviceId(dir.metadata().context("fstat failed")?.dev()))
    }

    fn entries(&self, dir: &File) -> Result<Vec<OsString>> {
        Ok(at::read_dir_names(dir)?)
    }

    fn entry_meta(&self, dir: &File, name: &OsStr) -> Result<EntryMeta> {
        let stat = at::stat_at(dir, name)?;
        Ok(EntryMeta {
            device: DeviceId(stat.dev),
            is_dir: stat.is_dir,
        })
    }

    fn open_child(&self, dir: &File, name: &OsStr) -> Result<File> {
        Ok(at::open_dir_at(dir, name)?)
    }

    fn unlink(&self, dir: &File, name: &OsStr, is_dir: bool) -> Result<()> {
        Ok(at::unlink_at(dir, name, is_dir)?)
    }
}
