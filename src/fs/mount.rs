use std::{
    fs::DirBuilder,
    io,
    os::unix::fs::DirBuilderExt as _,
    path::Path,
};

use anyhow::{bail, Context as _, Result};
use nix::{errno::Errno, mount::MsFlags};

use crate::config::RootConfig;

/// A kernel-provided filesystem the initramfs needs before anything else runs.
#[derive(Debug, Clone, Copy)]
pub struct PseudoMount {
    pub source: &'static str,
    pub target: &'static str,
    pub fstype: &'static str,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
}

pub const PSEUDO_MOUNTS: [PseudoMount; 4] = [
    PseudoMount {
        source: "devtmpfs",
        target: "/dev",
        fstype: "devtmpfs",
        flags: MsFlags::MS_NOSUID,
        data: Some("mode=0755,size=1024k"),
    },
    PseudoMount {
        source: "proc",
        target: "/proc",
        fstype: "proc",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NOEXEC)
            .union(MsFlags::MS_NODEV),
        data: Some("hidepid=2"),
    },
    PseudoMount {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NOEXEC)
            .union(MsFlags::MS_NODEV),
        data: None,
    },
    PseudoMount {
        source: "none",
        target: "/run",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_RELATIME),
        data: Some("mode=0755,size=2048k"),
    },
];

impl PseudoMount {
    pub fn mount(&self) -> Result<()> {
        let result = nix::mount::mount(
            Some(self.source),
            self.target,
            Some(self.fstype),
            self.flags,
            self.data,
        );
        match result {
            Ok(()) => {
                tracing::debug!("Mounted {} on {}", self.fstype, self.target);
                Ok(())
            }
            Err(Errno::EBUSY) => {
                tracing::debug!("{} is already mounted", self.target);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to mount {} on {}", self.fstype, self.target)
            }),
        }
    }
}

pub fn mount_pseudo_filesystems() -> Result<()> {
    for mount in &PSEUDO_MOUNTS {
        mount.mount()?;
    }
    Ok(())
}

fn create_dir(path: &Path, mode: u32) -> io::Result<()> {
    match DirBuilder::new().recursive(true).mode(mode).create(path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        other => other,
    }
}

/// Directories under `/run` that libcryptsetup and friends expect.
pub fn create_runtime_dirs() -> Result<()> {
    create_dir(Path::new("/run/cryptsetup"), 0o700)
        .context("Failed to create /run/cryptsetup")?;

    if let Err(e) = create_dir(Path::new("/run/lock"), 0o755) {
        tracing::warn!("Failed to create /run/lock: {e}");
    }
    Ok(())
}

/// The mounted real root; unmount it with [`RootMount::unmount`] to back out.
#[derive(Debug)]
pub struct RootMount<'a> {
    config: &'a RootConfig,
}

impl<'a> RootMount<'a> {
    pub fn mount(config: &'a RootConfig) -> Result<Self> {
        let mount_point = &config.mount_point;
        create_dir(mount_point, 0o755)
            .with_context(|| format!("Failed to create mount point {mount_point:?}"))?;

        if !config.device.exists() {
            bail!("Root device {:?} does not exist", config.device);
        }

        let mut flags = MsFlags::MS_LAZYTIME;
        if config.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let data = (!config.options.is_empty()).then_some(config.options.as_str());

        nix::mount::mount(
            Some(&config.device),
            mount_point,
            Some(config.fstype.as_str()),
            flags,
            data,
        )
        .with_context(|| {
            format!(
                "Failed to mount {:?} ({}) on {mount_point:?}",
                config.device, config.fstype
            )
        })?;

        tracing::info!("Mounted {:?} on {mount_point:?}", config.device);
        Ok(Self { config })
    }

    pub fn mount_point(&self) -> &Path {
        &self.config.mount_point
    }

    pub fn unmount(self) {
        let mount_point = self.mount_point();
        if let Err(e) = nix::mount::umount2(mount_point, nix::mount::MntFlags::MNT_DETACH) {
            tracing::warn!("Failed to unmount {mount_point:?}: {e}");
        }
    }
}
