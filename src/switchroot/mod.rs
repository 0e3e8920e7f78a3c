//! Moving from the initramfs into the real root filesystem.
//!
//! [`swap`] carries the transient mounts over, moves the new root onto `/` and
//! changes into it, handing back a descriptor on the old root.
//! [`reaper::spawn_reaper`] then empties the old root in a child process.

pub mod reaper;
pub mod relocate;

use std::path::{Path, PathBuf};

use anyhow::Result;
use thiserror::Error;

use crate::types::DeviceId;

use relocate::RootDevices;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachMode {
    /// `MNT_DETACH`: gone from the namespace now, cleaned up after last use.
    Lazy,
    /// `MNT_FORCE`.
    Force,
}

/// Mount-namespace and process-root primitives used by the root switch.
pub trait RootOps {
    type Dir;

    fn device_id(&self, path: &Path) -> Result<DeviceId>;

    fn is_dir(&self, path: &Path) -> bool;

    fn move_mount(&self, source: &Path, target: &Path) -> Result<()>;

    fn detach(&self, target: &Path, mode: DetachMode) -> Result<()>;

    fn chdir(&self, path: &Path) -> Result<()>;

    fn chroot(&self, path: &Path) -> Result<()>;

    fn open_dir(&self, path: &Path) -> Result<Self::Dir>;
}

/// The only reference left to the old root after [`swap`]. Dropping it closes
/// the descriptor.
#[derive(Debug)]
pub struct OldRootHandle<D> {
    dir: D,
}

impl<D> OldRootHandle<D> {
    pub fn new(dir: D) -> Self {
        Self { dir }
    }

    pub fn into_inner(self) -> D {
        self.dir
    }
}

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("Stat of {path:?} failed")]
    Stat {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("New root {path:?} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("New root {path:?} is on the same device ({device}) as the current root")]
    SameDevice { path: PathBuf, device: DeviceId },

    #[error("Failed to change directory to {path:?}")]
    Chdir {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Cannot open the current root directory")]
    OpenOldRoot {
        #[source]
        source: BoxError,
    },

    #[error("Failed to move {path:?} onto /")]
    MoveRoot {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Failed to change root")]
    Chroot {
        #[source]
        source: BoxError,
    },
}

impl SwapError {
    /// Whether the failure happened after `/` was already being replaced, in
    /// which case nothing can be unwound.
    pub fn is_irreversible(&self) -> bool {
        match self {
            SwapError::MoveRoot { .. } | SwapError::Chroot { .. } => true,
            SwapError::Chdir { path, .. } => path == Path::new("/"),
            _ => false,
        }
    }
}

impl RootDevices {
    pub fn stat(sys: &impl RootOps, new_root: &Path) -> Result<Self, SwapError> {
        let stat = |path: &Path| {
            sys.device_id(path).map_err(|e| SwapError::Stat {
                path: path.to_path_buf(),
                source: e.into(),
            })
        };
        Ok(Self {
            old: stat(Path::new("/"))?,
            new: stat(new_root)?,
        })
    }
}

/// Makes `new_root` the root of the process.
///
/// `mounts` are relocated into the new root first. The returned handle refers
/// to the root as it was before the switch.
pub fn swap<S: RootOps>(
    sys: &S,
    new_root: &Path,
    mounts: &[PathBuf],
) -> Result<OldRootHandle<S::Dir>, SwapError> {
    let roots = RootDevices::stat(sys, new_root)?;
    if !sys.is_dir(new_root) {
        return Err(SwapError::NotADirectory {
            path: new_root.to_path_buf(),
        });
    }
    if roots.old == roots.new {
        return Err(SwapError::SameDevice {
            path: new_root.to_path_buf(),
            device: roots.old,
        });
    }

    relocate::relocate(sys, &roots, new_root, mounts);

    let chdir = |path: &Path| {
        sys.chdir(path).map_err(|e| SwapError::Chdir {
            path: path.to_path_buf(),
            source: e.into(),
        })
    };

    chdir(new_root)?;

    let old_root = sys
        .open_dir(Path::new("/"))
        .map(OldRootHandle::new)
        .map_err(|e| SwapError::OpenOldRoot { source: e.into() })?;

    // From here on an early return drops `old_root`, closing the descriptor.
    sys.move_mount(new_root, Path::new("/"))
        .map_err(|e| SwapError::MoveRoot {
            path: new_root.to_path_buf(),
            source: e.into(),
        })?;
    sys.chroot(Path::new("."))
        .map_err(|e| SwapError::Chroot { source: e.into() })?;
    chdir(Path::new("/"))?;

    tracing::info!("Switched root to {new_root:?}");
    Ok(old_root)
}
