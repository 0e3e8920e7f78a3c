use std::{
    ffi::{OsStr, OsString},
    fs::File,
};

use anyhow::{Context as _, Result};
use nix::{
    sys::statfs::{FsType, RAMFS_MAGIC, TMPFS_MAGIC},
    unistd::{fork, ForkResult},
};

use crate::{fs::host::HostFs, types::DeviceId};

use super::OldRootHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub device: DeviceId,
    pub is_dir: bool,
}

/// Directory-descriptor primitives for sweeping a tree that is no longer
/// reachable by path.
pub trait ReapTree {
    type Dir;

    /// The `f_type` reported by `fstatfs`.
    fn fs_magic(&self, dir: &Self::Dir) -> Result<FsType>;

    fn device_id(&self, dir: &Self::Dir) -> Result<DeviceId>;

    fn entries(&self, dir: &Self::Dir) -> Result<Vec<OsString>>;

    /// Metadata of `name` itself, never of a symlink target.
    fn entry_meta(&self, dir: &Self::Dir, name: &OsStr) -> Result<EntryMeta>;

    fn open_child(&self, dir: &Self::Dir, name: &OsStr) -> Result<Self::Dir>;

    fn unlink(&self, dir: &Self::Dir, name: &OsStr, is_dir: bool) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub removed: usize,
    /// Entries on another device.
    pub crossed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// The old root is not an in-memory filesystem and was left untouched.
    Declined { magic: FsType },
    Swept(SweepStats),
}

fn is_memory_fs(magic: FsType) -> bool {
    magic == RAMFS_MAGIC || magic == TMPFS_MAGIC
}

/// Deletes everything on the old root's device, provided the old root is a
/// ramfs or tmpfs. The handle is consumed and closed on return.
pub fn reap<T: ReapTree>(tree: &T, old_root: OldRootHandle<T::Dir>) -> Result<ReapOutcome> {
    let dir = old_root.into_inner();

    let magic = tree
        .fs_magic(&dir)
        .context("Failed to query the filesystem type of the old root")?;
    if !is_memory_fs(magic) {
        tracing::warn!("Old root is not on ramfs or tmpfs ({magic:?}), leaving it alone");
        return Ok(ReapOutcome::Declined { magic });
    }

    let boundary = tree
        .device_id(&dir)
        .context("Failed to stat the old root")?;

    let mut stats = SweepStats::default();
    remove_tree(tree, &dir, boundary, &mut stats);
    tracing::debug!(?stats, "Old root swept");
    Ok(ReapOutcome::Swept(stats))
}

/// Removes the contents of `dir` bottom-up, leaving alone anything whose
/// device differs from `boundary`.
pub fn remove_tree<T: ReapTree>(
    tree: &T,
    dir: &T::Dir,
    boundary: DeviceId,
    stats: &mut SweepStats,
) {
    let names = match tree.entries(dir) {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!("Failed to list directory: {e:#}");
            stats.failed += 1;
            return;
        }
    };

    for name in names {
        let meta = match tree.entry_meta(dir, &name) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Failed to stat {name:?}: {e:#}");
                stats.failed += 1;
                continue;
            }
        };

        if meta.device != boundary {
            tracing::debug!("{name:?} is on device {}, not descending", meta.device);
            stats.crossed += 1;
            continue;
        }

        if meta.is_dir {
            match tree.open_child(dir, &name) {
                Ok(child) => remove_tree(tree, &child, boundary, stats),
                Err(e) => {
                    tracing::warn!("Failed to open {name:?}: {e:#}");
                    stats.failed += 1;
                    continue;
                }
            }
        }

        match tree.unlink(dir, &name, meta.is_dir) {
            Ok(()) => stats.removed += 1,
            Err(e) => {
                tracing::warn!("Failed to remove {name:?}: {e:#}");
                stats.failed += 1;
            }
        }
    }
}

/// Sweeps the old root from a forked child so the caller can move on to
/// exec the real init right away. The child is never waited for.
pub fn spawn_reaper(old_root: OldRootHandle<File>) {
    // SAFETY: the boot process is single-threaded, and the child only touches
    // state it owns before calling `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            if let Err(e) = reap(&HostFs, old_root) {
                tracing::warn!("Failed to free the old root: {e:#}");
            }
            // Skip atexit handlers and buffered state inherited from the parent.
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Parent { child }) => {
            tracing::debug!("Freeing the old root in process {child}");
            drop(old_root);
        }
        Err(e) => {
            tracing::warn!("Cannot fork to free the old root, it stays in memory: {e}");
        }
    }
}

#[cfg(test)]
pub mod tests {

    use std::{
        cell::{Cell, RefCell},
        collections::BTreeMap,
        os::unix::fs::MetadataExt as _,
        path::{Path, PathBuf},
        rc::Rc,
    };

    use anyhow::{anyhow, bail};
    use nix::sys::statfs::EXT4_SUPER_MAGIC;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum TreeOp {
        Open(PathBuf),
        Unlink(PathBuf),
    }

    struct FakeDir {
        path: PathBuf,
        open: Rc<Cell<usize>>,
    }

    impl Drop for FakeDir {
        fn drop(&mut self) {
            self.open.set(self.open.get() - 1);
        }
    }

    struct FakeTree {
        magic: FsType,
        nodes: RefCell<BTreeMap<PathBuf, EntryMeta>>,
        ops: RefCell<Vec<TreeOp>>,
        open: Rc<Cell<usize>>,
    }

    impl FakeTree {
        fn new(magic: FsType, root_device: u64) -> Self {
            let tree = Self {
                magic,
                nodes: RefCell::default(),
                ops: RefCell::default(),
                open: Rc::default(),
            };
            tree.add("/", root_device, true)
        }

        fn add(self, path: &str, device: u64, is_dir: bool) -> Self {
            self.nodes.borrow_mut().insert(
                path.into(),
                EntryMeta {
                    device: DeviceId(device),
                    is_dir,
                },
            );
            self
        }

        fn dir(&self, path: &str) -> FakeDir {
            self.open.set(self.open.get() + 1);
            FakeDir {
                path: path.into(),
                open: self.open.clone(),
            }
        }

        fn children(&self, path: &Path) -> Vec<PathBuf> {
            self.nodes
                .borrow()
                .keys()
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect()
        }

        fn ops(&self) -> Vec<TreeOp> {
            self.ops.borrow().clone()
        }

        fn position(&self, op: TreeOp) -> usize {
            self.ops()
                .iter()
                .position(|o| *o == op)
                .unwrap_or_else(|| panic!("{op:?} never happened"))
        }
    }

    impl ReapTree for FakeTree {
        type Dir = FakeDir;

        fn fs_magic(&self, _dir: &FakeDir) -> Result<FsType> {
            Ok(self.magic)
        }

        fn device_id(&self, dir: &FakeDir) -> Result<DeviceId> {
            self.nodes
                .borrow()
                .get(&dir.path)
                .map(|meta| meta.device)
                .ok_or_else(|| anyhow!("stale descriptor"))
        }

        fn entries(&self, dir: &FakeDir) -> Result<Vec<OsString>> {
            Ok(self
                .children(&dir.path)
                .into_iter()
                .filter_map(|p| p.file_name().map(OsStr::to_os_string))
                .collect())
        }

        fn entry_meta(&self, dir: &FakeDir, name: &OsStr) -> Result<EntryMeta> {
            self.nodes
                .borrow()
                .get(&dir.path.join(name))
                .copied()
                .ok_or_else(|| anyhow!("No such file or directory"))
        }

        fn open_child(&self, dir: &FakeDir, name: &OsStr) -> Result<FakeDir> {
            let path = dir.path.join(name);
            self.ops.borrow_mut().push(TreeOp::Open(path.clone()));
            Ok(self.dir(&path.to_string_lossy()))
        }

        fn unlink(&self, dir: &FakeDir, name: &OsStr, is_dir: bool) -> Result<()> {
            let path = dir.path.join(name);
            self.ops.borrow_mut().push(TreeOp::Unlink(path.clone()));
            if is_dir && !self.children(&path).is_empty() {
                bail!("Directory not empty");
            }
            self.nodes.borrow_mut().remove(&path);
            Ok(())
        }
    }

    #[test]
    fn test_reap_stays_on_boundary_device() -> Result<()> {
        let tree = FakeTree::new(RAMFS_MAGIC, 7)
            .add("/init", 7, false)
            .add("/mnt", 7, true)
            .add("/mnt/odd", 11, true)
            .add("/mnt/odd/keep", 11, false);
        let root = tree.dir("/");

        let outcome = reap(&tree, OldRootHandle::new(root))?;

        assert_eq!(
            outcome,
            ReapOutcome::Swept(SweepStats {
                removed: 1,
                crossed: 1,
                failed: 1,
            })
        );
        for op in tree.ops() {
            assert!(!matches!(
                &op,
                TreeOp::Open(p) | TreeOp::Unlink(p) if p.starts_with("/mnt/odd")
            ));
        }
        assert!(tree.nodes.borrow().contains_key(Path::new("/mnt/odd/keep")));
        assert!(!tree.nodes.borrow().contains_key(Path::new("/init")));
        assert_eq!(tree.open.get(), 0);
        Ok(())
    }

    #[test]
    fn test_reap_is_post_order() -> Result<()> {
        let tree = FakeTree::new(TMPFS_MAGIC, 7)
            .add("/etc", 7, true)
            .add("/etc/passwd", 7, false)
            .add("/etc/empty", 7, true);
        let root = tree.dir("/");

        let outcome = reap(&tree, OldRootHandle::new(root))?;

        assert!(matches!(outcome, ReapOutcome::Swept(stats) if stats.removed == 3));
        let parent = tree.position(TreeOp::Unlink("/etc".into()));
        assert!(tree.position(TreeOp::Unlink("/etc/passwd".into())) < parent);
        assert!(tree.position(TreeOp::Unlink("/etc/empty".into())) < parent);
        assert!(tree.position(TreeOp::Open("/etc/empty".into())) < parent);
        assert_eq!(tree.nodes.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn test_reap_declines_disk_filesystem() -> Result<()> {
        let tree = FakeTree::new(EXT4_SUPER_MAGIC, 7).add("/init", 7, false);
        let root = tree.dir("/");

        let outcome = reap(&tree, OldRootHandle::new(root))?;

        assert_eq!(outcome, ReapOutcome::Declined {
                magic: EXT4_SUPER_MAGIC
            });
        assert!(tree.ops().is_empty());
        assert_eq!(tree.open.get(), 0);
        Ok(())
    }

    #[test]
    fn test_remove_tree_on_real_directory() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        std::fs::create_dir_all(tmp.path().join("usr/lib/modules"))?;
        std::fs::write(tmp.path().join("usr/lib/modules/a.ko"), b"module")?;
        std::fs::write(tmp.path().join("init"), b"#!/bin/sh")?;
        std::os::unix::fs::symlink("/", tmp.path().join("escape"))?;
        let outside = tempfile::tempdir()?;
        std::fs::write(outside.path().join("precious"), b"keep")?;
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("usr/outside"))?;

        let dir = File::open(tmp.path())?;
        let boundary = DeviceId(dir.metadata()?.dev());
        let mut stats = SweepStats::default();
        remove_tree(&HostFs, &dir, boundary, &mut stats);

        assert_eq!(stats.failed, 0);
        assert_eq!(stats.removed, 7);
        assert_eq!(std::fs::read_dir(tmp.path())?.count(), 0);
        assert!(outside.path().join("precious").exists());
        Ok(())
    }

    #[test]
    fn test_memory_filesystem_magic() {
        assert!(is_memory_fs(RAMFS_MAGIC));
        assert!(is_memory_fs(TMPFS_MAGIC));
        assert!(!is_memory_fs(EXT4_SUPER_MAGIC));
    }

    #[test]
    fn test_host_reports_tmpfs() -> Result<()> {
        // /dev/shm is a tmpfs on any ordinary Linux host.
        let Ok(tmp) = tempfile::tempdir_in("/dev/shm") else {
            return Ok(());
        };
        let dir = File::open(tmp.path())?;

        let magic = HostFs.fs_magic(&dir)?;
        assert_eq!(magic, TMPFS_MAGIC);
        assert!(is_memory_fs(magic));
        Ok(())
    }
}
