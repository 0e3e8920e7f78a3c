//! Directory operations relative to an open directory descriptor.
//!
//! The old root is only reachable through a descriptor once the process has
//! changed its root, so every walk over it goes through the `*at` calls.

use std::{
    ffi::{OsStr, OsString},
    fs::File,
    os::{
        fd::{AsRawFd, FromRawFd as _, OwnedFd},
        unix::ffi::OsStrExt as _,
    },
};

use nix::{
    dir::Dir,
    fcntl::{AtFlags, OFlag},
    sys::stat::{fstatat, Mode, SFlag},
    unistd::{unlinkat, UnlinkatFlags},
};

/// What `fstatat` reports about a directory entry, without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStat {
    pub dev: u64,
    pub is_dir: bool,
}

const DIR_FLAGS: OFlag = OFlag::O_RDONLY
    .union(OFlag::O_DIRECTORY)
    .union(OFlag::O_CLOEXEC);

/// Opens the subdirectory `name` of `dir`, refusing to follow a symlink.
pub fn open_dir_at(dir: &impl AsRawFd, name: &OsStr) -> nix::Result<File> {
    let fd = nix::fcntl::openat(
        Some(dir.as_raw_fd()),
        name,
        DIR_FLAGS | OFlag::O_NOFOLLOW,
        Mode::empty(),
    )?;
    // SAFETY: `fd` was just returned by openat and is owned by nobody else.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

pub fn stat_at(dir: &impl AsRawFd, name: &OsStr) -> nix::Result<EntryStat> {
    let stat = fstatat(Some(dir.as_raw_fd()), name, AtFlags::AT_SYMLINK_NOFOLLOW)?;
    let kind = SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits());
    Ok(EntryStat {
        dev: stat.st_dev as u64,
        is_dir: kind == SFlag::S_IFDIR,
    })
}

pub fn unlink_at(dir: &impl AsRawFd, name: &OsStr, is_dir: bool) -> nix::Result<()> {
    let flags = match is_dir {
        true => UnlinkatFlags::RemoveDir,
        false => UnlinkatFlags::NoRemoveDir,
    };
    unlinkat(Some(dir.as_raw_fd()), name, flags)
}

/// Names of all entries in `dir` except `.` and `..`.
///
/// The directory is reopened through `.` so the stream gets its own file
/// offset and `dir` itself stays usable.
pub fn read_dir_names(dir: &impl AsRawFd) -> nix::Result<Vec<OsString>> {
    let mut stream = Dir::openat(Some(dir.as_raw_fd()), ".", DIR_FLAGS, Mode::empty())?;

    let mut names = Vec::new();
    for entry in stream.iter() {
        let entry = entry?;
        match entry.file_name().to_bytes() {
            b"." | b".." => continue,
            bytes => names.push(OsStr::from_bytes(bytes).to_os_string()),
        }
    }
    Ok(names)
}
