use std::{
    fmt::{Debug, Display},
    path::PathBuf,
    str::FromStr,
};

use anyhow::{bail, Result};
use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Longest passphrase accepted from the console, in bytes.
pub const MAX_PASSPHRASE_LEN: usize = 512;

/// A passphrase typed at the console.
///
/// The backing buffer is allocated once with [`MAX_PASSPHRASE_LEN`] capacity so
/// that pushing bytes never reallocates and leaves stray copies behind.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Passphrase(Vec<u8>);

impl Passphrase {
    pub fn empty() -> Self {
        Self(Vec::with_capacity(MAX_PASSPHRASE_LEN))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn push(&mut self, byte: u8) -> Result<()> {
        if self.0.len() >= MAX_PASSPHRASE_LEN {
            bail!("Passphrase is longer than {MAX_PASSPHRASE_LEN} bytes");
        }
        self.0.push(byte);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<u8> {
        self.0.pop()
    }

    /// Overwrites the secret with fresh OS randomness, then zeroes and frees it.
    pub fn shred(self) {
        self.shred_with(&mut OsRng);
    }

    /// Missing entropy only skips the overwrite; the buffer is zeroed on drop
    /// either way.
    fn shred_with(mut self, rng: &mut impl RngCore) {
        if let Err(e) = rng.try_fill_bytes(&mut self.0) {
            tracing::warn!("Entropy failed, zeroing the passphrase only: {e}");
        }
    }
}

impl Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

#[cfg(test)]
impl From<&str> for Passphrase {
    fn from(value: &str) -> Self {
        let mut passphrase = Self::empty();
        passphrase.0.extend_from_slice(value.as_bytes());
        passphrase
    }
}

/// Identity of the filesystem an inode lives on (`st_dev`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

impl From<u64> for DeviceId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", libc::major(self.0), libc::minor(self.0))
    }
}

/// How the encrypted volume is located on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeIdentifier {
    Uuid(String),
    PartUuid(String),
    Label(String),
    PartLabel(String),
    Path(PathBuf),
}

impl VolumeIdentifier {
    /// The blkid tag name, or `None` for a plain device path.
    pub fn tag(&self) -> Option<&'static str> {
        match self {
            VolumeIdentifier::Uuid(_) => Some("UUID"),
            VolumeIdentifier::PartUuid(_) => Some("PARTUUID"),
            VolumeIdentifier::Label(_) => Some("LABEL"),
            VolumeIdentifier::PartLabel(_) => Some("PARTLABEL"),
            VolumeIdentifier::Path(_) => None,
        }
    }

    /// Directory under `/dev/disk` where udev keeps symlinks for this tag.
    pub fn udev_dir(&self) -> Option<&'static str> {
        match self {
            VolumeIdentifier::Uuid(_) => Some("/dev/disk/by-uuid"),
            VolumeIdentifier::PartUuid(_) => Some("/dev/disk/by-partuuid"),
            VolumeIdentifier::Label(_) => Some("/dev/disk/by-label"),
            VolumeIdentifier::PartLabel(_) => Some("/dev/disk/by-partlabel"),
            VolumeIdentifier::Path(_) => None,
        }
    }

    pub fn value(&self) -> String {
        match self {
            VolumeIdentifier::Uuid(v)
            | VolumeIdentifier::PartUuid(v)
            | VolumeIdentifier::Label(v)
            | VolumeIdentifier::PartLabel(v) => v.clone(),
            VolumeIdentifier::Path(path) => path.to_string_lossy().into_owned(),
        }
    }
}

impl FromStr for VolumeIdentifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with('/') {
            return Ok(VolumeIdentifier::Path(PathBuf::from(s)));
        }

        let Some((tag, value)) = s.split_once('=') else {
            bail!("Volume identifier `{s}` is neither TAG=value nor an absolute device path");
        };
        if value.is_empty() {
            bail!("Volume identifier `{s}` has an empty value");
        }
        let value = value.to_owned();
        Ok(match tag.to_ascii_uppercase().as_str() {
            "UUID" => VolumeIdentifier::Uuid(value),
            "PARTUUID" => VolumeIdentifier::PartUuid(value),
            "LABEL" => VolumeIdentifier::Label(value),
            "PARTLABEL" => VolumeIdentifier::PartLabel(value),
            _ => bail!("Unsupported volume identifier tag `{tag}`"),
        })
    }
}

impl Display for VolumeIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tag() {
            Some(tag) => write!(f, "{tag}={}", self.value()),
            None => f.write_str(&self.value()),
        }
    }
}
