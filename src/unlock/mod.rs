pub mod console;

use std::path::{Path, PathBuf};

use anyhow::Result;
use thiserror::Error;

use crate::types::{Passphrase, VolumeIdentifier};

use console::SecretConsole;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Maps a volume identifier to the block device carrying it.
pub trait VolumeResolver {
    fn resolve(&self, identifier: &VolumeIdentifier) -> Result<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Active,
    Inactive,
}

/// The encrypted-volume subsystem (libcryptsetup in production).
pub trait VolumeSubsystem {
    type Handle;

    fn open(&self, device: &Path) -> Result<Self::Handle>;

    fn load_metadata(&self, handle: &mut Self::Handle) -> Result<()>;

    /// Activates the volume as mapping `name`. Fails without leaving a mapping
    /// behind, including when `name` is already taken.
    fn activate(
        &self,
        handle: &mut Self::Handle,
        name: &str,
        secret: &Passphrase,
        allow_discards: bool,
    ) -> Result<()>;

    fn release(&self, handle: Self::Handle) {
        drop(handle);
    }

    fn deactivate(&self, name: &str) -> Result<()>;

    fn status(&self, name: &str) -> Result<VolumeStatus>;
}

#[derive(Debug, Clone)]
pub struct UnlockRequest {
    pub identifier: VolumeIdentifier,
    pub name: String,
    pub max_attempts: u32,
    pub allow_discards: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivatedVolume {
    pub name: String,
    /// The device the mapping was activated on. `None` when an existing
    /// mapping was adopted, since its backing device is not known.
    pub backing_device: Option<PathBuf>,
}

impl ActivatedVolume {
    pub fn mapped_device(&self) -> PathBuf {
        Path::new("/dev/mapper").join(&self.name)
    }
}

#[derive(Error, Debug)]
pub enum UnlockError {
    #[error("Cannot find volume {identifier}")]
    NoSuchVolume {
        identifier: VolumeIdentifier,
        #[source]
        source: BoxError,
    },

    #[error("Failed to open encrypted volume on {device:?}")]
    Open {
        device: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Failed to load encryption metadata from {device:?}")]
    InvalidMetadata {
        device: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Activation of volume {name} failed after {attempts} attempt(s)")]
    ExhaustedAttempts { name: String, attempts: u32 },
}

/// Unlocks the volume behind `request.identifier` as mapping `request.name`,
/// asking `console` for at most `request.max_attempts` passphrases.
pub fn unlock<S: VolumeSubsystem>(
    resolver: &impl VolumeResolver,
    subsystem: &S,
    console: &mut impl SecretConsole,
    request: &UnlockRequest,
) -> Result<ActivatedVolume, UnlockError> {
    let backing_device = resolver
        .resolve(&request.identifier)
        .map_err(|e| UnlockError::NoSuchVolume {
            identifier: request.identifier.clone(),
            source: e.into(),
        })?;
    tracing::info!("Found volume {} on {backing_device:?}", request.identifier);

    if is_active(subsystem, &request.name) {
        tracing::info!("The mapping for {} already exists", request.name);
        return Ok(ActivatedVolume {
            name: request.name.clone(),
            backing_device: None,
        });
    }

    let handle = subsystem
        .open(&backing_device)
        .map_err(|e| UnlockError::Open {
            device: backing_device.clone(),
            source: e.into(),
        })?;
    let mut handle = scopeguard::guard(handle, |handle| subsystem.release(handle));

    subsystem
        .load_metadata(&mut handle)
        .map_err(|e| UnlockError::InvalidMetadata {
            device: backing_device.clone(),
            source: e.into(),
        })?;

    let prompt = format!("Enter passphrase for {}: ", request.name);
    for attempt in 1..=request.max_attempts {
        let secret = match console.read_secret(&prompt) {
            Ok(secret) => secret,
            Err(e) => {
                tracing::warn!(
                    "Attempt {attempt}/{} failed: {e:#}",
                    request.max_attempts
                );
                continue;
            }
        };

        let result = subsystem.activate(
            &mut handle,
            &request.name,
            &secret,
            request.allow_discards,
        );
        secret.shred();

        match result {
            Ok(()) => {
                tracing::info!("Volume {} is active now", request.name);
                return Ok(ActivatedVolume {
                    name: request.name.clone(),
                    backing_device: Some(backing_device),
                });
            }
            Err(e) => tracing::warn!(
                "Attempt {attempt}/{} failed: {e:#}",
                request.max_attempts
            ),
        }
    }

    if is_active(subsystem, &request.name) {
        if let Err(e) = subsystem.deactivate(&request.name) {
            tracing::warn!("Failed to deactivate {}: {e:#}", request.name);
        }
    }
    drop(handle);

    Err(UnlockError::ExhaustedAttempts {
        name: request.name.clone(),
        attempts: request.max_attempts,
    })
}

fn is_active(subsystem: &impl VolumeSubsystem, name: &str) -> bool {
    match subsystem.status(name) {
        Ok(status) => status == VolumeStatus::Active,
        Err(e) => {
            tracing::warn!("Failed to query status of {name}: {e:#}");
            false
        }
    }
}
