use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use libcryptsetup_rs::{
    consts::{
        flags::{CryptActivate, CryptDeactivate},
        vals::{CryptDebugLevel, EncryptionFormat},
    },
    CryptDevice, CryptInit,
};

use crate::{
    types::Passphrase,
    unlock::{VolumeStatus, VolumeSubsystem},
};

/// LUKS2 volumes through libcryptsetup.
pub struct Cryptsetup {
    verbose: bool,
}

impl Cryptsetup {
    pub fn new(verbose: bool) -> Self {
        let cryptsetup = Self { verbose };
        cryptsetup.set_debug_level();
        cryptsetup
    }

    fn set_debug_level(&self) {
        if self.verbose {
            libcryptsetup_rs::set_debug_level(CryptDebugLevel::All);
        } else {
            libcryptsetup_rs::set_debug_level(CryptDebugLevel::None);
        }
    }
}

impl VolumeSubsystem for Cryptsetup {
    type Handle = CryptDevice;

    fn open(&self, device: &Path) -> Result<CryptDevice> {
        CryptInit::init(device)
            .with_context(|| format!("Failed to initialize crypt device on {device:?}"))
    }

    fn load_metadata(&self, handle: &mut CryptDevice) -> Result<()> {
        handle
            .context_handle()
            .load::<()>(Some(EncryptionFormat::Luks2), None)
            .context("Failed to load LUKS2 header")?;
        Ok(())
    }

    fn activate(
        &self,
        handle: &mut CryptDevice,
        name: &str,
        secret: &Passphrase,
        allow_discards: bool,
    ) -> Result<()> {
        let flags = match allow_discards {
            true => CryptActivate::ALLOW_DISCARDS,
            false => CryptActivate::empty(),
        };
        handle
            .activate_handle()
            .activate_by_passphrase(Some(name), None, secret.as_bytes(), flags)
            .with_context(|| format!("Failed to setup mapping for volume {name}"))?;
        Ok(())
    }

    fn deactivate(&self, name: &str) -> Result<()> {
        let mut device = CryptInit::init_by_name_and_header(name, None)?;
        device
            .activate_handle()
            .deactivate(name, CryptDeactivate::empty())
            .with_context(|| format!("Failed to close volume `{name}`"))?;
        Ok(())
    }

    fn status(&self, name: &str) -> Result<VolumeStatus> {
        Ok(match is_active(name) {
            true => VolumeStatus::Active,
            false => VolumeStatus::Inactive,
        })
    }
}

pub fn is_active(volume: &str) -> bool {
    PathBuf::from(format!("/dev/mapper/{}", volume)).exists()
}
