use std::{
    convert::Infallible,
    ffi::{CString, OsString},
    os::unix::ffi::OsStrExt as _,
    path::Path,
};

use anyhow::{Context as _, Result};
use scopeguard::ScopeGuard;

use crate::{
    cli::BootOptions,
    config::BootConfig,
    fs::{
        host::HostFs,
        luks2::Cryptsetup,
        mount::{create_runtime_dirs, mount_pseudo_filesystems, RootMount},
        resolve::BlkidResolver,
    },
    switchroot::{self, reaper::spawn_reaper},
    unlock::{console::TtyConsole, unlock, UnlockRequest, VolumeSubsystem as _},
};

const BOOT_PATH: &str = "/bin:/usr/bin:/sbin";

pub struct BootCommand {
    pub config: BootConfig,
    pub boot_options: BootOptions,
}

impl super::Command for BootCommand {
    fn run(&self) -> Result<()> {
        std::env::set_var("PATH", BOOT_PATH);

        mount_pseudo_filesystems().context("Failed to set up the early filesystems")?;
        create_runtime_dirs()?;

        let cryptsetup = Cryptsetup::new(self.config.verbose);
        let request = UnlockRequest {
            identifier: self.config.volume_identifier()?,
            name: self.config.volume.name.clone(),
            max_attempts: self.config.volume.max_attempts,
            allow_discards: self.config.volume.allow_discards,
        };

        let activated = {
            let mut console = TtyConsole::stdin()?;
            unlock(&BlkidResolver::new(), &cryptsetup, &mut console, &request)?
        };
        let activated = scopeguard::guard(activated, |activated| {
            tracing::info!("Closing volume {} before giving up", activated.name);
            if let Err(e) = cryptsetup.deactivate(&activated.name) {
                tracing::warn!("Failed to close volume {}: {e:#}", activated.name);
            }
        });

        let root = RootMount::mount(&self.config.root)?;
        let root = scopeguard::guard(root, RootMount::unmount);

        let old_root =
            match switchroot::swap(&HostFs, root.mount_point(), &self.config.transient_mounts) {
                Ok(old_root) => old_root,
                Err(e) if e.is_irreversible() => {
                    ScopeGuard::into_inner(root);
                    ScopeGuard::into_inner(activated);
                    return Err(e).context("Root switch failed halfway through");
                }
                Err(e) => return Err(e.into()),
            };

        // The new root and the mapping under it now belong to the real init.
        ScopeGuard::into_inner(root);
        let activated = ScopeGuard::into_inner(activated);
        tracing::info!("Root filesystem on {:?} is in place", activated.mapped_device());

        spawn_reaper(old_root);

        match exec_init(&self.config.init, &self.boot_options.init_args)? {}
    }
}

fn init_argv(init: &Path, args: &[OsString]) -> Result<Vec<CString>> {
    std::iter::once(init.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("Argument {arg:?} contains a NUL byte"))
        })
        .collect()
}

fn exec_init(init: &Path, args: &[OsString]) -> Result<Infallible> {
    let argv = init_argv(init, args)?;
    tracing::info!("Executing {init:?}");
    nix::unistd::execv(&argv[0], &argv).with_context(|| format!("Failed to execute {init:?}"))
}
