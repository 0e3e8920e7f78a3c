use std::os::fd::BorrowedFd;

use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

/// Keeps local echo off on a terminal for as long as it is alive.
///
/// The attributes captured by [`TerminalGuard::acquire`] are written back
/// exactly once, by [`TerminalGuard::release`] or on drop, whichever comes
/// first.
pub struct TerminalGuard<'fd> {
    fd: BorrowedFd<'fd>,
    saved: Option<Termios>,
}

impl<'fd> TerminalGuard<'fd> {
    pub fn acquire(fd: BorrowedFd<'fd>) -> nix::Result<Self> {
        let saved = tcgetattr(fd)?;

        let mut silent = saved.clone();
        silent.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(fd, SetArg::TCSAFLUSH, &silent)?;

        Ok(Self {
            fd,
            saved: Some(saved),
        })
    }

    /// Attributes the terminal had before the guard was taken.
    #[cfg(test)]
    pub fn saved(&self) -> Option<&Termios> {
        self.saved.as_ref()
    }

    pub fn release(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        let Some(saved) = self.saved.take() else {
            return;
        };
        if let Err(e) = tcsetattr(self.fd, SetArg::TCSAFLUSH, &saved) {
            tracing::warn!("Failed to restore terminal attributes: {e}");
        }
    }
}

impl Drop for TerminalGuard<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}
