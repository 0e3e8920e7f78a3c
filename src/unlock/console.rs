use std::{
    fs::File,
    io::{Read, Write as _},
    os::fd::AsFd as _,
};

use anyhow::{bail, Context as _, Result};
use nix::errno::Errno;
use zeroize::Zeroize as _;

use crate::{terminal::TerminalGuard, types::Passphrase};

/// Source of passphrases for the unlock loop.
pub trait SecretConsole {
    /// Shows `prompt` and reads one secret line.
    fn read_secret(&mut self, prompt: &str) -> Result<Passphrase>;
}

/// Reads passphrases from the controlling terminal with echo turned off.
pub struct TtyConsole {
    tty: File,
}

impl TtyConsole {
    pub fn new(tty: File) -> Self {
        Self { tty }
    }

    /// Uses a duplicate of the process' stdin, which is `/dev/console` for PID 1.
    pub fn stdin() -> Result<Self> {
        let fd = std::io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .context("Failed to duplicate stdin")?;
        Ok(Self::new(File::from(fd)))
    }
}

impl SecretConsole for TtyConsole {
    fn read_secret(&mut self, prompt: &str) -> Result<Passphrase> {
        let mut stdout = std::io::stdout();
        write!(stdout, "{prompt}")?;
        stdout.flush()?;

        let guard = match TerminalGuard::acquire(self.tty.as_fd()) {
            Ok(guard) => Some(guard),
            Err(Errno::ENOTTY) => {
                tracing::debug!("Console input is not a terminal, reading without echo control");
                None
            }
            Err(e) => {
                return Err(e).context("Refusing to read a passphrase with echo enabled");
            }
        };

        let secret = read_secret_line(&mut &self.tty);

        // Echo has to be back before anything else is printed.
        if let Some(guard) = guard {
            guard.release();
        }
        // The newline typed by the user was not echoed.
        writeln!(stdout)?;

        secret
    }
}

/// Reads bytes up to a newline into a fresh [`Passphrase`].
///
/// Bytes are read one at a time so no intermediate buffer ever holds the secret.
/// A trailing `\r` is dropped. End of input before any newline is an error.
pub fn read_secret_line(reader: &mut impl Read) -> Result<Passphrase> {
    let mut passphrase = Passphrase::empty();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => bail!("Console closed before a passphrase was entered"),
            Ok(_) => match byte[0] {
                b'\n' => break,
                b => passphrase.push(b)?,
            },
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read passphrase"),
        }
    }
    byte.zeroize();

    if passphrase.as_bytes().last() == Some(&b'\r') {
        passphrase.pop();
    }

    Ok(passphrase)
}

#[cfg(test)]
pub mod tests {

    use std::{
        io::{Cursor, Seek as _, Write as _},
        os::fd::OwnedFd,
        thread::JoinHandle,
        time::{Duration, Instant},
    };

    use nix::{
        pty::openpty,
        sys::termios::{tcgetattr, LocalFlags},
    };

    use super::*;

    /// Types `input` on the master side once the slave has echo turned off.
    /// Hands the master back so the line stays open until the reader is done.
    fn type_when_silent(
        master: OwnedFd,
        slave: OwnedFd,
        input: &'static [u8],
    ) -> JoinHandle<Result<File>> {
        std::thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while tcgetattr(&slave)?.local_flags.contains(LocalFlags::ECHO) {
                if Instant::now() > deadline {
                    bail!("echo was never turned off");
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            let mut master = File::from(master);
            master.write_all(input)?;
            Ok(master)
        })
    }

    fn echo_enabled(fd: &OwnedFd) -> Result<bool> {
        Ok(tcgetattr(fd)?.local_flags.contains(LocalFlags::ECHO))
    }

    #[test]
    fn test_tty_console_silences_echo_while_reading() -> Result<()> {
        let pty = openpty(None, None)?;
        assert!(echo_enabled(&pty.slave)?);

        let typist = type_when_silent(pty.master, pty.slave.try_clone()?, b"hunter2\n");
        let mut console = TtyConsole::new(File::from(pty.slave.try_clone()?));
        let secret = console.read_secret("Enter passphrase: ")?;
        let _master = typist.join().expect("typist panicked")?;

        assert_eq!(secret.as_bytes(), b"hunter2");
        assert!(echo_enabled(&pty.slave)?);
        Ok(())
    }

    #[test]
    fn test_tty_console_restores_echo_after_eof() -> Result<()> {
        let pty = openpty(None, None)?;

        // VEOF at the start of a line makes the read return nothing.
        let typist = type_when_silent(pty.master, pty.slave.try_clone()?, b"\x04");
        let mut console = TtyConsole::new(File::from(pty.slave.try_clone()?));
        assert!(console.read_secret("Enter passphrase: ").is_err());
        let _master = typist.join().expect("typist panicked")?;

        assert!(echo_enabled(&pty.slave)?);
        Ok(())
    }

    #[test]
    fn test_read_secret_line() -> Result<()> {
        let mut input = Cursor::new(b"hunter2\nnext line\n".to_vec());
        let secret = read_secret_line(&mut input)?;
        assert_eq!(secret.as_bytes(), b"hunter2");

        let secret = read_secret_line(&mut input)?;
        assert_eq!(secret.as_bytes(), b"next line");
        Ok(())
    }

    #[test]
    fn test_read_secret_line_crlf() -> Result<()> {
        let mut input = Cursor::new(b"correct horse\r\n".to_vec());
        let secret = read_secret_line(&mut input)?;
        assert_eq!(secret.as_bytes(), b"correct horse");
        Ok(())
    }

    #[test]
    fn test_read_secret_line_empty_passphrase() -> Result<()> {
        let mut input = Cursor::new(b"\n".to_vec());
        assert!(read_secret_line(&mut input)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_read_secret_line_eof() {
        let mut input = Cursor::new(b"no newline".to_vec());
        assert!(read_secret_line(&mut input).is_err());

        let mut input = Cursor::new(Vec::new());
        assert!(read_secret_line(&mut input).is_err());
    }

    #[test]
    fn test_read_secret_line_too_long() {
        let mut raw = vec![b'x'; crate::types::MAX_PASSPHRASE_LEN + 1];
        raw.push(b'\n');
        assert!(read_secret_line(&mut Cursor::new(raw)).is_err());
    }

    #[test]
    fn test_tty_console_reads_from_non_terminal() -> Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(b"hunter2\n")?;
        file.rewind()?;

        let mut console = TtyConsole::new(file);
        let secret = console.read_secret("Enter passphrase: ")?;
        assert_eq!(secret.as_bytes(), b"hunter2");
        Ok(())
    }
}
