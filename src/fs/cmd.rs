use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};

pub trait CheckCommandOutput {
    fn run_with_status_checker<R>(&mut self, f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R>)
        -> Result<R>;
}

impl CheckCommandOutput for Command {
    fn run_with_status_checker<R>(
        &mut self,
        f: impl Fn(i32, Vec<u8>, Vec<u8>) -> Result<R>,
    ) -> Result<R> {
        // reset all locale settings for this command
        self.env("LC_ALL", "C");

        tracing::trace!(cmd=?self, "run external cmd");

        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("cmd: {self:?}"))
            .context("Failed to execute external command")?;

        let stdout = output.stdout;
        let stderr = output.stderr;
        let code = output.status.code();

        match code {
            Some(code) => f(code, stdout.clone(), stderr.clone()),
            None => Err(anyhow!("killed by signal")),
        }
        .with_context(|| {
            let stdout = String::from_utf8_lossy(&stdout);
            let stderr = String::from_utf8_lossy(&stderr);
            format!(
                "\ncmd: {:?}\nexit code: {}\nstdout: {}\nstderr: {}",
                self,
                code.map(|code| code.to_string())
                    .unwrap_or("unknown".to_string()),
                stdout.trim_end(),
                stderr.trim_end(),
            )
        })
    }
}

#[cfg(test)]
pub mod tests {

    use anyhow::bail;

    use super::*;

    fn succeed(code: i32, stdout: Vec<u8>, _stderr: Vec<u8>) -> Result<Vec<u8>> {
        match code {
            0 => Ok(stdout),
            _ => bail!("Bad exit code"),
        }
    }

    #[test]
    fn test_run_collects_stdout() -> Result<()> {
        let stdout = Command::new("sh")
            .args(["-c", "echo hello"])
            .run_with_status_checker(succeed)?;
        assert_eq!(stdout, b"hello\n");
        Ok(())
    }

    #[test]
    fn test_status_checker_sees_exit_code() -> Result<()> {
        let code = Command::new("sh")
            .args(["-c", "exit 2"])
            .run_with_status_checker(|code, _, _| Ok(code))?;
        assert_eq!(code, 2);

        let err = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 1"])
            .run_with_status_checker(succeed)
            .expect_err("non-zero exit");
        assert!(format!("{err:#}").contains("oops"));
        Ok(())
    }
}
