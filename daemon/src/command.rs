/// Silent execution of the configured duck/unduck commands.
///
/// Commands run through the platform shell with no visible window, and the
/// call blocks until the spawned process exits — the engine tick that fired
/// the edge waits for the command.
use anyhow::{Context, Result};

/// Runs a shell command to completion without showing a window.
pub trait CommandRunner {
    /// Executes `command` synchronously. Errors only when the process cannot
    /// be spawned or waited on; the command's own exit code is not inspected.
    fn run_silent(&mut self, command: &str) -> Result<()>;
}

/// [`CommandRunner`] backed by `cmd.exe /C` on Windows and `sh -c` elsewhere.
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run_silent(&mut self, command: &str) -> Result<()> {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            // STARTF_USESHOWWINDOW + SW_HIDE equivalent for console commands.
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            std::process::Command::new("cmd.exe")
                .args(["/C", command])
                .creation_flags(CREATE_NO_WINDOW)
                .status()
                .with_context(|| format!("Failed to run command: {command}"))?;
        }
        #[cfg(not(windows))]
        {
            std::process::Command::new("sh")
                .args(["-c", command])
                .status()
                .with_context(|| format!("Failed to run command: {command}"))?;
        }
        Ok(())
    }
}
