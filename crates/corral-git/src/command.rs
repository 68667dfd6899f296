//! Thin runner for git subprocesses.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use corral_types::CorralError;

/// Runs `git` with a working directory, mapping failures into
/// [`CorralError::Vcs`] with the attempted command line and stderr attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    binary: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

/// The command line a [`Command`] is about to run, for error messages.
fn command_line(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run git in `cwd`, returning captured stdout on success.
    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<String, CorralError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.binary);
        command.current_dir(cwd).args(args);

        let output = command.output().map_err(|e| CorralError::Vcs {
            command: command_line(&command),
            status: None,
            stderr: format!("failed to start: {e}"),
        })?;

        if !output.status.success() {
            return Err(CorralError::Vcs {
                command: command_line(&command),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
