//! Process plumbing shared by the archive and restore tools.

use std::ffi::{OsStr, OsString};
use std::fs::{self, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};

use anyhow::{anyhow, Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

/// A symlink named like the segment, pointing at one of our standard
/// streams, inside a private temporary directory.
#[derive(Debug)]
pub struct StreamLink {
    dir: TempDir,
    link: PathBuf,
}

impl StreamLink {
    /// Creates `<tmp>/<name>` pointing at `target`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of creating the directory or the link.
    pub fn create(name: &OsStr, target: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("pg_tde_")
            .tempdir()
            .context("could not create temporary directory")?;
        fs::set_permissions(dir.path(), Permissions::from_mode(0o700))
            .context("could not restrict temporary directory")?;

        let link = dir.path().join(name);
        std::os::unix::fs::symlink(target, &link)
            .with_context(|| format!("could not create symlink \"{}\"", link.display()))?;
        debug!(link = %link.display(), target = %target.display(), "created stream link");
        Ok(Self { dir, link })
    }

    /// Returns the symlink path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.link
    }

    /// Removes the symlink and the directory, warning on failure.
    pub fn remove(self) {
        if let Err(err) = fs::remove_file(&self.link) {
            warn!(path = %self.link.display(), error = %err, "could not remove symlink");
        }
        let dir = self.dir.path().to_path_buf();
        if let Err(err) = self.dir.close() {
            warn!(path = %dir.display(), error = %err, "could not remove temporary directory");
        }
    }
}

/// Replaces every argument equal to `from` with `to`.
#[must_use]
pub fn substitute(args: &[OsString], from: &Path, to: &Path) -> Vec<OsString> {
    args.iter()
        .map(|arg| if Path::new(arg) == from { to.as_os_str().to_owned() } else { arg.clone() })
        .collect()
}

/// Replaces the current process with `command`.
///
/// Only returns on failure, with the error of `exec`.
#[must_use]
pub fn exec(command: &[OsString]) -> anyhow::Error {
    let Some((program, args)) = command.split_first() else {
        return anyhow!("no command given");
    };
    let err = Command::new(program).args(args).exec();
    anyhow::Error::new(err).context(format!("could not run \"{}\"", program.to_string_lossy()))
}

/// A spawned wrapped command, killed if dropped before it was waited on.
#[derive(Debug)]
pub struct ChildGuard {
    child: Option<Child>,
    program: String,
}

impl ChildGuard {
    /// Spawns `command` with the given stdin and stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if `command` is empty or cannot be started.
    pub fn spawn(command: &[OsString], stdin: Stdio, stdout: Stdio) -> Result<Self> {
        let (executable, args) = command.split_first().context("no command given")?;
        let program = executable.to_string_lossy().into_owned();
        let child = Command::new(executable)
            .args(args)
            .stdin(stdin)
            .stdout(stdout)
            .spawn()
            .with_context(|| format!("could not run \"{program}\""))?;
        debug!(program = program.as_str(), pid = child.id(), "spawned command");
        Ok(Self { child: Some(child), program })
    }

    /// Takes the write end of the child's stdin pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin was not piped.
    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.child
            .as_mut()
            .and_then(|child| child.stdin.take())
            .context("command stdin is not a pipe")
    }

    /// Takes the read end of the child's stdout pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if stdout was not piped.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .as_mut()
            .and_then(|child| child.stdout.take())
            .context("command stdout is not a pipe")
    }

    /// Waits for the child and fails unless it exited successfully.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-zero exit status or a failed wait.
    pub fn finish(mut self) -> Result<()> {
        let status = self.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("command \"{}\" failed: {status}", self.program))
        }
    }

    fn wait(&mut self) -> Result<ExitStatus> {
        let mut child = self.child.take().context("command was already waited on")?;
        child.wait().with_context(|| format!("could not wait for \"{}\"", self.program))
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Reads until `buf` is full or the stream ends.
///
/// # Errors
///
/// Returns the underlying I/O error.
pub fn read_block(input: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match input.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}
