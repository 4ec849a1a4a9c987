//! Isolated, disposable execution environments.
//!
//! A sandbox is owned by exactly one player or arena worker at a time. Every path handed to a
//! sandbox is relative to its root:
//!
//! - [`WORKDIR`] holds the codebase and is the default working directory,
//! - [`LOG_DIR`] holds round logs,
//! - [`OPPONENTS_DIR`] holds read-only opponent mirrors in transparent mode,
//! - [`SUBMISSIONS_DIR`] holds the competitors' codebases inside an arena sandbox.

pub mod docker;
pub mod local;

use std::{
    fmt::Debug,
    fs,
    path::Path,
    sync::Arc,
    time::Duration,
};

use tracing::warn;

use crate::error::{SandboxError, SandboxResult};

/// Codebase directory, relative to the sandbox root.
pub const WORKDIR: &str = "workspace";
/// Log directory, relative to the sandbox root.
pub const LOG_DIR: &str = "logs";
/// Opponent mirrors, relative to the sandbox root.
pub const OPPONENTS_DIR: &str = "opponents";
/// Competitor codebases inside an arena sandbox, relative to the sandbox root.
pub const SUBMISSIONS_DIR: &str = "submissions";

/// Where `player`'s codebase lives inside an arena sandbox.
pub fn submission_path(player: &str) -> String {
    format!("{SUBMISSIONS_DIR}/{player}")
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Interleaved stdout and stderr.
    pub output: String,
    /// Exit code, `-1` when killed by a signal.
    pub exit_code: i32,
}

impl ExecOutput {
    /// Exit code is zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An isolated execution environment.
///
/// Directory copies copy the *contents* of the source into the destination, creating it when
/// needed. File copies create missing parent directories.
pub trait Sandbox: Send + Sync + Debug {
    /// Human readable name, unique among live sandboxes.
    fn name(&self) -> &str;

    /// Run `command` through `sh -c`. `cwd` defaults to [`WORKDIR`]; `timeout` defaults to the
    /// sandbox's command timeout. A non-zero exit code is not an error.
    fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutput>;

    /// Copy a host file or directory to `dest`.
    fn copy_in(&self, host_src: &Path, dest: &str) -> SandboxResult<()>;

    /// Copy `src` out to a host file or directory.
    fn copy_out(&self, src: &str, host_dest: &Path) -> SandboxResult<()>;

    /// Absolute form of `path`, as seen by commands running inside the sandbox.
    fn resolve(&self, path: &str) -> String;

    /// Release every resource. Calling it twice is harmless.
    fn destroy(&self) -> SandboxResult<()>;

    /// Like [`Sandbox::execute`], but a non-zero exit code becomes [`SandboxError::NonZeroExit`].
    fn execute_checked(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutput> {
        let out = self.execute(command, cwd, timeout)?;
        if out.success() {
            Ok(out)
        } else {
            Err(SandboxError::NonZeroExit {
                command: command.to_string(),
                exit_code: out.exit_code,
                output: out.output,
            })
        }
    }

    /// Create (or overwrite) the file `dest` with `content`.
    fn write_file(&self, content: &str, dest: &str) -> SandboxResult<()> {
        let staging = tempfile::NamedTempFile::new()?;
        fs::write(staging.path(), content)?;
        self.copy_in(staging.path(), dest)
    }
}

/// Creates sandboxes from a fixed base image.
pub trait SandboxFactory: Send + Sync {
    /// A fresh sandbox named after `name`.
    fn create(&self, name: &str) -> anyhow::Result<Arc<dyn Sandbox>>;
}

/// Copy `src_path` of `src` to `dest_path` of `dest` through a host staging directory.
pub fn copy_between(
    src: &dyn Sandbox,
    src_path: &str,
    dest: &dyn Sandbox,
    dest_path: &str,
) -> SandboxResult<()> {
    let staging = tempfile::tempdir()?;
    let payload = staging.path().join("payload");
    src.copy_out(src_path, &payload)?;
    dest.copy_in(&payload, dest_path)
}

/// Single-quote `s` for `sh`.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Recursively copy the contents of `src` into `dest`, keeping symlinks as symlinks.
pub(crate) fn copy_dir_all(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)?;
            #[cfg(not(unix))]
            fs::copy(entry.path(), &target).map(|_| ())?;
        } else {
            copy_file(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy one file, replacing a read-only destination.
pub(crate) fn copy_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if dest.symlink_metadata().is_ok() {
        fs::remove_file(dest)?;
    }
    fs::copy(src, dest).map(|_| ())
}

/// Destroys the sandboxes it tracks when dropped, unless disarmed or told to keep them.
///
/// Hold one while a set of sandboxes is being assembled so that an early return does not leave
/// directories or containers behind.
#[derive(Debug)]
pub struct SandboxGuard {
    sandboxes: Vec<Arc<dyn Sandbox>>,
    keep: bool,
}

impl SandboxGuard {
    /// Guard that leaves everything in place on drop when `keep` is set.
    pub fn new(keep: bool) -> Self {
        Self {
            sandboxes: Vec::new(),
            keep,
        }
    }

    /// Track `sandbox` and hand it back.
    pub fn track(&mut self, sandbox: Arc<dyn Sandbox>) -> Arc<dyn Sandbox> {
        self.sandboxes.push(Arc::clone(&sandbox));
        sandbox
    }

    /// Number of tracked sandboxes.
    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    /// Stop tracking: the sandboxes now belong to whoever holds them.
    pub fn disarm(mut self) {
        self.sandboxes.clear();
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for sandbox in self.sandboxes.drain(..) {
            if let Err(e) = sandbox.destroy() {
                warn!("Could not release sandbox {}: {e}", sandbox.name());
            }
        }
    }
}

/// Copy a host file or directory to `dest` following the sandbox copy convention.
pub(crate) fn copy_host_path(src: &Path, dest: &Path) -> std::io::Result<()> {
    if src.is_dir() {
        copy_dir_all(src, dest)
    } else {
        copy_file(src, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_handles_single_quotes() {
        assert_eq!(quote("plain"), "'plain'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn copy_dir_copies_contents_recursively() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::write(src.path().join("a/b/file.txt"), "hello").unwrap();
        fs::write(src.path().join("top.txt"), "top").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("copy");
        copy_dir_all(src.path(), &target).unwrap();
        assert_eq!(
            fs::read_to_string(target.join("a/b/file.txt")).unwrap(),
            "hello"
        );
        assert_eq!(fs::read_to_string(target.join("top.txt")).unwrap(), "top");
    }
}
