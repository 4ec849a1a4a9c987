//! Host processes with captured output, deadlines and optional cgroup containment.

#[cfg(target_os = "linux")]
mod cgroup_manager_linux;

#[cfg(target_os = "linux")]
pub use cgroup_manager_linux::*;

#[cfg(not(target_os = "linux"))]
mod cgroup_manager_stub;

#[cfg(not(target_os = "linux"))]
pub use cgroup_manager_stub::*;

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};

use anyhow::Context;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How a [`LimitedProcess`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited by itself. `exit_code` is `-1` when it was killed by a signal.
    Exited {
        /// Exit code.
        exit_code: i32,
        /// Interleaved stdout and stderr.
        output: String,
    },
    /// The deadline passed and the whole process group was killed.
    TimedOut {
        /// Whatever was written before the kill.
        output: String,
    },
}

/// A child process in its own process group, writing stdout and stderr to one capture file.
#[derive(Debug)]
pub struct LimitedProcess {
    child: Child,
    capture: File,
    finished: bool,
}

impl LimitedProcess {
    /// Start `program` with `args`.
    ///
    /// When `group` is provided the new process is moved into it right after spawning; if that
    /// fails the process is killed and an error is returned.
    pub fn launch(
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &[(String, String)],
        group: Option<&SandboxCgroup>,
    ) -> anyhow::Result<LimitedProcess> {
        let capture = tempfile::tempfile().context("could not create output capture file")?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(capture.try_clone().context("could not share capture file")?)
            .stderr(capture.try_clone().context("could not share capture file")?)
            .envs(env.iter().map(|(k, v)| (k, v)));
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("command '{program}' not found"))?;
        let process = LimitedProcess {
            child,
            capture,
            finished: false,
        };
        if let Some(group) = group {
            // dropping `process` on error kills it
            group
                .add(process.id())
                .context("could not add process to cgroup")?;
        }
        Ok(process)
    }

    /// OS process id, which is also the process group id.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Wait until the process exits or `timeout` elapses.
    ///
    /// Background children left behind by a process that exits normally are not touched.
    pub fn wait_with_timeout(mut self, timeout: Option<Duration>) -> anyhow::Result<ProcessOutcome> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let status = loop {
            if let Some(status) = self.child.try_wait().context("could not poll process")? {
                break Some(status);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.kill();
                break None;
            }
            std::thread::sleep(POLL_INTERVAL);
        };
        self.finished = true;
        let output = self.read_output()?;
        Ok(match status {
            Some(status) => ProcessOutcome::Exited {
                exit_code: exit_code(status),
                output,
            },
            None => ProcessOutcome::TimedOut { output },
        })
    }

    fn read_output(&mut self) -> anyhow::Result<String> {
        let mut bytes = Vec::new();
        self.capture
            .seek(SeekFrom::Start(0))
            .context("could not rewind capture file")?;
        self.capture
            .read_to_end(&mut bytes)
            .context("could not read process output")?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        kill_process_group(self.child.id());
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for LimitedProcess {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "Process {} was not waited on before dropping, killing it",
                self.child.id()
            );
            self.kill();
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Send SIGKILL to every process in group `pgid`.
#[cfg(unix)]
pub fn kill_process_group(pgid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!("could not kill process group {pgid}: {e}");
    }
}
