//! Typed failures at the sandbox boundary.
//!
//! Everything above the sandbox layer propagates `anyhow::Error`; these variants survive the
//! conversion and can be recovered with [`anyhow::Error::downcast_ref`], which is how validation
//! probes and simulations tell an expected timeout apart from a broken environment.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single sandbox operation.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The command did not finish before its deadline and was killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    TimedOut {
        /// The command line that was running.
        command: String,
        /// The deadline it exceeded.
        timeout: Duration,
    },
    /// A command that was required to succeed exited with a non-zero code.
    #[error("command `{command}` failed with exit code {exit_code}:\n{output}")]
    NonZeroExit {
        /// The command line that failed.
        command: String,
        /// Its exit code (`-1` when killed by a signal).
        exit_code: i32,
        /// Combined stdout and stderr.
        output: String,
    },
    /// The process could not be started at all.
    #[error("could not launch `{program}`: {reason}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying cause.
        reason: String,
    },
    /// Host-side file system error while copying in or out of a sandbox.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// True for [`SandboxError::TimedOut`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::TimedOut { .. })
    }
}

/// Result alias used by [`Sandbox`](crate::sandbox::Sandbox) implementations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// True when `error` (or anything in its chain) is a sandbox timeout.
pub fn is_timeout(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<SandboxError>(), Some(e) if e.is_timeout()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn timeout_is_found_through_context() {
        let err: anyhow::Result<()> = Err(SandboxError::TimedOut {
            command: "sleep 10".into(),
            timeout: Duration::from_millis(5),
        })
        .context("simulation 3");
        assert!(is_timeout(&err.unwrap_err()));
    }

    #[test]
    fn non_zero_exit_is_not_a_timeout() {
        let err = anyhow::Error::from(SandboxError::NonZeroExit {
            command: "false".into(),
            exit_code: 1,
            output: String::new(),
        });
        assert!(!is_timeout(&err));
    }
}
