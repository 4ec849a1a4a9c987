//! Sandboxes backed by a docker container.
//!
//! The container is started detached with `sleep infinity` and every operation goes through the
//! `docker` CLI on the host.

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context};
use tracing::debug;
use uuid::Uuid;

use super::{ExecOutput, Sandbox, SandboxFactory, LOG_DIR, WORKDIR};
use crate::{
    cgroup_manager::{LimitedProcess, ProcessOutcome},
    constraints::Constraints,
    error::{SandboxError, SandboxResult},
};

/// Exit code of coreutils `timeout` when the deadline expired.
const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code after `timeout -k` escalated to `SIGKILL`.
const KILLED_EXIT_CODE: i32 = 137;
/// Extra time given to the docker client on top of the in-container deadline.
const CLIENT_MARGIN: Duration = Duration::from_secs(30);

/// Starts one container per sandbox from `image`.
#[derive(Debug, Clone)]
pub struct DockerSandboxFactory {
    image: String,
    root: String,
    default_timeout: Duration,
    max_memory: i64,
    max_pids: i64,
}

impl DockerSandboxFactory {
    /// Containers from `image`, with the sandbox root at `/arena`.
    pub fn new(image: &str, constraints: &Constraints) -> Self {
        Self {
            image: image.to_string(),
            root: "/arena".to_string(),
            default_timeout: constraints.command_timeout(),
            max_memory: constraints.sandbox_ram(),
            max_pids: constraints.sandbox_pids(),
        }
    }

    /// Use another sandbox root inside the container.
    pub fn with_root(mut self, root: &str) -> Self {
        self.root = root.trim_end_matches('/').to_string();
        self
    }

    fn run_args(&self, container: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container.to_string(),
        ];
        if self.max_memory > 0 {
            args.push(format!("--memory={}b", self.max_memory));
        }
        if self.max_pids > 0 {
            args.push(format!("--pids-limit={}", self.max_pids));
        }
        args.extend([
            self.image.clone(),
            "sleep".to_string(),
            "infinity".to_string(),
        ]);
        args
    }
}

impl SandboxFactory for DockerSandboxFactory {
    fn create(&self, name: &str) -> anyhow::Result<Arc<dyn Sandbox>> {
        let id = Uuid::new_v4().simple().to_string();
        let container = format!("arena-{name}-{}", &id[..8]);
        let out = docker(&self.run_args(&container), self.default_timeout)
            .with_context(|| format!("could not start container from {}", self.image))?;
        if !out.success() {
            bail!("docker run failed: {}", out.output.trim());
        }
        let sandbox = DockerSandbox {
            name: name.to_string(),
            container,
            root: self.root.clone(),
            default_timeout: self.default_timeout,
        };
        sandbox
            .execute_checked(
                &format!(
                    "mkdir -p {} {}",
                    sandbox.resolve(WORKDIR),
                    sandbox.resolve(LOG_DIR)
                ),
                Some(""),
                None,
            )
            .context("could not prepare sandbox directories")?;
        debug!("Started container {}", sandbox.container);
        Ok(Arc::new(sandbox))
    }
}

/// One running container.
#[derive(Debug)]
pub struct DockerSandbox {
    name: String,
    container: String,
    root: String,
    default_timeout: Duration,
}

impl DockerSandbox {
    fn exec_args(&self, command: &str, cwd: &str, timeout: Duration) -> Vec<String> {
        vec![
            "exec".to_string(),
            "-w".to_string(),
            cwd.to_string(),
            self.container.clone(),
            "timeout".to_string(),
            "-k".to_string(),
            "5".to_string(),
            timeout.as_secs().max(1).to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]
    }

    fn container_path(&self, path: &str) -> String {
        format!("{}:{}", self.container, self.resolve(path))
    }
}

/// Whether an exec ended because its in-container deadline expired. A `SIGKILL` before the
/// deadline (out of memory, killed by the bot itself) is an ordinary failure.
fn hit_deadline(exit_code: i32, elapsed: Duration, timeout: Duration) -> bool {
    let timeout = Duration::from_secs(timeout.as_secs().max(1));
    exit_code == TIMEOUT_EXIT_CODE || (exit_code == KILLED_EXIT_CODE && elapsed >= timeout)
}

fn docker(args: &[String], timeout: Duration) -> SandboxResult<ExecOutput> {
    let process = LimitedProcess::launch("docker", args, None, &[], None).map_err(|e| {
        SandboxError::Spawn {
            program: "docker".to_string(),
            reason: format!("{e:#}"),
        }
    })?;
    match process
        .wait_with_timeout(Some(timeout))
        .map_err(|e| std::io::Error::other(format!("{e:#}")))?
    {
        ProcessOutcome::Exited { exit_code, output } => Ok(ExecOutput { output, exit_code }),
        ProcessOutcome::TimedOut { .. } => Err(SandboxError::TimedOut {
            command: format!("docker {}", args.join(" ")),
            timeout,
        }),
    }
}

fn docker_checked(args: &[String], timeout: Duration) -> SandboxResult<()> {
    let out = docker(args, timeout)?;
    if out.success() {
        Ok(())
    } else {
        Err(SandboxError::NonZeroExit {
            command: format!("docker {}", args.join(" ")),
            exit_code: out.exit_code,
            output: out.output,
        })
    }
}

impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutput> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let cwd = self.resolve(cwd.unwrap_or(WORKDIR));
        let started = Instant::now();
        let out = docker(
            &self.exec_args(command, &cwd, timeout),
            timeout.saturating_add(CLIENT_MARGIN),
        )?;
        if hit_deadline(out.exit_code, started.elapsed(), timeout) {
            return Err(SandboxError::TimedOut {
                command: command.to_string(),
                timeout,
            });
        }
        Ok(out)
    }

    fn copy_in(&self, host_src: &Path, dest: &str) -> SandboxResult<()> {
        let target = self.resolve(dest);
        let (mkdir, source) = if host_src.is_dir() {
            (target.clone(), format!("{}/.", host_src.display()))
        } else {
            let parent = Path::new(&target)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| self.root.clone());
            (parent, host_src.display().to_string())
        };
        self.execute_checked(&format!("mkdir -p {}", super::quote(&mkdir)), Some(""), None)?;
        docker_checked(
            &["cp".to_string(), source, self.container_path(dest)],
            self.default_timeout,
        )
    }

    fn copy_out(&self, src: &str, host_dest: &Path) -> SandboxResult<()> {
        let probe = self.execute(
            &format!("test -d {}", super::quote(&self.resolve(src))),
            Some(""),
            None,
        )?;
        let source = if probe.success() {
            std::fs::create_dir_all(host_dest)?;
            format!("{}/.", self.container_path(src))
        } else {
            if let Some(parent) = host_dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.container_path(src)
        };
        docker_checked(
            &["cp".to_string(), source, host_dest.display().to_string()],
            self.default_timeout,
        )
    }

    fn resolve(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{path}", self.root)
        }
    }

    fn destroy(&self) -> SandboxResult<()> {
        let out = docker(
            &["rm".to_string(), "-f".to_string(), self.container.clone()],
            self.default_timeout,
        )?;
        if !out.success() && !out.output.contains("No such container") {
            return Err(SandboxError::NonZeroExit {
                command: format!("docker rm -f {}", self.container),
                exit_code: out.exit_code,
                output: out.output,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::ConstraintsBuilder;

    fn sandbox() -> DockerSandbox {
        DockerSandbox {
            name: "p1".into(),
            container: "arena-p1-1234abcd".into(),
            root: "/arena".into(),
            default_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn hard_killed_execs_past_the_deadline_timed_out() {
        let limit = Duration::from_secs(10);
        assert!(hit_deadline(124, Duration::from_secs(10), limit));
        assert!(hit_deadline(137, Duration::from_secs(15), limit));
        assert!(!hit_deadline(137, Duration::from_secs(2), limit));
        assert!(!hit_deadline(1, Duration::from_secs(15), limit));
        assert!(hit_deadline(137, Duration::from_millis(1200), Duration::from_millis(300)));
    }

    #[test]
    fn run_args_carry_limits() {
        let constraints = ConstraintsBuilder::new()
            .with_sandbox_ram(1)
            .with_sandbox_max_pids(32)
            .build()
            .unwrap();
        let factory = DockerSandboxFactory::new("arena/corewar", &constraints);
        let args = factory.run_args("arena-x");
        assert_eq!(&args[..5], ["run", "-d", "--rm", "--name", "arena-x"]);
        assert!(args.contains(&"--memory=1000000b".to_string()));
        assert!(args.contains(&"--pids-limit=32".to_string()));
        assert_eq!(
            &args[args.len() - 3..],
            ["arena/corewar", "sleep", "infinity"]
        );
    }

    #[test]
    fn exec_args_wrap_the_command_in_a_deadline() {
        let args = sandbox().exec_args("make all", "/arena/workspace", Duration::from_secs(90));
        assert_eq!(
            args,
            [
                "exec",
                "-w",
                "/arena/workspace",
                "arena-p1-1234abcd",
                "timeout",
                "-k",
                "5",
                "90",
                "sh",
                "-c",
                "make all"
            ]
        );
    }

    #[test]
    fn paths_resolve_under_the_root() {
        let sandbox = sandbox();
        assert_eq!(sandbox.resolve(""), "/arena");
        assert_eq!(sandbox.resolve("workspace"), "/arena/workspace");
        assert_eq!(
            sandbox.container_path("logs/sim_0.log"),
            "arena-p1-1234abcd:/arena/logs/sim_0.log"
        );
    }
}
