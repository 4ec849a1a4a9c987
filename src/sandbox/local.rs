//! Sandboxes backed by a host directory.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{copy_dir_all, copy_host_path, ExecOutput, Sandbox, SandboxFactory, LOG_DIR, WORKDIR};
use crate::{
    cgroup_manager::{LimitedProcess, ProcessOutcome, SandboxCgroup},
    configuration::Configuration,
    constraints::Constraints,
    error::{SandboxError, SandboxResult},
};

/// Creates [`LocalSandbox`]es under `root_dir`, each starting with a copy of `base_image`.
#[derive(Debug, Clone)]
pub struct LocalSandboxFactory {
    base_image: PathBuf,
    root_dir: PathBuf,
    default_timeout: Duration,
    max_memory: i64,
    max_pids: i64,
    contain: bool,
    allow_uncontained: bool,
}

impl LocalSandboxFactory {
    /// `base_image` is a directory copied into every new sandbox's codebase directory.
    pub fn new(
        base_image: impl Into<PathBuf>,
        root_dir: impl Into<PathBuf>,
        constraints: &Constraints,
        config: &Configuration,
    ) -> Self {
        Self {
            base_image: base_image.into(),
            root_dir: root_dir.into(),
            default_timeout: constraints.command_timeout(),
            max_memory: constraints.sandbox_ram(),
            max_pids: constraints.sandbox_pids(),
            contain: config.contain,
            allow_uncontained: config.allow_uncontained,
        }
    }

    fn cgroup(&self, name: &str) -> anyhow::Result<Option<SandboxCgroup>> {
        if !self.contain {
            return Ok(None);
        }
        match SandboxCgroup::create(name, self.max_memory, self.max_pids) {
            Ok(group) => Ok(Some(group)),
            Err(e) if self.allow_uncontained => {
                warn!("Running sandbox {name} uncontained: {e:#}");
                Ok(None)
            }
            Err(e) => Err(e.context(format!(
                "could not contain sandbox {name}. Consider allowing uncontained execution"
            ))),
        }
    }
}

impl SandboxFactory for LocalSandboxFactory {
    fn create(&self, name: &str) -> anyhow::Result<Arc<dyn Sandbox>> {
        let id = Uuid::new_v4().simple().to_string();
        let dir_name = format!("{name}-{}", &id[..8]);
        let root = self.root_dir.join(&dir_name);
        fs::create_dir_all(root.join(WORKDIR))
            .with_context(|| format!("could not create sandbox {}", root.display()))?;
        fs::create_dir_all(root.join(LOG_DIR))?;
        if self.base_image.is_dir() {
            copy_dir_all(&self.base_image, &root.join(WORKDIR)).with_context(|| {
                format!("could not copy base image {}", self.base_image.display())
            })?;
        } else {
            anyhow::bail!("base image {} is not a directory", self.base_image.display());
        }
        let cgroup = self.cgroup(&dir_name)?;
        debug!("Created sandbox {}", root.display());
        Ok(Arc::new(LocalSandbox {
            name: name.to_string(),
            root,
            default_timeout: self.default_timeout,
            cgroup,
        }))
    }
}

/// A host directory where commands run through `sh -c`, each in its own process group.
#[derive(Debug)]
pub struct LocalSandbox {
    name: String,
    root: PathBuf,
    default_timeout: Duration,
    cgroup: Option<SandboxCgroup>,
}

impl LocalSandbox {
    /// Host directory of the sandbox root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Sandbox for LocalSandbox {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(
        &self,
        command: &str,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> SandboxResult<ExecOutput> {
        let cwd = self.root.join(cwd.unwrap_or(WORKDIR));
        let timeout = timeout.unwrap_or(self.default_timeout);
        let env = [
            ("SANDBOX_ROOT".to_string(), self.root.display().to_string()),
            ("PAGER".to_string(), "cat".to_string()),
            ("GIT_PAGER".to_string(), "cat".to_string()),
        ];
        let process = LimitedProcess::launch(
            "sh",
            &["-c".to_string(), command.to_string()],
            Some(&cwd),
            &env,
            self.cgroup.as_ref(),
        )
        .map_err(|e| SandboxError::Spawn {
            program: "sh".to_string(),
            reason: format!("{e:#}"),
        })?;
        match process
            .wait_with_timeout(Some(timeout))
            .map_err(|e| std::io::Error::other(format!("{e:#}")))?
        {
            ProcessOutcome::Exited { exit_code, output } => Ok(ExecOutput { output, exit_code }),
            ProcessOutcome::TimedOut { .. } => Err(SandboxError::TimedOut {
                command: command.to_string(),
                timeout,
            }),
        }
    }

    fn copy_in(&self, host_src: &Path, dest: &str) -> SandboxResult<()> {
        copy_host_path(host_src, &self.root.join(dest))?;
        Ok(())
    }

    fn copy_out(&self, src: &str, host_dest: &Path) -> SandboxResult<()> {
        copy_host_path(&self.root.join(src), host_dest)?;
        Ok(())
    }

    fn resolve(&self, path: &str) -> String {
        self.root.join(path).display().to_string()
    }

    fn destroy(&self) -> SandboxResult<()> {
        if let Some(cgroup) = &self.cgroup {
            if let Err(e) = cgroup.kill_all(Duration::from_secs(1)) {
                warn!("Could not empty cgroup of sandbox {}: {e:#}", self.name);
            }
        }
        if !self.root.exists() {
            return Ok(());
        }
        // opponent mirrors are read-only
        let _ = Command::new("chmod")
            .arg("-R")
            .arg("u+w")
            .arg(&self.root)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        fs::remove_dir_all(&self.root)?;
        debug!("Destroyed sandbox {}", self.root.display());
        Ok(())
    }
}
