use std::time::{Duration, Instant};

use anyhow::{self, Context};
use cgroups_rs::{cgroup_builder::CgroupBuilder, hierarchies, Cgroup, CgroupPid, MaxValue};
use tracing::warn;

pub fn get_current_user_id() -> anyhow::Result<String> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .output()
        .context("Could not launch 'id -u'")?;
    let stdout = output.stdout;
    let untrimed_id = std::str::from_utf8(&stdout).context("id is not a valid string")?;
    Ok(untrimed_id.trim().to_string())
}

pub fn get_cgroup_path(user_id: &str, group_name: &str) -> String {
    format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
}

/// Create a cgroup at `path`.
///
/// * `max_memory` - Maximum available memory in Bytes. Non-positive means no restriction.
/// * `max_pids` - Maximum number of PIDS inside the cgroup at any time. Non-positive means no restriction.
///
/// # Errors
///
/// This function will return an error if the cgroup could not be created. This can happen if the parameters are incorrect or if cgroup is not available.
pub fn create_cgroup(path: &str, max_memory: i64, max_pids: i64) -> anyhow::Result<Cgroup> {
    let mut builder = CgroupBuilder::new(path);
    if max_memory > 0 {
        builder = builder.memory().memory_hard_limit(max_memory).done();
    }
    if max_pids > 0 {
        builder = builder
            .pid()
            .maximum_number_of_processes(MaxValue::Value(max_pids))
            .done();
    }
    builder
        .build(hierarchies::auto())
        .context("could not create cgroup")
}

/// A cgroup shared by every command of one sandbox.
///
/// Only the path is kept; the handle is reloaded for each operation.
#[derive(Debug)]
pub struct SandboxCgroup {
    path: String,
}

impl SandboxCgroup {
    /// Create `ARENA_<name>` under the current user's systemd slice.
    pub fn create(name: &str, max_memory: i64, max_pids: i64) -> anyhow::Result<SandboxCgroup> {
        let user_id = get_current_user_id().context("could not get user id")?;
        let path = get_cgroup_path(&user_id, &format!("ARENA_{name}"));
        create_cgroup(&path, max_memory, max_pids)?;
        Ok(SandboxCgroup { path })
    }

    fn load(&self) -> Cgroup {
        Cgroup::load(hierarchies::auto(), self.path.as_str())
    }

    /// Move process `pid` (and its future children) into the group.
    pub fn add(&self, pid: u32) -> anyhow::Result<()> {
        self.load()
            .add_task_by_tgid(CgroupPid { pid: pid as u64 })
            .context("could not add task to cgroup")
    }

    /// Kill every member and wait up to `max_duration` for the group to empty.
    pub fn kill_all(&self, max_duration: Duration) -> anyhow::Result<()> {
        let cgroup = self.load();
        cgroup.kill().context("could not kill cgroup members")?;
        let deadline = Instant::now() + max_duration;
        while !cgroup.tasks().is_empty() {
            if Instant::now() > deadline {
                anyhow::bail!("cgroup cleanup timed out");
            }
            std::thread::sleep(std::cmp::min(Duration::from_millis(10), max_duration / 10));
        }
        Ok(())
    }
}

impl Drop for SandboxCgroup {
    fn drop(&mut self) {
        if let Err(e) = self.kill_all(Duration::from_secs(1)) {
            warn!("Failed to empty cgroup {}: {e:#}", self.path);
        }
        if let Err(e) = self.load().delete() {
            warn!("Failed to remove cgroup. If this happens a lot, it may slow down the computer. {e}");
        }
    }
}
