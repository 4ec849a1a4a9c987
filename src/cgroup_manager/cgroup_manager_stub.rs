use std::time::Duration;

use anyhow::{self, bail};

/// Placeholder for platforms without cgroups. It can never be created.
#[derive(Debug)]
pub struct SandboxCgroup {
    _private: (),
}

impl SandboxCgroup {
    pub fn create(_name: &str, _max_memory: i64, _max_pids: i64) -> anyhow::Result<SandboxCgroup> {
        bail!("cgroups only available on linux")
    }

    pub fn add(&self, _pid: u32) -> anyhow::Result<()> {
        Ok(())
    }

    pub fn kill_all(&self, _max_duration: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}
