//! Resource limits applied to sandboxes, agents and simulations.
//!
//! The main entry point is [`ConstraintsBuilder`]. It configures:
//!
//! - **Timeouts**: plain sandbox commands, validation probes, single simulations and a whole
//!   agent edit phase
//! - **Parallelism**: simulation workers per round and arena workers for matrix evaluation
//! - **Sandbox limits**: RAM and pid count per sandbox, enforced through cgroups v2 when
//!   containment is enabled (Linux only)
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use code_tournament::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_simulation_timeout(Duration::from_secs(30))
//!     .with_simulation_workers(4)
//!     .build()
//!     .unwrap();
//! assert_eq!(constraints.simulation_workers(), 4);
//! ```
//!
//! Constraints can also be read from environment variables with
//! [`ConstraintsBuilder::from_env()`].

use std::{env, time::Duration};

use anyhow::{bail, Context};

/// A builder for the resource limits of a tournament.
///
/// Unset values fall back to the defaults documented on each setter.
#[derive(Debug, Default, Clone)]
pub struct ConstraintsBuilder {
    command_timeout: Option<Duration>,
    validation_timeout: Option<Duration>,
    simulation_timeout: Option<Duration>,
    agent_timeout: Option<Duration>,
    simulation_workers: Option<usize>,
    matrix_workers: Option<usize>,
    sandbox_ram: Option<usize>,
    sandbox_pids: Option<usize>,
}

impl ConstraintsBuilder {
    /// Creates a builder where every value is left to its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `COMMAND_TIMEOUT_SECS` (u64)
    /// - `VALIDATION_TIMEOUT_SECS` (u64)
    /// - `SIMULATION_TIMEOUT_SECS` (u64)
    /// - `AGENT_TIMEOUT_SECS` (u64)
    /// - `SIMULATION_WORKERS` (usize)
    /// - `MATRIX_WORKERS` (usize)
    /// - `SANDBOX_RAM_MB` (usize)
    /// - `SANDBOX_MAX_PIDS` (usize)
    ///
    /// Unparsable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse_usize(var: &str) -> Option<usize> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_secs(var: &str) -> Option<Duration> {
            env::var(var)
                .ok()?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        }

        ConstraintsBuilder {
            command_timeout: parse_duration_secs("COMMAND_TIMEOUT_SECS"),
            validation_timeout: parse_duration_secs("VALIDATION_TIMEOUT_SECS"),
            simulation_timeout: parse_duration_secs("SIMULATION_TIMEOUT_SECS"),
            agent_timeout: parse_duration_secs("AGENT_TIMEOUT_SECS"),
            simulation_workers: parse_usize("SIMULATION_WORKERS"),
            matrix_workers: parse_usize("MATRIX_WORKERS"),
            sandbox_ram: parse_usize("SANDBOX_RAM_MB"),
            sandbox_pids: parse_usize("SANDBOX_MAX_PIDS"),
        }
    }

    /// Deadline of an ordinary sandbox command (default 600 s).
    #[must_use]
    pub fn with_command_timeout(self, duration: Duration) -> Self {
        Self {
            command_timeout: Some(duration),
            ..self
        }
    }

    /// Deadline of one validation probe (default 60 s).
    #[must_use]
    pub fn with_validation_timeout(self, duration: Duration) -> Self {
        Self {
            validation_timeout: Some(duration),
            ..self
        }
    }

    /// Deadline of one simulation (default 120 s).
    #[must_use]
    pub fn with_simulation_timeout(self, duration: Duration) -> Self {
        Self {
            simulation_timeout: Some(duration),
            ..self
        }
    }

    /// Deadline of one agent edit phase (default 3600 s).
    #[must_use]
    pub fn with_agent_timeout(self, duration: Duration) -> Self {
        Self {
            agent_timeout: Some(duration),
            ..self
        }
    }

    /// Number of simulations run concurrently inside one round (default: logical CPU count).
    #[must_use]
    pub fn with_simulation_workers(self, workers: usize) -> Self {
        Self {
            simulation_workers: Some(workers),
            ..self
        }
    }

    /// Number of arena workers used by the matrix evaluator (default: physical CPU count).
    #[must_use]
    pub fn with_matrix_workers(self, workers: usize) -> Self {
        Self {
            matrix_workers: Some(workers),
            ..self
        }
    }

    /// Maximum RAM per sandbox, in MB. Unlimited by default.
    #[must_use]
    pub fn with_sandbox_ram(self, max: usize) -> Self {
        Self {
            sandbox_ram: Some(max),
            ..self
        }
    }

    /// Maximum number of processes alive in one sandbox. Unlimited by default.
    #[must_use]
    pub fn with_sandbox_max_pids(self, max: usize) -> Self {
        Self {
            sandbox_pids: Some(max),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `Constraints`.
    ///
    /// # Errors
    ///
    /// Returns an error when the constraints are impossible: zero workers, or more RAM per
    /// sandbox than the host currently has available.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let simulation_workers = self.simulation_workers.unwrap_or_else(num_cpus::get);
        let matrix_workers = self.matrix_workers.unwrap_or_else(num_cpus::get_physical);
        if simulation_workers == 0 {
            bail!("at least one simulation worker is required");
        }
        if matrix_workers == 0 {
            bail!("at least one matrix worker is required");
        }

        let sandbox_ram = match self.sandbox_ram {
            Some(mb) => {
                let bytes = mb
                    .checked_mul(1_000_000)
                    .with_context(|| format!("sandbox RAM ({mb}MB) is too large"))?;
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                let available = sys.available_memory() as usize;
                if bytes > available {
                    bail!(
                        "Sandbox RAM size ({mb}MB) is greater than available RAM ({}MB)",
                        available / 1_000_000
                    );
                }
                i64::try_from(bytes).context("sandbox RAM does not fit in an i64")?
            }
            None => 0,
        };
        let sandbox_pids = match self.sandbox_pids {
            Some(pids) => i64::try_from(pids).context("pid limit does not fit in an i64")?,
            None => 0,
        };

        Ok(Constraints {
            command_timeout: self.command_timeout.unwrap_or(Duration::from_secs(600)),
            validation_timeout: self.validation_timeout.unwrap_or(Duration::from_secs(60)),
            simulation_timeout: self.simulation_timeout.unwrap_or(Duration::from_secs(120)),
            agent_timeout: self.agent_timeout.unwrap_or(Duration::from_secs(3600)),
            simulation_workers,
            matrix_workers,
            sandbox_ram,
            sandbox_pids,
        })
    }
}

/// Obtained using `ConstraintsBuilder`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) command_timeout: Duration,
    pub(crate) validation_timeout: Duration,
    pub(crate) simulation_timeout: Duration,
    pub(crate) agent_timeout: Duration,
    pub(crate) simulation_workers: usize,
    pub(crate) matrix_workers: usize,
    pub(crate) sandbox_ram: i64,
    pub(crate) sandbox_pids: i64,
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    /// Deadline of an ordinary sandbox command.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Deadline of one validation probe.
    pub fn validation_timeout(&self) -> Duration {
        self.validation_timeout
    }

    /// Deadline of one simulation.
    pub fn simulation_timeout(&self) -> Duration {
        self.simulation_timeout
    }

    /// Deadline of one agent edit phase.
    pub fn agent_timeout(&self) -> Duration {
        self.agent_timeout
    }

    /// Simulations run concurrently inside one round.
    pub fn simulation_workers(&self) -> usize {
        self.simulation_workers
    }

    /// Arena workers used by the matrix evaluator.
    pub fn matrix_workers(&self) -> usize {
        self.matrix_workers
    }

    /// RAM per sandbox in bytes. Non-positive means unlimited.
    pub fn sandbox_ram(&self) -> i64 {
        self.sandbox_ram
    }

    /// Process limit per sandbox. Non-positive means unlimited.
    pub fn sandbox_pids(&self) -> i64 {
        self.sandbox_pids
    }
}
