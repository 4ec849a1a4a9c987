//! The coding agents that edit a player's codebase between rounds.
//!
//! An agent is opaque to the orchestrator: it receives an [`AgentContext`] and a sandbox, may
//! change anything inside that sandbox, and reports an [`AgentOutcome`]. Errors and panics are
//! turned into failed outcomes by the caller so that a misbehaving agent never stops the
//! tournament.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    configuration::AgentConfig,
    constraints::Constraints,
    error::SandboxError,
    sandbox::{quote, Sandbox},
};

/// Sandbox-root relative path where [`CommandAgent`] writes the context.
pub const CONTEXT_FILE: &str = "agent_context.json";

/// Exit status of an agent that finished normally.
pub const STATUS_SUBMITTED: &str = "Submitted";
/// Exit status of an agent that returned an error or a non-zero exit code.
pub const STATUS_ERROR: &str = "Error";
/// Exit status of an agent that ran out of time.
pub const STATUS_TIMEOUT: &str = "TimedOut";
/// Exit status of an agent that panicked.
pub const STATUS_PANICKED: &str = "Panicked";

/// All a player's agent knows about the tournament.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContext {
    /// Tournament id.
    pub tournament_id: String,
    /// Arena name.
    pub arena: String,
    /// Rules of the game, as given to players.
    pub arena_description: String,
    /// File or directory the arena expects the codebase to provide.
    pub submission: String,
    /// Player name.
    pub player: String,
    /// Round being prepared.
    pub round: usize,
    /// Total number of edit rounds.
    pub rounds: usize,
    /// Codebase directory inside the sandbox.
    pub working_dir: String,
    /// Directory with the logs of previous rounds inside the sandbox.
    pub log_dir: String,
    /// Recap of the previous round.
    pub recap: String,
}

/// What an agent reports after an edit phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentOutcome {
    /// [`STATUS_SUBMITTED`] or one of the failure statuses.
    pub exit_status: String,
    /// Free-form result or error message.
    pub result: String,
}

impl AgentOutcome {
    /// A normal finish.
    pub fn submitted(result: impl Into<String>) -> Self {
        Self {
            exit_status: STATUS_SUBMITTED.to_string(),
            result: result.into(),
        }
    }

    /// A failure with `status`.
    pub fn failure(status: &str, result: impl Into<String>) -> Self {
        Self {
            exit_status: status.to_string(),
            result: result.into(),
        }
    }

    /// Anything but a normal finish.
    pub fn failed(&self) -> bool {
        self.exit_status != STATUS_SUBMITTED
    }
}

/// Edits one codebase. Implementations may only touch the given sandbox.
pub trait Agent: Send {
    /// Run one edit phase.
    fn run(&mut self, context: &AgentContext, sandbox: &dyn Sandbox)
        -> anyhow::Result<AgentOutcome>;
}

/// Leaves the codebase as it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleAgent;

impl Agent for IdleAgent {
    fn run(&mut self, _context: &AgentContext, _sandbox: &dyn Sandbox) -> anyhow::Result<AgentOutcome> {
        Ok(AgentOutcome::submitted("no changes"))
    }
}

/// Runs a shell command in the codebase directory.
///
/// The context is written as JSON to [`CONTEXT_FILE`] and the main fields are exported as
/// `ARENA_*` environment variables.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    timeout: Duration,
}

/// Keep only the end of long command outputs.
const OUTPUT_TAIL: usize = 2000;

impl CommandAgent {
    /// Agent running `command` for at most `timeout`.
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    fn script(&self, context: &AgentContext, context_file: &str) -> String {
        let vars = [
            ("ARENA_NAME", context.arena.clone()),
            ("ARENA_PLAYER", context.player.clone()),
            ("ARENA_ROUND", context.round.to_string()),
            ("ARENA_ROUNDS", context.rounds.to_string()),
            ("ARENA_LOG_DIR", context.log_dir.clone()),
            ("ARENA_CONTEXT", context_file.to_string()),
        ];
        let exports: Vec<String> = vars
            .iter()
            .map(|(k, v)| format!("export {k}={}", quote(v)))
            .collect();
        format!("{}; {}", exports.join("; "), self.command)
    }
}

fn tail(output: &str) -> &str {
    let start = output.len().saturating_sub(OUTPUT_TAIL);
    let start = (start..output.len())
        .find(|i| output.is_char_boundary(*i))
        .unwrap_or(output.len());
    &output[start..]
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(player = %context.player, round = context.round))]
    fn run(&mut self, context: &AgentContext, sandbox: &dyn Sandbox) -> anyhow::Result<AgentOutcome> {
        sandbox.write_file(&serde_json::to_string_pretty(context)?, CONTEXT_FILE)?;
        let script = self.script(context, &sandbox.resolve(CONTEXT_FILE));
        debug!("Running agent command");
        match sandbox.execute(&script, None, Some(self.timeout)) {
            Ok(out) if out.success() => Ok(AgentOutcome::submitted(tail(&out.output))),
            Ok(out) => Ok(AgentOutcome::failure(
                STATUS_ERROR,
                format!("exit code {}: {}", out.exit_code, tail(&out.output)),
            )),
            Err(e @ SandboxError::TimedOut { .. }) => {
                Ok(AgentOutcome::failure(STATUS_TIMEOUT, e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Instantiate the agent described by `config`.
pub fn build_agent(config: &AgentConfig, constraints: &Constraints) -> Box<dyn Agent> {
    match config {
        AgentConfig::Idle => Box::new(IdleAgent),
        AgentConfig::Command {
            command,
            timeout_secs,
        } => Box::new(CommandAgent::new(
            command,
            timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(constraints.agent_timeout()),
        )),
    }
}
