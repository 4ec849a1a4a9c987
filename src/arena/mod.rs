//! Module defining the contract every game implements, and the built-in games.
//!
//! An [`Arena`] judges codebases in three steps driven by the
//! [`RoundExecutor`](crate::round_executor::RoundExecutor):
//!
//! 1. [`validate`](Arena::validate) probes one codebase in its own sandbox without changing it,
//! 2. [`execute`](Arena::execute) plays the round inside the arena sandbox, where every valid
//!    codebase has been copied to [`submission_path`](crate::sandbox::submission_path), and
//!    writes raw results under [`LOG_DIR`],
//! 3. [`score`](Arena::score) reads those results, copied back to the host, and fills the
//!    round's [`RoundStats`].
//!
//! Per-game settings come from [`ArenaConfig::args`] and are merged over the defaults of each
//! game's settings struct.

mod battlesnake;
mod corewar;
mod dummy;
mod halite;
mod robotrumble;
mod scoring;

pub use battlesnake::{BattleSnake, BattleSnakeSettings};
pub use corewar::{CoreWar, CoreWarSettings};
pub use dummy::DummyGame;
pub use halite::{Halite, HaliteSettings};
pub use robotrumble::{RobotRumble, RobotRumbleSettings};
pub use scoring::WinTally;

use std::{collections::BTreeMap, path::Path};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    configuration::ArenaConfig,
    constraints::Constraints,
    round_stats::RoundStats,
    sandbox::{quote, Sandbox, LOG_DIR},
    simulation_scheduler::{SimulationOutcome, SimulationRecord, SimulationScheduler},
};

/// Verdict of [`Arena::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The codebase can take part in the round.
    Valid,
    /// The codebase is rejected, with a reason shown to its player.
    Invalid(String),
}

impl Validation {
    /// Shorthand for `Validation::Invalid(reason.into())`.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Validation::Invalid(reason.into())
    }
}

/// A codebase under validation, seen through its owner's sandbox.
#[derive(Debug, Clone, Copy)]
pub struct Codebase<'a> {
    /// Player name.
    pub name: &'a str,
    /// Sandbox holding the codebase in [`WORKDIR`](crate::sandbox::WORKDIR).
    pub sandbox: &'a dyn Sandbox,
}

/// Everything [`Arena::execute`] may use.
#[derive(Debug, Clone, Copy)]
pub struct ArenaContext<'a> {
    /// Arena sandbox, with the submissions already copied in.
    pub sandbox: &'a dyn Sandbox,
    /// Scheduler for repetitions.
    pub scheduler: SimulationScheduler,
    /// Resource limits.
    pub constraints: &'a Constraints,
    /// Repetitions requested this round.
    pub sims_per_round: usize,
}

impl ArenaContext<'_> {
    /// Absolute path of `file` inside the arena log directory.
    pub fn log_file(&self, file: &str) -> String {
        self.sandbox.resolve(&format!("{LOG_DIR}/{file}"))
    }
}

/// What happened while executing a round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    /// Repetitions whose artifacts can be scored.
    pub completed: Vec<usize>,
    /// Repetitions that hit their deadline.
    pub timed_out: Vec<usize>,
    /// Repetitions that failed, with the reason.
    pub failed: Vec<(usize, String)>,
    /// Players that could not take part at all, with the reason.
    pub forfeits: Vec<(String, String)>,
    /// Free-form notes copied to the round details.
    pub notes: Vec<String>,
}

impl ExecutionReport {
    /// Sort simulation records into completed, timed out and failed repetitions.
    pub fn from_records<T>(records: &[SimulationRecord<T>]) -> Self {
        let mut report = ExecutionReport::default();
        for record in records {
            match &record.outcome {
                SimulationOutcome::Completed(_) => report.completed.push(record.index),
                SimulationOutcome::TimedOut => report.timed_out.push(record.index),
                SimulationOutcome::Failed(reason) => {
                    report.failed.push((record.index, reason.clone()))
                }
            }
        }
        report
    }

    /// Whether `player` forfeited.
    pub fn forfeited(&self, player: &str) -> bool {
        self.forfeits.iter().any(|(name, _)| name == player)
    }
}

/// Raw round results on the host, handed to [`Arena::score`].
#[derive(Debug, Clone, Copy)]
pub struct RoundArtifacts<'a> {
    /// Report returned by [`Arena::execute`].
    pub report: &'a ExecutionReport,
    /// Host copy of the arena log directory.
    pub log_dir: &'a Path,
    /// Repetitions requested this round, which is also the point pool.
    pub sims_per_round: usize,
}

impl RoundArtifacts<'_> {
    /// Content of a log file, `None` when it is missing or unreadable.
    pub fn read(&self, file: &str) -> Option<String> {
        std::fs::read_to_string(self.log_dir.join(file)).ok()
    }
}

/// A game.
pub trait Arena: Send + Sync {
    /// Name used in configurations.
    fn name(&self) -> &str;

    /// Rules shown to the agents.
    fn description(&self) -> &str;

    /// File or directory each codebase must provide.
    fn submission(&self) -> &str;

    /// Repetitions per round.
    fn sims_per_round(&self) -> usize;

    /// Reject tournaments with a number of competitors the game cannot host.
    fn check_players(&self, count: usize) -> anyhow::Result<()> {
        if count == 0 {
            anyhow::bail!("{} needs at least one player", self.name());
        }
        Ok(())
    }

    /// Read-only probe of one codebase. An `Err` means the probe itself could not run; a
    /// timeout inside the probe is treated as a rejection by the caller.
    fn validate(&self, codebase: &Codebase<'_>, constraints: &Constraints) -> anyhow::Result<Validation>;

    /// Play the round between `players` (in their shuffled order).
    fn execute(&self, ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<ExecutionReport>;

    /// Fill `stats` from the round artifacts.
    fn score(
        &self,
        players: &[&str],
        artifacts: &RoundArtifacts<'_>,
        stats: &mut RoundStats,
    ) -> anyhow::Result<()>;
}

/// Instantiate the arena named in `config`.
pub fn get_arena(config: &ArenaConfig) -> anyhow::Result<Box<dyn Arena>> {
    let arena: Box<dyn Arena> = match config.name.as_str() {
        "DummyGame" => Box::new(DummyGame::new(config.sims_per_round)),
        "CoreWar" => Box::new(CoreWar::new(config.sims_per_round, settings(config)?)),
        "BattleSnake" => Box::new(BattleSnake::new(config.sims_per_round, settings(config)?)),
        "RobotRumble" => Box::new(RobotRumble::new(config.sims_per_round, settings(config)?)),
        "Halite" => Box::new(Halite::new(config.sims_per_round, settings(config)?)),
        other => anyhow::bail!("unknown arena '{other}'"),
    };
    Ok(arena)
}

/// Deserialize per-game settings from `config.args`, missing keys keeping their defaults.
pub fn settings<T: DeserializeOwned>(config: &ArenaConfig) -> anyhow::Result<T> {
    serde_json::from_value(Value::Object(config.args.clone()))
        .with_context(|| format!("invalid settings for arena {}", config.name))
}

/// Render pass-through settings as command line flags: `true` becomes `<prefix>key`, `false`
/// and `null` are dropped, anything else becomes `<prefix>key value`.
pub fn flag_args(flags: &BTreeMap<String, Value>, prefix: &str) -> String {
    let mut out = String::new();
    for (key, value) in flags {
        match value {
            Value::Bool(true) => out.push_str(&format!(" {prefix}{key}")),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) => out.push_str(&format!(" {prefix}{key} {}", quote(s))),
            other => out.push_str(&format!(" {prefix}{key} {other}")),
        }
    }
    out
}

/// Run `sims_per_round` repetitions of `command(i)` in the arena sandbox.
///
/// A non-zero exit code fails the repetition; so does hitting the simulation timeout.
pub fn run_simulations<F>(ctx: &ArenaContext<'_>, cwd: Option<&str>, command: F) -> ExecutionReport
where
    F: Fn(usize) -> String + Sync,
{
    let sandbox = ctx.sandbox;
    let timeout = ctx.scheduler.timeout();
    let records = ctx.scheduler.run(ctx.sims_per_round, |idx| {
        Ok(sandbox.execute_checked(&command(idx), cwd, Some(timeout))?)
    });
    ExecutionReport::from_records(&records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_follow_value_types() {
        let flags: BTreeMap<String, Value> = serde_json::from_value(json!({
            "browser": false,
            "raw": true,
            "width": 11,
            "map": "arena 1",
        }))
        .unwrap();
        assert_eq!(flag_args(&flags, "--"), " --map 'arena 1' --raw --width 11");
    }

    #[test]
    fn unknown_arena_is_rejected() {
        let config = ArenaConfig {
            name: "Chess".into(),
            sims_per_round: 1,
            args: Default::default(),
        };
        assert!(get_arena(&config).is_err());
    }

    #[test]
    fn arenas_are_found_by_name() {
        for name in ["DummyGame", "CoreWar", "BattleSnake", "RobotRumble", "Halite"] {
            let config = ArenaConfig {
                name: name.into(),
                sims_per_round: 3,
                args: Default::default(),
            };
            let arena = get_arena(&config).unwrap();
            assert_eq!(arena.name(), name);
            assert_eq!(arena.sims_per_round(), 3);
            assert!(!arena.description().is_empty());
        }
    }
}
