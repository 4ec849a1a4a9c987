//! Behaviour flags and the tournament description.
//!
//! [`Configuration`] holds process-level switches (where output goes, how sandboxes are
//! contained and cleaned up). It can be created programmatically using [`Configuration::new()`]
//! or by reading environment variables using [`Configuration::from_env()`].
//!
//! [`TournamentConfig`] describes one tournament: the mode, the number of rounds, the arena and
//! its per-game settings, and the players with their agents. It is stored verbatim in the
//! tournament metadata so a crashed tournament can be resumed from disk alone.
//!
//! # Environment Variables
//!
//! All values are optional and case-insensitive. Set the value to `"true"` to enable a flag.
//!
//! - `ARENA_VERBOSE` — Print progress to stdout (default: `true`)
//! - `ARENA_LOG` — Write `tournament.log` in the output directory (default: `true`)
//! - `ARENA_ALLOW_UNCONTAINED` — Fall back to uncontained sandboxes when cgroups are unavailable (default: `false`)
//! - `ARENA_CONTAIN` — Put every local sandbox in its own cgroup (default: `false`)
//! - `ARENA_KEEP_SANDBOXES` — Do not destroy sandboxes when the tournament ends (default: `false`)
//! - `ARENA_PUSH` — Publish every player's history after each round (default: `false`)
//! - `ARENA_COMPRESS_ROUNDS` — Archive raw round logs once a round is persisted (default: `true`)

use std::collections::HashSet;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::round_stats::RESULT_TIE;

/// Name of the non-editing opponent in single-player mode.
pub const MIRROR_PLAYER: &str = "mirror";

/// Configuration for orchestrator behaviors.
#[derive(Debug, Clone, Copy)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) allow_uncontained: bool,
    pub(crate) contain: bool,
    pub(crate) keep_sandboxes: bool,
    pub(crate) push: bool,
    pub(crate) compress_rounds: bool,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Progress is printed to stdout.
    /// - A log file is written next to the metadata.
    /// - Local sandboxes are not put in cgroups, and a failing cgroup setup is an error.
    /// - Sandboxes are destroyed at the end.
    /// - Nothing is pushed.
    /// - Raw round logs are archived.
    pub fn new() -> Self {
        Self {
            verbose: true,
            log: true,
            allow_uncontained: false,
            contain: false,
            keep_sandboxes: false,
            push: false,
            compress_rounds: true,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// Any value other than `"true"` disables a flag; unset variables keep the default.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        Self {
            verbose: get_env_flag("ARENA_VERBOSE", true),
            log: get_env_flag("ARENA_LOG", true),
            allow_uncontained: get_env_flag("ARENA_ALLOW_UNCONTAINED", false),
            contain: get_env_flag("ARENA_CONTAIN", false),
            keep_sandboxes: get_env_flag("ARENA_KEEP_SANDBOXES", false),
            push: get_env_flag("ARENA_PUSH", false),
            compress_rounds: get_env_flag("ARENA_COMPRESS_ROUNDS", true),
        }
    }

    /// Enable or disable stdout progress.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Allow sandboxes to run without a cgroup when one cannot be created.
    pub fn with_allow_uncontained(mut self, value: bool) -> Self {
        self.allow_uncontained = value;
        self
    }

    /// Enable or disable cgroup containment of local sandboxes.
    pub fn with_contain(mut self, value: bool) -> Self {
        self.contain = value;
        self
    }

    /// Keep sandboxes alive after the tournament (debug purposes).
    pub fn with_keep_sandboxes(mut self, value: bool) -> Self {
        self.keep_sandboxes = value;
        self
    }

    /// Publish player histories to the configured remote.
    pub fn with_push(mut self, value: bool) -> Self {
        self.push = value;
        self
    }

    /// Enable or disable archiving of raw round logs.
    pub fn with_compress_rounds(mut self, value: bool) -> Self {
        self.compress_rounds = value;
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

/// Who plays against whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentMode {
    /// Every configured player edits its own codebase and they all compete.
    #[default]
    Pvp,
    /// One player competes against a frozen copy of its own previous round.
    SinglePlayer,
}

/// The agent driving a player during edit phases.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentConfig {
    /// Leaves the codebase untouched.
    #[default]
    Idle,
    /// Runs a shell command inside the player's sandbox.
    Command {
        /// Shell command line, run from the codebase directory.
        command: String,
        /// Overrides the agent timeout from the constraints.
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

/// One competitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Unique name, also used as directory and branch component.
    pub name: String,
    /// Existing branch of the base codebase to start from.
    #[serde(default)]
    pub branch_init: Option<String>,
    /// Agent used for edit phases.
    #[serde(default)]
    pub agent: AgentConfig,
}

impl PlayerConfig {
    /// Player driven by `agent`, starting from the default branch.
    pub fn new(name: &str, agent: AgentConfig) -> Self {
        Self {
            name: name.to_string(),
            branch_init: None,
            agent,
        }
    }
}

/// The game played each round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Arena name as understood by [`get_arena`](crate::arena::get_arena).
    pub name: String,
    /// Repetitions per round, which is also the per-round point pool.
    pub sims_per_round: usize,
    /// Per-game settings merged over that game's defaults.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Everything needed to run (or resume) one tournament.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentConfig {
    /// Pvp or single-player.
    #[serde(default)]
    pub mode: TournamentMode,
    /// Number of edit rounds after the baseline round 0.
    pub rounds: usize,
    /// Give every player a read-only copy of its opponents' code before each edit phase.
    #[serde(default)]
    pub transparent: bool,
    /// Remote URL used when pushing; `{token}` is replaced by `GITHUB_TOKEN`.
    #[serde(default)]
    pub push_remote: Option<String>,
    /// The game.
    pub arena: ArenaConfig,
    /// Editing players.
    pub players: Vec<PlayerConfig>,
}

/// True for names that cannot be given to a player.
pub fn is_reserved_name(name: &str) -> bool {
    name.is_empty()
        || name == RESULT_TIE
        || name == MIRROR_PLAYER
        || name
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\'' || c == '"' || c.is_whitespace())
}

impl TournamentConfig {
    /// Check player names and counts against the mode.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for player in &self.players {
            if is_reserved_name(&player.name) {
                bail!("'{}' cannot be used as a player name", player.name);
            }
            if !seen.insert(player.name.as_str()) {
                bail!("player name '{}' is used more than once", player.name);
            }
        }
        match self.mode {
            TournamentMode::Pvp if self.players.len() < 2 => {
                bail!("pvp tournaments need at least two players")
            }
            TournamentMode::SinglePlayer if self.players.len() != 1 => {
                bail!("single-player tournaments need exactly one player")
            }
            _ => {}
        }
        if self.arena.sims_per_round == 0 {
            bail!("sims_per_round must be at least 1");
        }
        Ok(())
    }

    /// Names of everyone taking part in the competition phase, in configuration order.
    pub fn competitor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.players.iter().map(|p| p.name.clone()).collect();
        if self.mode == TournamentMode::SinglePlayer {
            names.push(MIRROR_PLAYER.to_string());
        }
        names
    }
}
