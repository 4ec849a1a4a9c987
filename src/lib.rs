//! # Code Tournament
//!
//! Multi-round coding tournaments between agents that edit codebases, judged by pluggable
//! games running inside disposable sandboxes.
//!
//! It provides:
//! - Sandboxes on the host or in Docker containers (`Sandbox`, `SandboxFactory`)
//! - Version-tracked codebases with per-round snapshots and diffs (`Player`, `SnapshotStore`)
//! - The game contract and built-in games (`Arena`, `get_arena`)
//! - Concurrent repetitions of a match on a bounded worker pool (`SimulationScheduler`)
//! - Crash-resumable tournaments (`Tournament`) and offline cross-evaluation of their
//!   snapshots (`MatrixEvaluator`)
//!
//! A tournament plays a baseline round 0, then alternates an edit phase, where every agent
//! edits its own codebase concurrently, and a competition phase, where the
//! [`RoundExecutor`](crate::round_executor::RoundExecutor) validates, executes and scores the
//! codebases. The metadata file is rewritten atomically after every round.
//!
//! # Documentation Overview
//!
//! - For the round life cycle and the persisted files, see the [`tournament`] module.
//! - For implementing a new game, see the [`Arena`](crate::arena::Arena) trait.
//! - For behaviour flags and resource limits, see
//!   [`Configuration`](crate::configuration::Configuration) and [`constraints`].
//! - For the sandbox boundary, see the [`sandbox`] module.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::{path::Path, time::Duration};
//! use code_tournament::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let constraints = ConstraintsBuilder::new()
//!         .with_simulation_timeout(Duration::from_secs(120))
//!         .with_sandbox_ram(4000) // in MB
//!         .build()?;
//!     let configuration = Configuration::new().with_allow_uncontained(true);
//!
//!     let config: TournamentConfig = serde_json::from_str(
//!         r#"{
//!             "rounds": 5,
//!             "arena": { "name": "CoreWar", "sims_per_round": 100 },
//!             "players": [
//!                 { "name": "alice", "agent": { "kind": "command", "command": "./edit.sh" } },
//!                 { "name": "bob" }
//!             ]
//!         }"#,
//!     )?;
//!
//!     let factory = LocalSandboxFactory::new(
//!         Path::new("games/corewar"),
//!         Path::new("/tmp/sandboxes"),
//!         &constraints,
//!         &configuration,
//!     );
//!     let metadata = Tournament::new(
//!         config,
//!         &factory,
//!         Path::new("logs/corewar"),
//!         configuration,
//!         constraints,
//!     )?
//!     .run()?;
//!
//!     for (round, stats) in &metadata.round_stats {
//!         println!("round {round}: {}", stats.winner);
//!     }
//!     Ok(())
//! }
//! ```
#![warn(missing_docs)]

mod cgroup_manager;
pub use anyhow;
pub mod agent;
pub mod arena;
pub mod configuration;
pub mod constraints;
pub mod error;
pub mod logger;
pub mod matrix;
pub mod persistence;
pub mod player;
pub mod pool;
pub mod round_executor;
pub mod round_stats;
pub mod sandbox;
pub mod simulation_scheduler;
pub mod snapshot;
pub mod tournament;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use code_tournament::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{Agent, AgentContext, AgentOutcome};
    pub use crate::arena::{get_arena, Arena, Validation};
    pub use crate::configuration::{
        AgentConfig, ArenaConfig, Configuration, PlayerConfig, TournamentConfig, TournamentMode,
    };
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::matrix::{MatrixEvaluator, MatrixOptions};
    pub use crate::round_stats::{RoundStats, RESULT_TIE};
    pub use crate::sandbox::{
        docker::DockerSandboxFactory, local::LocalSandboxFactory, Sandbox, SandboxFactory,
    };
    pub use crate::tournament::{Tournament, TournamentMetadata};
}
