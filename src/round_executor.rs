//! Drives one round through the [`Arena`] contract, whatever the game.

use std::{collections::BTreeSet, fs, path::Path};

use anyhow::Context;
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use crate::{
    arena::{Arena, ArenaContext, Codebase, RoundArtifacts, Validation},
    constraints::Constraints,
    error::is_timeout,
    round_stats::RoundStats,
    sandbox::{copy_between, submission_path, Sandbox, LOG_DIR, SUBMISSIONS_DIR, WORKDIR},
    simulation_scheduler::SimulationScheduler,
};

/// Reason recorded when an arena rejects a codebase without saying why.
pub const NO_REASON: &str = "validation failed without a reason";

/// Runs rounds of one arena in one arena sandbox.
///
/// ```text
/// validating ──(≥2 valid)──> setup ──> executing ──> scoring ──> done
///     └─────(0 or 1 valid)──> auto resolve ─────────────────────> done
/// ```
#[derive(Clone, Copy)]
pub struct RoundExecutor<'a> {
    arena: &'a dyn Arena,
    sandbox: &'a dyn Sandbox,
    constraints: &'a Constraints,
}

impl<'a> RoundExecutor<'a> {
    /// Executor playing `arena` inside `sandbox`.
    pub fn new(arena: &'a dyn Arena, sandbox: &'a dyn Sandbox, constraints: &'a Constraints) -> Self {
        Self {
            arena,
            sandbox,
            constraints,
        }
    }

    /// Play round `round` between `codebases` and copy the raw results to `host_log_dir`.
    ///
    /// Rejected or broken submissions only affect their owner. An `Err` means the arena or a
    /// sandbox could not be operated at all.
    #[instrument(skip_all, fields(arena = self.arena.name(), round = round))]
    pub fn run_round(
        &self,
        round: usize,
        codebases: &[Codebase<'_>],
        host_log_dir: &Path,
    ) -> anyhow::Result<RoundStats> {
        let mut seen = BTreeSet::new();
        for codebase in codebases {
            if !seen.insert(codebase.name) {
                anyhow::bail!("player name {} is used twice", codebase.name);
            }
        }
        let names: Vec<&str> = codebases.iter().map(|c| c.name).collect();
        let mut stats = RoundStats::new(round, &names);

        let mut order: Vec<&Codebase<'_>> = codebases.iter().collect();
        order.shuffle(&mut rand::thread_rng());

        let mut valid = Vec::with_capacity(order.len());
        for codebase in order {
            let verdict = self.validate(codebase)?;
            let player_stats = stats.player_stats.entry(codebase.name.to_string()).or_default();
            match verdict {
                Validation::Valid => {
                    player_stats.valid_submit = true;
                    valid.push(codebase);
                }
                Validation::Invalid(reason) => {
                    let reason = if reason.trim().is_empty() {
                        NO_REASON.to_string()
                    } else {
                        reason
                    };
                    info!(player = codebase.name, "Submission rejected: {reason}");
                    player_stats.valid_submit = false;
                    player_stats.invalid_reason = reason;
                }
            }
        }

        let pool = self.arena.sims_per_round() as f64;
        match valid.as_slice() {
            [] => {
                let share = pool / names.len().max(1) as f64;
                for name in &names {
                    stats.set_score(name, share);
                }
                stats.details.push("No valid submission; the round is a tie".to_string());
            }
            [only] => {
                stats.set_score(only.name, pool);
                stats.winner = only.name.to_string();
                stats
                    .details
                    .push(format!("{} had the only valid submission", only.name));
            }
            _ => self.play(&valid, host_log_dir, &mut stats)?,
        }

        stats.normalize();
        info!("Round {round} winner: {}", stats.winner);
        Ok(stats)
    }

    fn validate(&self, codebase: &Codebase<'_>) -> anyhow::Result<Validation> {
        match self.arena.validate(codebase, self.constraints) {
            Ok(verdict) => Ok(verdict),
            Err(e) if is_timeout(&e) => Ok(Validation::invalid(format!(
                "Validation timed out after {:?}",
                self.constraints.validation_timeout()
            ))),
            Err(e) => Err(e).with_context(|| format!("could not validate {}", codebase.name)),
        }
    }

    fn play(&self, valid: &[&Codebase<'_>], host_log_dir: &Path, stats: &mut RoundStats) -> anyhow::Result<()> {
        let players: Vec<&str> = valid.iter().map(|c| c.name).collect();
        self.sandbox
            .execute_checked(
                &format!("rm -rf {LOG_DIR} {SUBMISSIONS_DIR} && mkdir -p {LOG_DIR} {SUBMISSIONS_DIR}"),
                Some(""),
                None,
            )
            .context("could not prepare the arena sandbox")?;
        for codebase in valid {
            debug!("Copying {}'s codebase", codebase.name);
            copy_between(codebase.sandbox, WORKDIR, self.sandbox, &submission_path(codebase.name))
                .with_context(|| format!("could not copy the codebase of {}", codebase.name))?;
        }

        let ctx = ArenaContext {
            sandbox: self.sandbox,
            scheduler: SimulationScheduler::from_constraints(self.constraints),
            constraints: self.constraints,
            sims_per_round: self.arena.sims_per_round(),
        };
        let report = self
            .arena
            .execute(&ctx, &players)
            .with_context(|| format!("{} failed to execute the round", self.arena.name()))?;
        debug!(?report, "Round executed");

        fs::create_dir_all(host_log_dir)
            .with_context(|| format!("could not create {}", host_log_dir.display()))?;
        self.sandbox
            .copy_out(LOG_DIR, host_log_dir)
            .context("could not copy the round logs out of the arena")?;
        if let Err(e) = self.sandbox.execute(
            &format!("rm -rf {LOG_DIR} {SUBMISSIONS_DIR}"),
            Some(""),
            None,
        ) {
            warn!("Could not clean the arena sandbox: {e}");
        }

        let artifacts = RoundArtifacts {
            report: &report,
            log_dir: host_log_dir,
            sims_per_round: ctx.sims_per_round,
        };
        self.arena
            .score(&players, &artifacts, stats)
            .with_context(|| format!("{} failed to score the round", self.arena.name()))
    }
}
