//! Test game: a python engine plays every submission `-r N` times and prints the win counts.

use regex::Regex;
use tracing::instrument;

use super::{Arena, ArenaContext, Codebase, ExecutionReport, RoundArtifacts, Validation, WinTally};
use crate::{constraints::Constraints, round_stats::RoundStats, sandbox::submission_path};

const RESULT_LOG: &str = "result.log";

/// Infrastructure test game. Every codebase providing `main.py` is accepted.
#[derive(Debug, Clone)]
pub struct DummyGame {
    sims_per_round: usize,
}

impl DummyGame {
    /// A dummy game playing `sims_per_round` repetitions per round.
    pub fn new(sims_per_round: usize) -> Self {
        Self { sims_per_round }
    }
}

/// Win counts after the `FINAL_RESULTS` marker, indexed by the 1-based bot number.
fn parse_results(log: &str, players: &[&str], tally: &mut WinTally) -> anyhow::Result<usize> {
    let re = Regex::new(r"Bot_(\d)_main:\s(\d+)\srounds\swon")?;
    let tail = log.rsplit("FINAL_RESULTS").next().unwrap_or_default();
    let mut found = 0;
    for line in tail.lines() {
        let Some(caps) = re.captures(line) else { continue };
        let (Ok(bot), Ok(won)) = (caps[1].parse::<usize>(), caps[2].parse::<f64>()) else {
            continue;
        };
        if let Some(player) = bot.checked_sub(1).and_then(|i| players.get(i)) {
            tally.add(player, won);
            found += 1;
        }
    }
    Ok(found)
}

impl Arena for DummyGame {
    fn name(&self) -> &str {
        "DummyGame"
    }

    fn description(&self) -> &str {
        "WARNING: This is a dummy game meant for testing the tournament infrastructure. \
         It does not represent a real game."
    }

    fn submission(&self) -> &str {
        "main.py"
    }

    fn sims_per_round(&self) -> usize {
        self.sims_per_round
    }

    fn validate(&self, _codebase: &Codebase<'_>, _constraints: &Constraints) -> anyhow::Result<Validation> {
        Ok(Validation::Valid)
    }

    #[instrument(skip_all)]
    fn execute(&self, ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<ExecutionReport> {
        let bots: Vec<String> = players
            .iter()
            .map(|p| ctx.sandbox.resolve(&format!("{}/{}", submission_path(p), self.submission())))
            .collect();
        let command = format!(
            "python engine.py {} -r {} > {}",
            bots.join(" "),
            ctx.sims_per_round,
            ctx.log_file(RESULT_LOG)
        );
        ctx.sandbox
            .execute_checked(&command, None, Some(ctx.scheduler.timeout()))?;
        Ok(ExecutionReport {
            completed: vec![0],
            ..Default::default()
        })
    }

    fn score(
        &self,
        players: &[&str],
        artifacts: &RoundArtifacts<'_>,
        stats: &mut RoundStats,
    ) -> anyhow::Result<()> {
        let mut tally = WinTally::new();
        match artifacts.read(RESULT_LOG) {
            Some(log) => {
                if parse_results(&log, players, &mut tally)? == 0 {
                    tally.unreadable();
                }
            }
            None => stats.details.push(format!("{RESULT_LOG} is missing")),
        }
        tally.apply(players, artifacts, stats);
        Ok(())
    }
}
