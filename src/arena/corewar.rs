//! Redcode warriors fighting in `pmars`.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{
    flag_args, Arena, ArenaContext, Codebase, ExecutionReport, RoundArtifacts, Validation,
    WinTally,
};
use crate::{
    constraints::Constraints,
    round_stats::RoundStats,
    sandbox::{quote, submission_path},
};

const DESCRIPTION: &str = "CoreWar is a programming battle where you write \"warriors\" in an \
assembly-like language called Redcode to compete within a virtual machine (MARS), aiming to \
eliminate your rivals by making their code self-terminate.
Victory comes from crafting clever tactics (replicators, scanners, bombers) that exploit memory \
layout and instruction timing to control the core.";

const PMARS: &str = "./src/pmars";

/// Settings of [`CoreWar`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoreWarSettings {
    /// Battles played by one `pmars` process. Each process is one scheduled simulation.
    pub sims_per_process: usize,
    /// Warrior every submission is smoke-tested against.
    pub validation_opponent: String,
    /// Remaining keys are passed to `pmars` as `-key value` flags.
    #[serde(flatten)]
    pub flags: BTreeMap<String, Value>,
}

impl Default for CoreWarSettings {
    fn default() -> Self {
        Self {
            sims_per_process: 10,
            validation_opponent: "/home/dwarf.red".to_string(),
            flags: BTreeMap::new(),
        }
    }
}

/// CoreWar arena.
#[derive(Debug, Clone)]
pub struct CoreWar {
    sims_per_round: usize,
    settings: CoreWarSettings,
    run_cmd: String,
}

impl CoreWar {
    /// A CoreWar arena playing `sims_per_round` battles per round.
    pub fn new(sims_per_round: usize, settings: CoreWarSettings) -> Self {
        let run_cmd = format!("{PMARS}{}", flag_args(&settings.flags, "-"));
        Self {
            sims_per_round,
            settings,
            run_cmd,
        }
    }

    fn chunk(&self) -> usize {
        self.settings.sims_per_process.max(1)
    }

    /// Battles played by chunk `index` of a round of `total` battles.
    fn chunk_len(&self, index: usize, total: usize) -> usize {
        total.saturating_sub(index * self.chunk()).min(self.chunk())
    }
}

fn sim_log(index: usize) -> String {
    format!("sim_{index}.log")
}

/// `pmars` prints one `<warrior> by <author> scores <n>` line per warrior, in argument order,
/// near the end of its output.
fn parse_scores(output: &str, warriors: usize) -> anyhow::Result<Vec<f64>> {
    let re = Regex::new(r".*\sby\s.*\sscores\s(\d+)")?;
    let lines: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(warriors * 2);
    Ok(lines[start..]
        .iter()
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| caps[1].parse::<f64>().ok())
        .collect())
}

impl Arena for CoreWar {
    fn name(&self) -> &str {
        "CoreWar"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn submission(&self) -> &str {
        "warrior.red"
    }

    fn sims_per_round(&self) -> usize {
        self.sims_per_round
    }

    #[instrument(skip_all, fields(player = codebase.name))]
    fn validate(&self, codebase: &Codebase<'_>, constraints: &Constraints) -> anyhow::Result<Validation> {
        let timeout = Some(constraints.validation_timeout());
        let listing = codebase.sandbox.execute("ls", None, timeout)?;
        if !listing.output.lines().any(|l| l.trim() == self.submission()) {
            return Ok(Validation::invalid(format!(
                "There should be a `{}` file",
                self.submission()
            )));
        }
        let command = format!(
            "{} {} {}",
            self.run_cmd,
            self.submission(),
            quote(&self.settings.validation_opponent)
        );
        let run = codebase.sandbox.execute(&command, None, timeout)?;
        if run.output.lines().any(|l| l.starts_with("Error")) {
            return Ok(Validation::invalid(format!(
                "The `{}` file is malformed (Ran `{command}`):\n{}",
                self.submission(),
                run.output
            )));
        }
        Ok(Validation::Valid)
    }

    #[instrument(skip_all)]
    fn execute(&self, ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<ExecutionReport> {
        let warriors: Vec<String> = players
            .iter()
            .map(|p| quote(&ctx.sandbox.resolve(&format!("{}/{}", submission_path(p), self.submission()))))
            .collect();
        let warriors = warriors.join(" ");
        let total = ctx.sims_per_round;
        let chunks = total.div_ceil(self.chunk());
        debug!("Playing {total} battles in {chunks} processes");
        let timeout = ctx.scheduler.timeout();
        let records = ctx.scheduler.run(chunks, |index| {
            let command = format!(
                "{} {warriors} -r {} > {}",
                self.run_cmd,
                self.chunk_len(index, total),
                ctx.log_file(&sim_log(index))
            );
            Ok(ctx.sandbox.execute_checked(&command, None, Some(timeout))?)
        });
        Ok(ExecutionReport::from_records(&records))
    }

    fn score(
        &self,
        players: &[&str],
        artifacts: &RoundArtifacts<'_>,
        stats: &mut RoundStats,
    ) -> anyhow::Result<()> {
        let mut tally = WinTally::new();
        for index in &artifacts.report.completed {
            let Some(output) = artifacts.read(&sim_log(*index)) else {
                tally.unreadable();
                continue;
            };
            let scores = parse_scores(&output, players.len())?;
            if scores.len() != players.len() {
                tally.unreadable();
                continue;
            }
            for (player, score) in players.iter().zip(scores) {
                tally.add(player, score);
            }
        }
        tally.apply(players, artifacts, stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const OUTPUT: &str = "\
Program \"Imp\" (length 1) by \"A. K. Dewdney\"

Imp by A. K. Dewdney scores 12
Dwarf by A. K. Dewdney scores 27
Results: 3 8 3
";

    #[test]
    fn scores_follow_argument_order() {
        assert_eq!(parse_scores(OUTPUT, 2).unwrap(), vec![12.0, 27.0]);
    }

    #[test]
    fn rounds_are_split_into_processes() {
        let arena = CoreWar::new(25, CoreWarSettings::default());
        assert_eq!(25usize.div_ceil(arena.chunk()), 3);
        assert_eq!(arena.chunk_len(0, 25), 10);
        assert_eq!(arena.chunk_len(2, 25), 5);
    }

    #[test]
    fn extra_settings_become_flags() {
        let settings: CoreWarSettings =
            serde_json::from_value(json!({"sims_per_process": 5, "s": 8000, "b": true})).unwrap();
        assert_eq!(settings.sims_per_process, 5);
        assert_eq!(settings.validation_opponent, "/home/dwarf.red");
        let arena = CoreWar::new(10, settings);
        assert_eq!(arena.run_cmd, "./src/pmars -b -s 8000");
    }
}
