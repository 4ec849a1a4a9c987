//! Two teams of robots on a grid, driven by a `robot(state, unit)` function.

use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{
    flag_args, run_simulations, Arena, ArenaContext, Codebase, ExecutionReport, RoundArtifacts,
    Validation, WinTally,
};
use crate::{
    constraints::Constraints,
    round_stats::RoundStats,
    sandbox::{quote, submission_path, Sandbox},
};

const DESCRIPTION: &str = "RobotRumble is a turn-based coding battle where you program a team \
of robots in Python or JavaScript to move, attack, and outmaneuver your opponent on a grid.
Every decision is driven by your code, and victory comes from crafting logic that positions \
robots smartly, times attacks well, and adapts over the 100-turn match.
NOTE: Please ensure that your code runs efficiently (under 60 seconds). Code that exceeds this \
run time will automatically forfeit the round.";

/// Accepted robot files, in lookup order, with the header each one must define.
const ROBOT_FILES: [(&str, &str); 2] = [
    ("robot.js", "function robot(state, unit) {"),
    ("robot.py", "def robot(state, unit):"),
];

/// Settings of [`RobotRumble`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RobotRumbleSettings {
    /// Write machine readable JSON results instead of the terminal rendering.
    pub raw: bool,
    /// Turns played by the validation smoke run.
    pub validation_turns: u32,
    /// Deadline of the validation smoke run.
    pub validation_timeout_secs: u64,
    /// Remaining keys are passed to `rumblebot run term` as `--key value` flags.
    #[serde(flatten)]
    pub flags: BTreeMap<String, Value>,
}

impl Default for RobotRumbleSettings {
    fn default() -> Self {
        Self {
            raw: true,
            validation_turns: 1,
            validation_timeout_secs: 10,
            flags: BTreeMap::new(),
        }
    }
}

/// RobotRumble arena. Exactly two players: the first one plays Blue, the second one Red.
#[derive(Debug, Clone)]
pub struct RobotRumble {
    sims_per_round: usize,
    settings: RobotRumbleSettings,
    run_cmd: String,
}

impl RobotRumble {
    /// A RobotRumble arena playing `sims_per_round` matches per round.
    pub fn new(sims_per_round: usize, settings: RobotRumbleSettings) -> Self {
        let mut run_cmd = String::from("./rumblebot run term");
        if settings.raw {
            run_cmd.push_str(" --raw");
        }
        run_cmd.push_str(&flag_args(&settings.flags, "--"));
        Self {
            sims_per_round,
            settings,
            run_cmd,
        }
    }

    fn sim_log(&self, index: usize) -> String {
        let ext = if self.settings.raw { "json" } else { "txt" };
        format!("sim_{index}.{ext}")
    }

    /// First robot file present under `dir`, with its header.
    fn find_robot(&self, sandbox: &dyn Sandbox, dir: &str, timeout: Option<Duration>) -> anyhow::Result<Option<(&'static str, &'static str)>> {
        for (file, header) in ROBOT_FILES {
            let probe = sandbox.execute(&format!("test -f {}", quote(&format!("{dir}/{file}"))), Some(""), timeout)?;
            if probe.success() {
                return Ok(Some((file, header)));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Side {
    Blue,
    Red,
    Tie,
}

fn parse_json(output: &str) -> Option<Side> {
    let data: Value = serde_json::from_str(output).ok()?;
    match data.get("winner")?.as_str() {
        Some("Blue") => Some(Side::Blue),
        Some("Red") => Some(Side::Red),
        _ => Some(Side::Tie),
    }
}

fn parse_text(output: &str) -> Option<Side> {
    let lines: Vec<&str> = output.trim().lines().collect();
    let tail = lines[lines.len().saturating_sub(2)..].join("\n");
    if tail.contains("Blue won") {
        Some(Side::Blue)
    } else if tail.contains("Red won") {
        Some(Side::Red)
    } else if tail.contains("it was a tie") {
        Some(Side::Tie)
    } else {
        None
    }
}

impl Arena for RobotRumble {
    fn name(&self) -> &str {
        "RobotRumble"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn submission(&self) -> &str {
        "robot.js"
    }

    fn sims_per_round(&self) -> usize {
        self.sims_per_round
    }

    fn check_players(&self, count: usize) -> anyhow::Result<()> {
        if count != 2 {
            anyhow::bail!("RobotRumble is a two-player game, got {count} players");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(player = codebase.name))]
    fn validate(&self, codebase: &Codebase<'_>, constraints: &Constraints) -> anyhow::Result<Validation> {
        let timeout = Some(constraints.validation_timeout());
        let Some((file, header)) = self.find_robot(codebase.sandbox, crate::sandbox::WORKDIR, timeout)? else {
            return Ok(Validation::invalid("There should be a `robot.js` or `robot.py` file"));
        };
        let source = codebase.sandbox.execute(&format!("cat {file}"), None, timeout)?;
        if !source.output.contains(header) {
            return Ok(Validation::invalid(format!(
                "{file} does not contain the required robot function. It should be defined as '{header}'."
            )));
        }
        let command = format!("{} {file} {file} -t {}", self.run_cmd, self.settings.validation_turns);
        let smoke_timeout = Duration::from_secs(self.settings.validation_timeout_secs);
        match codebase.sandbox.execute(&command, None, Some(smoke_timeout)) {
            Ok(run) if run.output.contains("Some errors occurred:") => Ok(Validation::invalid(format!(
                "Running {file} (with `{command}`) resulted in errors:\n{}",
                run.output
            ))),
            Ok(_) => Ok(Validation::Valid),
            Err(e) if e.is_timeout() => Ok(Validation::invalid(format!(
                "Running {file} (with `{command}`) timed out ({} seconds). Please ensure your code runs efficiently.",
                self.settings.validation_timeout_secs
            ))),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip_all)]
    fn execute(&self, ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<ExecutionReport> {
        let mut robots = Vec::with_capacity(players.len());
        for player in players {
            let dir = submission_path(player);
            let Some((file, _)) = self.find_robot(ctx.sandbox, &dir, None)? else {
                anyhow::bail!("no robot file in the submission of {player}");
            };
            robots.push(quote(&ctx.sandbox.resolve(&format!("{dir}/{file}"))));
        }
        let command = format!("{} {}", self.run_cmd, robots.join(" "));
        debug!("Running game: {command}");
        Ok(run_simulations(ctx, None, |index| {
            format!("{command} > {}", ctx.log_file(&self.sim_log(index)))
        }))
    }

    fn score(
        &self,
        players: &[&str],
        artifacts: &RoundArtifacts<'_>,
        stats: &mut RoundStats,
    ) -> anyhow::Result<()> {
        let [blue, red] = players else {
            anyhow::bail!("RobotRumble is a two-player game, got {} players", players.len());
        };
        let mut tally = WinTally::new();
        for index in &artifacts.report.completed {
            let side = artifacts.read(&self.sim_log(*index)).and_then(|output| {
                if self.settings.raw {
                    parse_json(&output)
                } else {
                    parse_text(&output)
                }
            });
            match side {
                Some(Side::Blue) => tally.win(blue),
                Some(Side::Red) => tally.win(red),
                Some(Side::Tie) => tally.draw(),
                None => tally.unreadable(),
            }
        }
        stats
            .details
            .push(format!("In this round, {blue} was Blue and {red} was Red."));
        tally.apply(players, artifacts, stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ExecutionReport;
    use std::fs;

    #[test]
    fn winners_are_read_from_both_formats() {
        assert_eq!(parse_json(r#"{"winner":"Red","turns":100}"#), Some(Side::Red));
        assert_eq!(parse_json(r#"{"winner":null}"#), Some(Side::Tie));
        assert_eq!(parse_json(r#"{"turns":100}"#), None);
        assert_eq!(parse_text("turn 100\n\nBlue won!\n"), Some(Side::Blue));
        assert_eq!(parse_text("Done, it was a tie"), Some(Side::Tie));
        assert_eq!(parse_text("crash"), None);
    }

    #[test]
    fn blue_is_the_first_player() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sim_0.json"), r#"{"winner":"Blue"}"#).unwrap();
        fs::write(dir.path().join("sim_1.json"), r#"{"winner":"Blue"}"#).unwrap();
        fs::write(dir.path().join("sim_2.json"), r#"{"winner":"Red"}"#).unwrap();
        let report = ExecutionReport {
            completed: vec![0, 1, 2],
            ..Default::default()
        };
        let artifacts = RoundArtifacts {
            report: &report,
            log_dir: dir.path(),
            sims_per_round: 3,
        };
        let arena = RobotRumble::new(3, RobotRumbleSettings::default());
        let mut stats = RoundStats::new(1, &["x", "y"]);
        arena.score(&["y", "x"], &artifacts, &mut stats).unwrap();
        assert_eq!(stats.winner, "y");
        assert_eq!(stats.scores["y"], 2.0);
        assert_eq!(stats.scores["x"], 1.0);
        assert!(stats.details.iter().any(|d| d == "In this round, y was Blue and x was Red."));
    }
}
