//! Territory control on a grid, with bots written in one of several compiled or interpreted
//! languages.

use std::{collections::BTreeMap, time::Duration};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    flag_args, run_simulations, Arena, ArenaContext, Codebase, ExecutionReport, RoundArtifacts,
    Validation, WinTally,
};
use crate::{
    constraints::Constraints,
    round_stats::RoundStats,
    sandbox::{quote, submission_path, Sandbox, LOG_DIR, WORKDIR},
};

const DESCRIPTION: &str = "Halite is a multi-player turn-based strategy game where bots compete \
on a rectangular grid to capture territory and accumulate strength.
Players control pieces that can move across the map to conquer neutral and enemy territory, \
with each cell providing production that increases the strength of pieces occupying it.
The goal is to control the most territory by the end of the game through strategic expansion, \
consolidation of forces, and tactical combat decisions.

You have the choice of writing your Halite bot in C, C++, JavaScript, OCaml, Python or Rust.
Your submission should be stored in the `submission/` folder.
Please make sure your main file is named `main.<ext>`, where `<ext>` is the appropriate file \
extension for your chosen programming language.
The `submission/` folder must contain a single bot, and that bot must compile.";

const HALITE: &str = "./environment/halite";

/// Prefix of the scratch copies used to compile during validation, at the sandbox root.
const SCRATCH_PREFIX: &str = "halite_validation";

/// A supported bot language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Language {
    ext: &'static str,
    compile: Option<&'static str>,
    /// Run command relative to the submission directory `{p}`.
    run: &'static str,
}

const LANGUAGES: [Language; 6] = [
    Language { ext: "c", compile: Some("gcc main.c -o main.o"), run: "{p}/main.o" },
    Language { ext: "cpp", compile: Some("g++ -std=c++11 main.cpp -o main.o"), run: "{p}/main.o" },
    Language { ext: "js", compile: None, run: "node {p}/main.js" },
    Language { ext: "ml", compile: Some("ocamlbuild -lib unix main.native"), run: "{p}/main.native" },
    Language { ext: "py", compile: None, run: "python {p}/main.py" },
    Language { ext: "rs", compile: Some("cargo build"), run: "{p}/target/debug/main" },
];

impl Language {
    fn run_command(&self, dir: &str) -> String {
        self.run.replace("{p}", dir)
    }
}

/// The single supported `main.<ext>` of a directory listing.
fn detect_language(listing: &str) -> Result<Language, String> {
    let found: Vec<Language> = listing
        .lines()
        .filter_map(|name| name.trim().strip_prefix("main."))
        .filter_map(|ext| LANGUAGES.iter().find(|l| l.ext == ext).copied())
        .collect();
    match found.as_slice() {
        [only] => Ok(*only),
        _ => {
            let exts: Vec<&str> = LANGUAGES.iter().map(|l| l.ext).collect();
            Err(format!(
                "Exactly one main.[{}] file must be present in submission, found {}",
                exts.join("|"),
                found.len()
            ))
        }
    }
}

/// Settings of [`Halite`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HaliteSettings {
    /// Deadline of one bot compilation.
    pub compile_timeout_secs: u64,
    /// Remaining keys are passed to `halite` as `--key value` flags.
    #[serde(flatten)]
    pub flags: BTreeMap<String, Value>,
}

impl Default for HaliteSettings {
    fn default() -> Self {
        Self {
            compile_timeout_secs: 15,
            flags: BTreeMap::new(),
        }
    }
}

/// Halite arena.
#[derive(Debug, Clone)]
pub struct Halite {
    sims_per_round: usize,
    settings: HaliteSettings,
}

impl Halite {
    /// A Halite arena playing `sims_per_round` games per round.
    pub fn new(sims_per_round: usize, settings: HaliteSettings) -> Self {
        Self {
            sims_per_round,
            settings,
        }
    }

    fn compile_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.settings.compile_timeout_secs))
    }

    /// Find and build the bot in `dir` (relative to the sandbox root). `Ok(Err(reason))` when the
    /// submission itself is at fault.
    fn build(&self, sandbox: &dyn Sandbox, dir: &str) -> anyhow::Result<Result<Language, String>> {
        let listing = sandbox.execute(&format!("ls -1 {}", quote(dir)), Some(""), None)?;
        if !listing.success() {
            return Ok(Err(format!("Submission folder `{}/` does not exist", self.submission())));
        }
        let language = match detect_language(&listing.output) {
            Ok(language) => language,
            Err(reason) => return Ok(Err(reason)),
        };
        if let Some(compile) = language.compile {
            match sandbox.execute(compile, Some(dir), self.compile_timeout()) {
                Ok(out) if out.success() => {}
                Ok(out) => {
                    return Ok(Err(format!(
                        "Compilation failed (ran {compile} inside {}): {}",
                        self.submission(),
                        out.output
                    )))
                }
                Err(e) if e.is_timeout() => {
                    return Ok(Err(format!(
                        "Compilation failed (ran {compile} inside {}): timed out",
                        self.submission()
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Ok(language))
    }

    fn smoke_test(
        &self,
        sandbox: &dyn Sandbox,
        scratch: &str,
        language: Language,
        constraints: &Constraints,
    ) -> anyhow::Result<Validation> {
        let bot = quote(&language.run_command(self.submission()));
        let command = format!(
            "{HALITE} --replaydirectory {} {bot} {bot}",
            sandbox.resolve(&format!("{scratch}/replays"))
        );
        match sandbox.execute(&command, Some(scratch), Some(constraints.validation_timeout())) {
            Ok(out) if out.success() => Ok(Validation::Valid),
            Ok(out) => Ok(Validation::invalid(format!(
                "Submission failed to run (ran {command}): {}",
                out.output
            ))),
            Err(e) if e.is_timeout() => Ok(Validation::invalid(format!(
                "Submission failed to run (ran {command}): timed out"
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

fn sim_log(index: usize) -> String {
    format!("sim_{index}.log")
}

/// 1-based indexes of the players ranked first, read from the last `players + 1` lines.
fn parse_ranks(output: &str, players: usize) -> anyhow::Result<Vec<usize>> {
    let re = Regex::new(r"Player\s#(\d+),\s(.*),\scame\sin\srank\s#(\d+)")?;
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(players + 1);
    Ok(lines[start..]
        .iter()
        .filter_map(|line| re.captures(line))
        .filter(|caps| &caps[3] == "1")
        .filter_map(|caps| caps[1].parse().ok())
        .collect())
}

impl Arena for Halite {
    fn name(&self) -> &str {
        "Halite"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn submission(&self) -> &str {
        "submission"
    }

    fn sims_per_round(&self) -> usize {
        self.sims_per_round
    }

    /// Compiles and smoke-tests a scratch copy, leaving the workspace untouched.
    ///
    /// Every call gets its own copy: a snapshot may be validated by several matrix cells at once.
    #[instrument(skip_all, fields(player = codebase.name))]
    fn validate(&self, codebase: &Codebase<'_>, constraints: &Constraints) -> anyhow::Result<Validation> {
        let sandbox = codebase.sandbox;
        let scratch = format!("{SCRATCH_PREFIX}_{}", Uuid::new_v4().simple());
        sandbox.execute_checked(
            &format!("cp -r {WORKDIR} {scratch}"),
            Some(""),
            None,
        )?;
        let verdict = match self.build(sandbox, &format!("{scratch}/{}", self.submission())) {
            Ok(Ok(language)) => self.smoke_test(sandbox, &scratch, language, constraints),
            Ok(Err(reason)) => Ok(Validation::Invalid(reason)),
            Err(e) => Err(e),
        };
        if let Err(e) = sandbox.execute(&format!("rm -rf {scratch}"), Some(""), None) {
            warn!("Could not remove validation scratch copy: {e}");
        }
        verdict
    }

    #[instrument(skip_all)]
    fn execute(&self, ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<ExecutionReport> {
        let mut bots = Vec::with_capacity(players.len());
        let mut forfeits = Vec::new();
        for player in players {
            let dir = format!("{}/{}", submission_path(player), self.submission());
            match self.build(ctx.sandbox, &dir)? {
                Ok(language) => bots.push(quote(&language.run_command(&ctx.sandbox.resolve(&dir)))),
                Err(reason) => {
                    warn!(player, "Bot could not be built: {reason}");
                    forfeits.push((player.to_string(), reason));
                }
            }
        }
        if bots.len() < 2 {
            return Ok(ExecutionReport {
                forfeits,
                ..Default::default()
            });
        }
        let command = format!(
            "{HALITE} --replaydirectory {}{} {}",
            ctx.sandbox.resolve(LOG_DIR),
            flag_args(&self.settings.flags, "--"),
            bots.join(" ")
        );
        debug!("Running game: {command}");
        let mut report = run_simulations(ctx, None, |index| {
            format!("{command} > {}", ctx.log_file(&sim_log(index)))
        });
        report.forfeits = forfeits;
        Ok(report)
    }

    fn score(
        &self,
        players: &[&str],
        artifacts: &RoundArtifacts<'_>,
        stats: &mut RoundStats,
    ) -> anyhow::Result<()> {
        // Bots are numbered in the order they were passed, forfeited players excluded.
        let playing: Vec<&str> = players
            .iter()
            .copied()
            .filter(|p| !artifacts.report.forfeited(p))
            .collect();
        let mut tally = WinTally::new();
        for index in &artifacts.report.completed {
            let Some(output) = artifacts.read(&sim_log(*index)) else {
                tally.unreadable();
                continue;
            };
            let winners: Vec<&str> = parse_ranks(&output, playing.len())?
                .into_iter()
                .filter_map(|i| i.checked_sub(1).and_then(|i| playing.get(i)).copied())
                .collect();
            match winners.as_slice() {
                [] => tally.unreadable(),
                [winner] => tally.win(winner),
                _ => tally.draw(),
            }
        }
        tally.apply(players, artifacts, stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_main_file_is_required() {
        assert_eq!(detect_language("main.cpp\nhlt.h\n").unwrap().ext, "cpp");
        assert!(detect_language("main.c\nmain.py\n").is_err());
        assert!(detect_language("bot.c\n").is_err());
        assert!(detect_language("main.java\n").is_err());
    }

    #[test]
    fn run_commands_point_into_the_submission() {
        let rust = LANGUAGES.iter().find(|l| l.ext == "rs").unwrap();
        assert_eq!(rust.run_command("/arena/x"), "/arena/x/target/debug/main");
    }

    #[test]
    fn rank_one_wins() {
        let output = "\
Turn 300
Player #1, alice, came in rank #2 and was last alive on frame #300!
Player #2, bob, came in rank #1 and was last alive on frame #300!
";
        assert_eq!(parse_ranks(output, 2).unwrap(), vec![2]);
    }
}
