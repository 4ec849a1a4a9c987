#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use code_tournament::{
    arena::{
        run_simulations, Arena, ArenaContext, Codebase, ExecutionReport, RoundArtifacts,
        Validation, WinTally,
    },
    configuration::Configuration,
    constraints::{Constraints, ConstraintsBuilder},
    round_stats::RoundStats,
    sandbox::{local::LocalSandboxFactory, submission_path},
};

pub const BOT_FILE: &str = "bot.txt";

/// Scratch space holding a base image with `bot.txt` set to `strength` and a sandbox root.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new(strength: u32) -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("image");
        fs::create_dir_all(&image).unwrap();
        fs::write(image.join(BOT_FILE), format!("{strength}\n")).unwrap();
        fs::write(image.join("README.md"), "scripted game\n").unwrap();
        Workspace { dir }
    }

    pub fn image(&self) -> PathBuf {
        self.dir.path().join("image")
    }

    pub fn output(&self) -> PathBuf {
        self.dir.path().join("output")
    }

    pub fn factory(&self) -> LocalSandboxFactory {
        LocalSandboxFactory::new(
            self.image(),
            self.dir.path().join("sandboxes"),
            &constraints(),
            &configuration(),
        )
    }
}

pub fn constraints() -> Constraints {
    ConstraintsBuilder::new()
        .with_command_timeout(Duration::from_secs(30))
        .with_validation_timeout(Duration::from_secs(1))
        .with_simulation_timeout(Duration::from_secs(1))
        .with_agent_timeout(Duration::from_secs(30))
        .with_simulation_workers(4)
        .with_matrix_workers(2)
        .build()
        .unwrap()
}

pub fn configuration() -> Configuration {
    Configuration::new().with_verbose(false).with_allow_uncontained(true)
}

pub fn has_git() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// How [`ScriptedArena`] decides each simulation.
#[derive(Clone, Copy)]
pub enum Script {
    /// Winner name by simulation index; `""` is a draw and `"SLEEP"` outlives the deadline.
    ByIndex(fn(usize) -> &'static str),
    /// The codebase with the highest number in `bot.txt` wins every simulation.
    Strongest,
}

/// Game whose outcome is dictated by the test. A codebase is valid when it has `bot.txt`;
/// a `bot.txt` containing `slow` makes validation hang.
pub struct ScriptedArena {
    pub sims: usize,
    pub script: Script,
}

impl ScriptedArena {
    pub fn new(sims: usize, script: Script) -> Self {
        Self { sims, script }
    }

    pub fn boxed(sims: usize, script: Script) -> Box<dyn Arena> {
        Box::new(Self::new(sims, script))
    }
}

fn strongest(ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<String> {
    let mut best: Option<(u64, &str)> = None;
    let mut tied = false;
    for player in players {
        let out = ctx
            .sandbox
            .execute_checked(&format!("cat {}/{BOT_FILE}", submission_path(player)), Some(""), None)?;
        let strength: u64 = out.output.trim().parse()?;
        match best {
            Some((b, _)) if strength == b => tied = true,
            Some((b, _)) if strength < b => {}
            _ => {
                best = Some((strength, player));
                tied = false;
            }
        }
    }
    Ok(match best {
        Some((_, name)) if !tied => name.to_string(),
        _ => String::new(),
    })
}

impl Arena for ScriptedArena {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn description(&self) -> &str {
        "Scripted outcomes for tests"
    }

    fn submission(&self) -> &str {
        BOT_FILE
    }

    fn sims_per_round(&self) -> usize {
        self.sims
    }

    fn validate(&self, codebase: &Codebase<'_>, constraints: &Constraints) -> anyhow::Result<Validation> {
        let out = codebase
            .sandbox
            .execute(&format!("cat {BOT_FILE}"), None, Some(constraints.validation_timeout()))?;
        if !out.success() {
            return Ok(Validation::invalid(format!("There should be a `{BOT_FILE}` file")));
        }
        if out.output.contains("mute") {
            return Ok(Validation::Invalid(String::new()));
        }
        if out.output.contains("slow") {
            codebase
                .sandbox
                .execute("sleep 10", None, Some(constraints.validation_timeout()))?;
        }
        Ok(Validation::Valid)
    }

    fn execute(&self, ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<ExecutionReport> {
        let fixed = match self.script {
            Script::Strongest => Some(strongest(ctx, players)?),
            Script::ByIndex(_) => None,
        };
        Ok(run_simulations(ctx, None, |index| {
            let winner = match (&fixed, self.script) {
                (Some(winner), _) => winner.as_str(),
                (None, Script::ByIndex(f)) => f(index),
                (None, Script::Strongest) => "",
            };
            if winner == "SLEEP" {
                "sleep 10".to_string()
            } else {
                format!("echo '{winner}' > {}", ctx.log_file(&format!("sim_{index}.txt")))
            }
        }))
    }

    fn score(&self, players: &[&str], artifacts: &RoundArtifacts<'_>, stats: &mut RoundStats) -> anyhow::Result<()> {
        let mut tally = WinTally::new();
        for index in &artifacts.report.completed {
            match artifacts.read(&format!("sim_{index}.txt")) {
                Some(winner) if players.contains(&winner.trim()) => tally.win(winner.trim()),
                Some(winner) if winner.trim().is_empty() => tally.draw(),
                _ => tally.unreadable(),
            }
        }
        tally.apply(players, artifacts, stats);
        Ok(())
    }
}

/// Sorted file names in `dir`, empty when it does not exist.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
