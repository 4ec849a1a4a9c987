//! Snakes on a grid, each one served over HTTP by its own bot process.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU16, Ordering},
    thread,
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{
    flag_args, Arena, ArenaContext, Codebase, ExecutionReport, RoundArtifacts, Validation,
    WinTally,
};
use crate::{
    constraints::Constraints,
    round_stats::RoundStats,
    sandbox::{submission_path, Sandbox, LOG_DIR, WORKDIR},
};

const DESCRIPTION: &str = "Your bot (`main.py`) controls a snake on a grid-based board.
Snakes collect food, avoid collisions, and try to outlast their opponents.";

const REQUIRED_FUNCTIONS: [&str; 4] = ["def info(", "def start(", "def end(", "def move("];

/// Rounds running at the same time (matrix evaluation) share the host network, so every
/// server gets a port no other live round uses.
static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);
const PORT_SPAN: u16 = 2000;

/// Settings of [`BattleSnake`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BattleSnakeSettings {
    /// Board width.
    pub width: u32,
    /// Board height.
    pub height: u32,
    /// Open the game in a browser.
    pub browser: bool,
    /// First port handed to bot servers.
    pub base_port: u16,
    /// How long servers get to start answering.
    pub startup_timeout_secs: u64,
    /// Remaining keys are passed to `battlesnake play` as `--key value` flags.
    #[serde(flatten)]
    pub flags: BTreeMap<String, Value>,
}

impl Default for BattleSnakeSettings {
    fn default() -> Self {
        Self {
            width: 11,
            height: 11,
            browser: false,
            base_port: 8001,
            startup_timeout_secs: 60,
            flags: BTreeMap::new(),
        }
    }
}

/// BattleSnake arena.
#[derive(Debug, Clone)]
pub struct BattleSnake {
    sims_per_round: usize,
    settings: BattleSnakeSettings,
    run_cmd: String,
}

#[derive(Debug)]
struct Server<'a> {
    player: &'a str,
    port: u16,
    pid: Option<u32>,
}

impl BattleSnake {
    /// A BattleSnake arena playing `sims_per_round` games per round.
    pub fn new(sims_per_round: usize, settings: BattleSnakeSettings) -> Self {
        let mut run_cmd = format!(
            "./battlesnake play --width {} --height {}",
            settings.width, settings.height
        );
        if settings.browser {
            run_cmd.push_str(" --browser");
        }
        run_cmd.push_str(&flag_args(&settings.flags, "--"));
        Self {
            sims_per_round,
            settings,
            run_cmd,
        }
    }

    fn next_port(&self) -> u16 {
        let offset = PORT_OFFSET.fetch_add(1, Ordering::Relaxed) % PORT_SPAN;
        self.settings.base_port.saturating_add(offset)
    }

    fn start_servers<'a>(&self, sandbox: &dyn Sandbox, players: &[&'a str]) -> anyhow::Result<Vec<Server<'a>>> {
        let mut servers = Vec::with_capacity(players.len());
        for &player in players {
            let port = self.next_port();
            let command = format!(
                "PORT={port} nohup python {} > {} 2>&1 & echo $!",
                self.submission(),
                sandbox.resolve(&format!("{LOG_DIR}/server_{player}.log"))
            );
            let out = sandbox.execute(&command, Some(&submission_path(player)), None)?;
            let pid = out.output.trim().lines().last().and_then(|l| l.trim().parse().ok());
            debug!(player, port, ?pid, "Started bot server");
            servers.push(Server { player, port, pid });
        }
        Ok(servers)
    }

    /// Ports answering HTTP before the startup timeout.
    fn wait_for_ports(&self, sandbox: &dyn Sandbox, servers: &[Server<'_>]) -> anyhow::Result<Vec<u16>> {
        let deadline = Instant::now() + Duration::from_secs(self.settings.startup_timeout_secs);
        let mut ready: Vec<u16> = Vec::new();
        loop {
            let pending: Vec<&Server<'_>> = servers.iter().filter(|s| !ready.contains(&s.port)).collect();
            for server in pending {
                let probe = sandbox.execute(
                    &format!("wget -S --spider --timeout=1 http://localhost:{}/ 2>&1", server.port),
                    None,
                    Some(Duration::from_secs(5)),
                );
                match probe {
                    Ok(out) if out.success() || out.output.contains("HTTP/") => ready.push(server.port),
                    Ok(_) => {}
                    Err(e) if e.is_timeout() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if ready.len() == servers.len() || Instant::now() >= deadline {
                return Ok(ready);
            }
            thread::sleep(Duration::from_millis(100));
        }
    }

    fn stop_servers(&self, sandbox: &dyn Sandbox, servers: &[Server<'_>]) {
        let pids: Vec<String> = servers.iter().filter_map(|s| s.pid).map(|p| p.to_string()).collect();
        if pids.is_empty() {
            return;
        }
        if let Err(e) = sandbox.execute(&format!("kill {} 2>/dev/null || true", pids.join(" ")), None, None) {
            warn!("Could not stop bot servers: {e}");
        }
    }

    fn play(&self, ctx: &ArenaContext<'_>, servers: &[Server<'_>]) -> anyhow::Result<ExecutionReport> {
        let ready = self.wait_for_ports(ctx.sandbox, servers)?;
        let mut forfeits = Vec::new();
        for server in servers.iter().filter(|s| !ready.contains(&s.port)) {
            warn!(player = server.player, "Bot server failed to start");
            forfeits.push((
                server.player.to_string(),
                format!("server did not answer on port {} in time", server.port),
            ));
        }
        if ready.len() < 2 {
            return Ok(ExecutionReport {
                forfeits,
                ..Default::default()
            });
        }

        let live: Vec<&Server<'_>> = servers.iter().filter(|s| ready.contains(&s.port)).collect();
        info!("Running {} games between {} snakes", ctx.sims_per_round, live.len());
        let cwd = format!("{WORKDIR}/game");
        let timeout = ctx.scheduler.timeout();
        let records = ctx.scheduler.run(ctx.sims_per_round, |index| {
            let mut order = live.clone();
            order.shuffle(&mut rand::thread_rng());
            let urls: Vec<String> = order
                .iter()
                .map(|s| format!("--url http://0.0.0.0:{} -n {}", s.port, s.player))
                .collect();
            let command = format!(
                "{} {} -o {}",
                self.run_cmd,
                urls.join(" "),
                ctx.log_file(&sim_log(index))
            );
            Ok(ctx.sandbox.execute_checked(&command, Some(&cwd), Some(timeout))?)
        });
        let mut report = ExecutionReport::from_records(&records);
        report.forfeits = forfeits;
        Ok(report)
    }
}

fn sim_log(index: usize) -> String {
    format!("sim_{index}.jsonl")
}

/// Outcome written on the last line of a game log.
#[derive(Debug, PartialEq)]
enum GameResult {
    Draw,
    Winner(String),
}

fn parse_game(log: &str) -> Option<GameResult> {
    let last = log.lines().rev().find(|l| !l.trim().is_empty())?;
    let result: Value = serde_json::from_str(last).ok()?;
    if result.get("isDraw").and_then(Value::as_bool).unwrap_or(false) {
        return Some(GameResult::Draw);
    }
    result
        .get("winnerName")
        .and_then(Value::as_str)
        .map(|w| GameResult::Winner(w.to_string()))
}

impl Arena for BattleSnake {
    fn name(&self) -> &str {
        "BattleSnake"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn submission(&self) -> &str {
        "main.py"
    }

    fn sims_per_round(&self) -> usize {
        self.sims_per_round
    }

    fn check_players(&self, count: usize) -> anyhow::Result<()> {
        if count < 2 {
            anyhow::bail!("BattleSnake needs at least two snakes, got {count}");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(player = codebase.name))]
    fn validate(&self, codebase: &Codebase<'_>, constraints: &Constraints) -> anyhow::Result<Validation> {
        let out = codebase.sandbox.execute(
            &format!("cat {}", self.submission()),
            None,
            Some(constraints.validation_timeout()),
        )?;
        if !out.success() {
            return Ok(Validation::invalid(format!(
                "No {} file found in the root directory",
                self.submission()
            )));
        }
        let missing: Vec<String> = REQUIRED_FUNCTIONS
            .iter()
            .filter(|f| !out.output.contains(*f))
            .map(|f| format!("There should be a `{f}` function implemented in `{}`", self.submission()))
            .collect();
        if missing.is_empty() {
            Ok(Validation::Valid)
        } else {
            Ok(Validation::invalid(format!(
                "{}\nDon't change the function signatures!",
                missing.join("\n")
            )))
        }
    }

    #[instrument(skip_all)]
    fn execute(&self, ctx: &ArenaContext<'_>, players: &[&str]) -> anyhow::Result<ExecutionReport> {
        let servers = self.start_servers(ctx.sandbox, players)?;
        let report = self.play(ctx, &servers);
        self.stop_servers(ctx.sandbox, &servers);
        report
    }

    fn score(
        &self,
        players: &[&str],
        artifacts: &RoundArtifacts<'_>,
        stats: &mut RoundStats,
    ) -> anyhow::Result<()> {
        let mut tally = WinTally::new();
        for index in &artifacts.report.completed {
            match artifacts.read(&sim_log(*index)).as_deref().and_then(parse_game) {
                Some(GameResult::Draw) => tally.draw(),
                Some(GameResult::Winner(w)) if players.contains(&w.as_str()) => tally.win(&w),
                _ => tally.unreadable(),
            }
        }
        tally.apply(players, artifacts, stats);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configuration::Configuration,
        constraints::ConstraintsBuilder,
        sandbox::{local::LocalSandboxFactory, SandboxFactory},
    };
    use serde_json::json;

    #[test]
    fn last_line_decides() {
        let log = "{\"turn\":1}\n{\"winnerName\":\"alice\",\"isDraw\":false}\n\n";
        assert_eq!(parse_game(log), Some(GameResult::Winner("alice".into())));
        assert_eq!(parse_game("{\"isDraw\":true}"), Some(GameResult::Draw));
        assert_eq!(parse_game("not json"), None);
    }

    #[test]
    fn command_carries_board_and_extra_flags() {
        let settings: BattleSnakeSettings =
            serde_json::from_value(json!({"width": 7, "timeout": 500})).unwrap();
        assert_eq!(settings.height, 11);
        let arena = BattleSnake::new(1, settings);
        assert_eq!(
            arena.run_cmd,
            "./battlesnake play --width 7 --height 11 --timeout 500"
        );
    }

    #[test]
    fn every_handler_must_be_defined() {
        let base = tempfile::tempdir().unwrap();
        std::fs::write(
            base.path().join("main.py"),
            "def info():\n    pass\ndef start(s):\n    pass\ndef move(s):\n    pass\n",
        )
        .unwrap();
        let root = tempfile::tempdir().unwrap();
        let constraints = ConstraintsBuilder::new().build().unwrap();
        let factory = LocalSandboxFactory::new(base.path(), root.path(), &constraints, &Configuration::new());
        let sandbox = factory.create("alice").unwrap();
        let codebase = Codebase {
            name: "alice",
            sandbox: sandbox.as_ref(),
        };
        let arena = BattleSnake::new(1, BattleSnakeSettings::default());
        let Validation::Invalid(reason) = arena.validate(&codebase, &constraints).unwrap() else {
            panic!("a bot without `end` was accepted");
        };
        assert!(reason.contains("def end("));
        assert!(!reason.contains("def move("));

        sandbox.write_file("def end(s):\n    pass\n", "workspace/end.py").unwrap();
        sandbox
            .execute_checked("cat end.py >> main.py", None, None)
            .unwrap();
        assert_eq!(arena.validate(&codebase, &constraints).unwrap(), Validation::Valid);
    }

    #[test]
    fn ports_are_not_reused() {
        let arena = BattleSnake::new(1, BattleSnakeSettings::default());
        let a = arena.next_port();
        let b = arena.next_port();
        assert_ne!(a, b);
        assert!(a >= 8001 && b >= 8001);
    }
}
