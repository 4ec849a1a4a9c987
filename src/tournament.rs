//! Multi-round tournaments: a baseline round, then alternating edit and competition phases.
//!
//! Everything a run produces lives in its output directory:
//!
//! ```text
//! <output>/
//!   metadata.json          rewritten atomically after every round
//!   tournament.log
//!   players/<name>/changes_r<round>.json
//!   rounds/<round>/results.json
//!   rounds/<round>/logs/ or logs.tar.gz
//! ```
//!
//! `metadata.json` only ever lists fully completed rounds, which is what
//! [`Tournament::resume`] restarts from.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use time::{format_description, OffsetDateTime};
use tracing::{dispatcher, error, info, instrument, warn};

use crate::{
    agent::{build_agent, Agent, AgentContext},
    arena::{get_arena, Arena, Codebase},
    configuration::{
        AgentConfig, Configuration, PlayerConfig, TournamentConfig, TournamentMode, MIRROR_PLAYER,
    },
    constraints::Constraints,
    logger::{current_dispatch, TournamentLogger},
    persistence::{archive_dir, read_json, write_json_atomic, RemoteSync},
    player::{Player, PlayerRecord, PlayerSetup},
    round_executor::RoundExecutor,
    round_stats::RoundStats,
    sandbox::{
        copy_between, quote, Sandbox, SandboxFactory, SandboxGuard, OPPONENTS_DIR, WORKDIR,
    },
};

/// Metadata file name in the output directory.
pub const METADATA_FILE: &str = "metadata.json";
/// Log file name in the output directory.
pub const LOG_FILE: &str = "tournament.log";

/// Persisted state of a tournament, the single source of truth for resuming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TournamentMetadata {
    /// Arena name.
    pub name: String,
    /// `<mode>.<arena>.<yymmddHHMMSS>`.
    pub tournament_id: String,
    /// Configuration the tournament was started with.
    pub config: TournamentConfig,
    /// Unix time of creation.
    pub created_timestamp: i64,
    /// Result of every completed round.
    #[serde(default)]
    pub round_stats: BTreeMap<usize, RoundStats>,
    /// Editing players.
    #[serde(default)]
    pub agents: Vec<PlayerRecord>,
    /// Unix time of the end of a successful run.
    #[serde(default)]
    pub completed_timestamp: Option<i64>,
}

impl TournamentMetadata {
    /// Last completed round.
    pub fn last_round(&self) -> Option<usize> {
        self.round_stats.keys().next_back().copied()
    }
}

/// Round directory of `round` under `output_dir`.
pub fn round_dir(output_dir: &Path, round: usize) -> PathBuf {
    output_dir.join("rounds").join(round.to_string())
}

fn tournament_id(config: &TournamentConfig) -> anyhow::Result<String> {
    let mode = match config.mode {
        TournamentMode::Pvp => "pvp",
        TournamentMode::SinglePlayer => "single_player",
    };
    let format = format_description::parse_borrowed::<2>(
        "[year repr:last_two][month][day][hour][minute][second]",
    )?;
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    Ok(format!("{mode}.{}.{}", config.arena.name, now.format(&format)?))
}

fn logger_for(output_dir: &Path, configuration: &Configuration) -> anyhow::Result<TournamentLogger> {
    if configuration.log {
        TournamentLogger::new(Some(&output_dir.join(LOG_FILE)), configuration.verbose)
    } else if configuration.verbose {
        TournamentLogger::new(None, true)
    } else {
        Ok(TournamentLogger::disabled())
    }
}

/// A running tournament.
pub struct Tournament {
    arena: Box<dyn Arena>,
    arena_sandbox: Arc<dyn Sandbox>,
    players: Vec<Player>,
    mirror: Option<Player>,
    configuration: Configuration,
    constraints: Constraints,
    output_dir: PathBuf,
    logger: TournamentLogger,
    remote_sync: Option<Box<dyn RemoteSync>>,
    metadata: TournamentMetadata,
    next_round: usize,
}

impl std::fmt::Debug for Tournament {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tournament")
            .field("id", &self.metadata.tournament_id)
            .field("players", &self.players)
            .field("next_round", &self.next_round)
            .finish_non_exhaustive()
    }
}

/// Shared context and sandboxes of one tournament being assembled.
struct Assembly<'a> {
    tournament_id: &'a str,
    config: &'a TournamentConfig,
    arena: &'a dyn Arena,
    factory: &'a dyn SandboxFactory,
    configuration: &'a Configuration,
    constraints: &'a Constraints,
    output_dir: &'a Path,
}

impl Assembly<'_> {
    fn setup(&self, editing: bool) -> anyhow::Result<PlayerSetup> {
        let push_remote = match (editing && self.configuration.push, &self.config.push_remote) {
            (false, _) => None,
            (true, Some(remote)) => Some(remote.clone()),
            (true, None) => bail!("pushing is enabled but the configuration has no push_remote"),
        };
        Ok(PlayerSetup {
            context: AgentContext {
                tournament_id: self.tournament_id.to_string(),
                arena: self.arena.name().to_string(),
                arena_description: self.arena.description().to_string(),
                submission: self.arena.submission().to_string(),
                player: String::new(),
                round: 0,
                rounds: self.config.rounds,
                working_dir: String::new(),
                log_dir: String::new(),
                recap: String::new(),
            },
            changes_dir: None,
            push_remote,
        })
    }

    fn player_setup(&self, name: &str) -> anyhow::Result<PlayerSetup> {
        let mut setup = self.setup(true)?;
        setup.changes_dir = Some(self.output_dir.join("players").join(name));
        Ok(setup)
    }

    fn mirror(&self, guard: &mut SandboxGuard) -> anyhow::Result<Option<Player>> {
        if self.config.mode != TournamentMode::SinglePlayer {
            return Ok(None);
        }
        let mut config = PlayerConfig::new(MIRROR_PLAYER, AgentConfig::Idle);
        config.branch_init = self.config.players.first().and_then(|p| p.branch_init.clone());
        let sandbox = guard.track(self.factory.create(MIRROR_PLAYER)?);
        let agent = build_agent(&config.agent, self.constraints);
        Player::create(config, sandbox, agent, self.setup(false)?).map(Some)
    }
}

impl Tournament {
    /// Prepare a new tournament in `output_dir`: one sandbox per player plus the arena sandbox,
    /// every codebase snapshotted at round 0.
    pub fn new(
        config: TournamentConfig,
        factory: &dyn SandboxFactory,
        output_dir: &Path,
        configuration: Configuration,
        constraints: Constraints,
    ) -> anyhow::Result<Self> {
        let arena = get_arena(&config.arena)?;
        Self::new_with_arena(config, arena, factory, output_dir, configuration, constraints)
    }

    /// Like [`Tournament::new`], with an arena that is not looked up by name.
    pub fn new_with_arena(
        config: TournamentConfig,
        arena: Box<dyn Arena>,
        factory: &dyn SandboxFactory,
        output_dir: &Path,
        configuration: Configuration,
        constraints: Constraints,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        arena.check_players(config.competitor_names().len())?;
        if output_dir.join(METADATA_FILE).exists() {
            bail!(
                "{} already holds a tournament; resume it instead",
                output_dir.display()
            );
        }
        fs::create_dir_all(output_dir)
            .with_context(|| format!("could not create {}", output_dir.display()))?;
        let logger = logger_for(output_dir, &configuration)?;
        let tournament_id = tournament_id(&config)?;

        let (arena_sandbox, players, mirror) = logger.in_scope(|| -> anyhow::Result<_> {
            info!("Creating tournament {tournament_id}");
            let assembly = Assembly {
                tournament_id: &tournament_id,
                config: &config,
                arena: arena.as_ref(),
                factory,
                configuration: &configuration,
                constraints: &constraints,
                output_dir,
            };
            let mut guard = SandboxGuard::new(configuration.keep_sandboxes);
            let arena_sandbox = guard.track(
                factory.create("arena").context("could not create the arena sandbox")?,
            );
            let mut players = Vec::with_capacity(config.players.len());
            for player_config in &config.players {
                let sandbox = factory
                    .create(&player_config.name)
                    .with_context(|| format!("could not create the sandbox of {}", player_config.name))?;
                let sandbox = guard.track(sandbox);
                let agent = build_agent(&player_config.agent, &constraints);
                let setup = assembly.player_setup(&player_config.name)?;
                players.push(Player::create(player_config.clone(), sandbox, agent, setup)?);
            }
            let mirror = assembly.mirror(&mut guard)?;
            guard.disarm();
            Ok((arena_sandbox, players, mirror))
        })?;

        let metadata = TournamentMetadata {
            name: arena.name().to_string(),
            tournament_id,
            config,
            created_timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            round_stats: BTreeMap::new(),
            agents: players.iter().map(|p| p.record().clone()).collect(),
            completed_timestamp: None,
        };
        let tournament = Tournament {
            arena,
            arena_sandbox,
            players,
            mirror,
            configuration,
            constraints,
            output_dir: output_dir.to_path_buf(),
            logger,
            remote_sync: None,
            metadata,
            next_round: 0,
        };
        tournament.save()?;
        Ok(tournament)
    }

    /// Reopen the tournament persisted in `output_dir` after its last completed round.
    ///
    /// Every player is rebuilt in a fresh sandbox from the diff of that round; the next run
    /// starts with the following edit phase.
    pub fn resume(
        output_dir: &Path,
        factory: &dyn SandboxFactory,
        configuration: Configuration,
        constraints: Constraints,
    ) -> anyhow::Result<Self> {
        let metadata: TournamentMetadata = read_json(&output_dir.join(METADATA_FILE))?;
        let arena = get_arena(&metadata.config.arena)?;
        Self::resume_with_arena(output_dir, arena, factory, configuration, constraints)
    }

    /// Like [`Tournament::resume`], with an arena that is not looked up by name.
    pub fn resume_with_arena(
        output_dir: &Path,
        arena: Box<dyn Arena>,
        factory: &dyn SandboxFactory,
        configuration: Configuration,
        constraints: Constraints,
    ) -> anyhow::Result<Self> {
        let mut metadata: TournamentMetadata = read_json(&output_dir.join(METADATA_FILE))?;
        if metadata.completed_timestamp.is_some() {
            bail!("tournament {} is already complete", metadata.tournament_id);
        }
        let config = metadata.config.clone();
        let logger = logger_for(output_dir, &configuration)?;
        let last_round = metadata.last_round();
        let next_round = last_round.map_or(0, |r| r + 1);

        let (arena_sandbox, players, mirror) = logger.in_scope(|| -> anyhow::Result<_> {
            info!(
                "Resuming tournament {} at round {next_round}",
                metadata.tournament_id
            );
            clean_rounds(output_dir, &metadata, &configuration)?;
            let assembly = Assembly {
                tournament_id: &metadata.tournament_id,
                config: &config,
                arena: arena.as_ref(),
                factory,
                configuration: &configuration,
                constraints: &constraints,
                output_dir,
            };
            let mut guard = SandboxGuard::new(configuration.keep_sandboxes);
            let arena_sandbox = guard.track(
                factory.create("arena").context("could not create the arena sandbox")?,
            );
            let mut players = Vec::with_capacity(metadata.agents.len());
            for record in &metadata.agents {
                let sandbox = factory
                    .create(&record.name)
                    .with_context(|| format!("could not create the sandbox of {}", record.name))?;
                let sandbox = guard.track(sandbox);
                let agent = build_agent(&record.config.agent, &constraints);
                let setup = assembly.player_setup(&record.name)?;
                players.push(Player::restore(
                    record.clone(),
                    last_round.unwrap_or(0),
                    sandbox,
                    agent,
                    setup,
                )?);
            }
            let mirror = assembly.mirror(&mut guard)?;
            guard.disarm();
            Ok((arena_sandbox, players, mirror))
        })?;

        metadata.agents = players.iter().map(|p| p.record().clone()).collect();
        Ok(Tournament {
            arena,
            arena_sandbox,
            players,
            mirror,
            configuration,
            constraints,
            output_dir: output_dir.to_path_buf(),
            logger,
            remote_sync: None,
            metadata,
            next_round,
        })
    }

    /// Drive `player` with `agent` instead of the one its configuration describes.
    pub fn with_agent(mut self, player: &str, agent: Box<dyn Agent>) -> anyhow::Result<Self> {
        let Some(target) = self.players.iter_mut().find(|p| p.name() == player) else {
            bail!("no player named {player}");
        };
        target.set_agent(agent);
        Ok(self)
    }

    /// Upload the output directory with `sync` after a successful run.
    pub fn with_remote_sync(mut self, sync: Box<dyn RemoteSync>) -> Self {
        self.remote_sync = Some(sync);
        self
    }

    /// Tournament id.
    pub fn id(&self) -> &str {
        &self.metadata.tournament_id
    }

    /// Current persisted state.
    pub fn metadata(&self) -> &TournamentMetadata {
        &self.metadata
    }

    /// Output directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// First round the next [`run`](Tournament::run) will play.
    pub fn next_round(&self) -> usize {
        self.next_round
    }

    /// Play every remaining round, then release the sandboxes.
    ///
    /// On error the metadata keeps every round completed so far and the round folders stay on
    /// disk, so the tournament can be inspected and resumed.
    pub fn run(mut self) -> anyhow::Result<TournamentMetadata> {
        let logger = self.logger.clone();
        logger.in_scope(|| {
            let result = self.play_rounds();
            if let Err(e) = &result {
                error!("Tournament {} aborted: {e:#}", self.metadata.tournament_id);
            }
            let end = self.end(result.is_ok());
            result.and(end)?;
            Ok(self.metadata)
        })
    }

    fn play_rounds(&mut self) -> anyhow::Result<()> {
        if self.next_round == 0 {
            self.competition_phase(0)?;
        }
        for round in self.next_round.max(1)..=self.metadata.config.rounds {
            self.edit_phase(round)?;
            self.competition_phase(round)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn edit_phase(&mut self, round: usize) -> anyhow::Result<()> {
        info!("Edit phase of round {round}");
        if self.metadata.config.transparent {
            self.mirror_opponents()?;
        }
        let recap = self
            .metadata
            .round_stats
            .get(&(round - 1))
            .map(ToString::to_string)
            .unwrap_or_default();
        let dispatch = current_dispatch();
        let results: Vec<(String, anyhow::Result<()>)> = thread::scope(|s| {
            let handles: Vec<_> = self
                .players
                .iter_mut()
                .map(|player| {
                    let (recap, dispatch) = (&recap, &dispatch);
                    let name = player.name().to_string();
                    let handle = s.spawn(move || {
                        dispatcher::with_default(dispatch, || {
                            player.pre_run_hook(round)?;
                            player.run(recap);
                            player.post_run_hook(round)
                        })
                    });
                    (name, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle
                        .join()
                        .unwrap_or_else(|_| Err(anyhow::anyhow!("edit phase thread panicked")));
                    (name, result)
                })
                .collect()
        });
        for (name, result) in results {
            result.with_context(|| format!("edit phase of {name} failed in round {round}"))?;
        }

        if let (Some(mirror), Some(source)) = (self.mirror.as_mut(), self.players.first()) {
            let previous = round - 1;
            let patch = source.record().diff.get(&previous).cloned().unwrap_or_default();
            let base = mirror.record().initial_commit_hash.clone();
            mirror
                .reset_and_apply_patch(&patch, Some(&base))
                .with_context(|| format!("could not reset the mirror to round {previous}"))?;
            info!("Mirror reset to the round {previous} codebase of {}", source.name());
        }
        Ok(())
    }

    /// Copy every player's codebase into each opponent's read-only `opponents/<name>`.
    fn mirror_opponents(&self) -> anyhow::Result<()> {
        for player in &self.players {
            for opponent in self.players.iter().filter(|o| o.name() != player.name()) {
                let dest = format!("{OPPONENTS_DIR}/{}", opponent.name());
                let sandbox = player.codebase().as_ref();
                sandbox.execute_checked(
                    &format!(
                        "if [ -e {0} ]; then chmod -R u+w {0}; fi; rm -rf {0}",
                        quote(&dest)
                    ),
                    Some(""),
                    None,
                )?;
                copy_between(opponent.codebase().as_ref(), WORKDIR, sandbox, &dest)
                    .with_context(|| format!("could not mirror {} for {}", opponent.name(), player.name()))?;
                sandbox.execute_checked(
                    &format!("rm -rf {0}/.git && chmod -R a-w {0}", quote(&dest)),
                    Some(""),
                    None,
                )?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn competition_phase(&mut self, round: usize) -> anyhow::Result<()> {
        info!("Competition phase of round {round}");
        let dir = round_dir(&self.output_dir, round);
        let log_dir = dir.join("logs");
        fs::create_dir_all(&log_dir).with_context(|| format!("could not create {}", log_dir.display()))?;

        let codebases: Vec<Codebase<'_>> = self
            .players
            .iter()
            .chain(self.mirror.iter())
            .map(|p| Codebase {
                name: p.name(),
                sandbox: p.codebase().as_ref(),
            })
            .collect();
        let executor = RoundExecutor::new(self.arena.as_ref(), self.arena_sandbox.as_ref(), &self.constraints);
        let stats = executor.run_round(round, &codebases, &log_dir)?;

        write_json_atomic(&dir.join("results.json"), &stats)?;
        self.metadata.round_stats.insert(round, stats);
        self.metadata.agents = self.players.iter().map(|p| p.record().clone()).collect();
        self.save()?;
        self.next_round = round + 1;

        for player in &self.players {
            player.share_round_logs(&dir, round)?;
        }
        if self.configuration.compress_rounds && round < self.metadata.config.rounds {
            archive_dir(&log_dir)?;
        }
        Ok(())
    }

    fn save(&self) -> anyhow::Result<()> {
        write_json_atomic(&self.output_dir.join(METADATA_FILE), &self.metadata)
            .context("could not write tournament metadata")
    }

    fn end(&mut self, success: bool) -> anyhow::Result<()> {
        let mut first_error = None;
        if success {
            if self.configuration.compress_rounds {
                let final_logs = round_dir(&self.output_dir, self.metadata.config.rounds).join("logs");
                if final_logs.is_dir() {
                    if let Err(e) = archive_dir(&final_logs) {
                        first_error.get_or_insert(e);
                    }
                }
            }
            self.metadata.completed_timestamp = Some(OffsetDateTime::now_utc().unix_timestamp());
        }
        if let Err(e) = self.save() {
            first_error.get_or_insert(e);
        }

        let keep = self.configuration.keep_sandboxes;
        for player in self.players.iter().chain(self.mirror.iter()) {
            if let Err(e) = player.release(keep) {
                warn!("Could not release the sandbox of {}: {e:#}", player.name());
                first_error.get_or_insert(e);
            }
        }
        if !keep {
            if let Err(e) = self.arena_sandbox.destroy() {
                warn!("Could not release the arena sandbox: {e}");
                first_error.get_or_insert(e.into());
            }
        }

        if success && first_error.is_none() {
            if let Some(sync) = &self.remote_sync {
                if let Err(e) = sync.sync(&self.output_dir) {
                    first_error.get_or_insert(e);
                }
            }
            let wins = self
                .metadata
                .round_stats
                .values()
                .fold(BTreeMap::<&str, usize>::new(), |mut wins, stats| {
                    *wins.entry(stats.winner.as_str()).or_default() += 1;
                    wins
                });
            info!("Tournament {} complete. Round wins: {wins:?}", self.metadata.tournament_id);
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Archive the logs of completed rounds left unarchived by a crash and drop the folders of
/// rounds that never completed.
fn clean_rounds(
    output_dir: &Path,
    metadata: &TournamentMetadata,
    configuration: &Configuration,
) -> anyhow::Result<()> {
    let rounds_dir = output_dir.join("rounds");
    if !rounds_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&rounds_dir)? {
        let path = entry?.path();
        let Some(round) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if !metadata.round_stats.contains_key(&round) {
            warn!("Discarding the incomplete round {round}");
            fs::remove_dir_all(&path)?;
            continue;
        }
        let logs = path.join("logs");
        if configuration.compress_rounds && round < metadata.config.rounds && logs.is_dir() {
            archive_dir(&logs)?;
        }
    }
    Ok(())
}
