//! Offline cross-evaluation of the round snapshots of a finished tournament.
//!
//! Every historical codebase is rebuilt from its persisted diff, then every cell of every
//! matrix is played on a pool of arena sandboxes. Results are cached in
//! `<tournament>/matrix_eval/matrix.json`, rewritten after each cell, so an interrupted
//! evaluation resumes where it stopped and a finished one is never replayed.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    arena::{get_arena, Arena, Codebase},
    configuration::Configuration,
    constraints::Constraints,
    logger::TournamentLogger,
    persistence::{read_json, write_json_atomic, RemoteSync},
    pool::ResourcePool,
    round_executor::RoundExecutor,
    round_stats::RoundStats,
    sandbox::{Sandbox, SandboxFactory, SandboxGuard},
    snapshot::{GitSnapshotStore, SnapshotStore},
    tournament::{TournamentMetadata, METADATA_FILE},
};

/// Directory of the evaluation inside the tournament directory.
pub const MATRIX_DIR: &str = "matrix_eval";
/// Cache file name inside [`MATRIX_DIR`].
pub const CACHE_FILE: &str = "matrix.json";

/// What to evaluate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixOptions {
    /// Simulations per cell. `None` keeps the tournament's `sims_per_round`.
    pub repetitions: Option<usize>,
    /// Arena sandboxes playing cells concurrently. `None` uses the matrix workers constraint.
    pub workers: Option<usize>,
    /// Evaluate every player's rounds against its own other rounds.
    pub self_play: bool,
    /// Evaluate every pair of distinct players over all their rounds.
    pub cross_play: bool,
}

impl Default for MatrixOptions {
    fn default() -> Self {
        Self {
            repetitions: None,
            workers: None,
            self_play: true,
            cross_play: true,
        }
    }
}

/// Description of an evaluation, stored beside its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixMetadata {
    /// Tournament directory the snapshots come from.
    pub source_dir: String,
    /// Tournament id.
    pub tournament_id: String,
    /// Players in metadata order.
    pub players: Vec<String>,
    /// Last round of the evaluated grid.
    pub rounds: usize,
    /// Simulations per cell.
    pub repetitions: usize,
    /// Unix time of the first evaluation.
    pub created_timestamp: i64,
    /// Unix time of the last evaluation that left no cell missing.
    #[serde(default)]
    pub completed_timestamp: Option<i64>,
}

/// On-disk cache: `matrices[id][row round][column round]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixCache {
    /// What was evaluated.
    pub metadata: MatrixMetadata,
    /// Matrix id (`<p1>_vs_<p2>`) to cell results.
    #[serde(default)]
    pub matrices: BTreeMap<String, BTreeMap<usize, BTreeMap<usize, RoundStats>>>,
}

impl MatrixCache {
    /// Cached result of a cell.
    pub fn get(&self, matrix: &str, row: usize, col: usize) -> Option<&RoundStats> {
        self.matrices.get(matrix)?.get(&row)?.get(&col)
    }

    fn insert(&mut self, matrix: &str, row: usize, col: usize, stats: RoundStats) {
        self.matrices
            .entry(matrix.to_string())
            .or_default()
            .entry(row)
            .or_default()
            .insert(col, stats);
    }

    /// Number of cached cells.
    pub fn len(&self) -> usize {
        self.matrices
            .values()
            .flat_map(|rows| rows.values())
            .map(BTreeMap::len)
            .sum()
    }

    /// Whether no cell is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of [`MatrixEvaluator::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixReport {
    /// Cells played by this run.
    pub evaluated: usize,
    /// Cells found in the cache.
    pub skipped: usize,
    /// Cells that could not be played, with the reason. They stay out of the cache.
    pub failed: Vec<String>,
}

/// One snapshot: a player at the end of a round.
type SnapshotKey = (String, usize);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cell {
    matrix: String,
    row: usize,
    col: usize,
    row_player: String,
    col_player: String,
    row_name: String,
    col_name: String,
}

fn matrix_id(p1: &str, p2: &str) -> String {
    format!("{p1}_vs_{p2}")
}

/// Every cell the options ask for, in a stable order.
fn plan_cells(players: &[String], rounds: usize, options: &MatrixOptions) -> Vec<Cell> {
    let mut cells = Vec::new();
    if options.self_play {
        for p in players {
            for row in 0..=rounds {
                for col in 0..row {
                    cells.push(Cell {
                        matrix: matrix_id(p, p),
                        row,
                        col,
                        row_player: p.clone(),
                        col_player: p.clone(),
                        row_name: format!("{p}_1"),
                        col_name: format!("{p}_2"),
                    });
                }
            }
        }
    }
    if options.cross_play {
        for (i, p1) in players.iter().enumerate() {
            for p2 in &players[i + 1..] {
                for row in 0..=rounds {
                    for col in 0..=rounds {
                        cells.push(Cell {
                            matrix: matrix_id(p1, p2),
                            row,
                            col,
                            row_player: p1.clone(),
                            col_player: p2.clone(),
                            row_name: p1.clone(),
                            col_name: p2.clone(),
                        });
                    }
                }
            }
        }
    }
    cells
}

/// Cross-evaluates the snapshots of one tournament.
pub struct MatrixEvaluator<'a> {
    source_dir: PathBuf,
    output_dir: PathBuf,
    tournament: TournamentMetadata,
    arena: Box<dyn Arena>,
    factory: &'a dyn SandboxFactory,
    configuration: Configuration,
    constraints: Constraints,
    options: MatrixOptions,
    logger: TournamentLogger,
    remote_sync: Option<Box<dyn RemoteSync>>,
}

impl std::fmt::Debug for MatrixEvaluator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixEvaluator")
            .field("source_dir", &self.source_dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<'a> MatrixEvaluator<'a> {
    /// Evaluator for the tournament stored in `source_dir`, playing its own arena.
    pub fn open(
        source_dir: &Path,
        factory: &'a dyn SandboxFactory,
        configuration: Configuration,
        constraints: Constraints,
        options: MatrixOptions,
    ) -> anyhow::Result<Self> {
        let tournament: TournamentMetadata = read_json(&source_dir.join(METADATA_FILE))?;
        let mut arena_config = tournament.config.arena.clone();
        if let Some(repetitions) = options.repetitions {
            arena_config.sims_per_round = repetitions;
        }
        let arena = get_arena(&arena_config)?;
        Self::open_with_arena(source_dir, arena, factory, configuration, constraints, options)
    }

    /// Like [`MatrixEvaluator::open`], with an arena that is not looked up by name. The arena's
    /// `sims_per_round` is the number of simulations per cell.
    pub fn open_with_arena(
        source_dir: &Path,
        arena: Box<dyn Arena>,
        factory: &'a dyn SandboxFactory,
        configuration: Configuration,
        constraints: Constraints,
        options: MatrixOptions,
    ) -> anyhow::Result<Self> {
        let tournament: TournamentMetadata = read_json(&source_dir.join(METADATA_FILE))?;
        if tournament.agents.is_empty() {
            bail!("{} lists no players", source_dir.display());
        }
        let output_dir = source_dir.join(MATRIX_DIR);
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("could not create {}", output_dir.display()))?;
        let logger = if configuration.log {
            TournamentLogger::new(Some(&output_dir.join("matrix.log")), configuration.verbose)?
        } else if configuration.verbose {
            TournamentLogger::new(None, true)?
        } else {
            TournamentLogger::disabled()
        };
        Ok(Self {
            source_dir: source_dir.to_path_buf(),
            output_dir,
            tournament,
            arena,
            factory,
            configuration,
            constraints,
            options,
            logger,
            remote_sync: None,
        })
    }

    /// Upload the evaluation directory with `sync` once every cell is cached.
    pub fn with_remote_sync(mut self, sync: Box<dyn RemoteSync>) -> Self {
        self.remote_sync = Some(sync);
        self
    }

    /// Path of the cache file.
    pub fn cache_path(&self) -> PathBuf {
        self.output_dir.join(CACHE_FILE)
    }

    fn players(&self) -> Vec<String> {
        self.tournament.agents.iter().map(|a| a.name.clone()).collect()
    }

    /// Last round every player has a diff for.
    fn rounds(&self) -> usize {
        self.tournament
            .agents
            .iter()
            .map(|a| a.diff.keys().next_back().copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    fn load_cache(&self) -> anyhow::Result<MatrixCache> {
        let path = self.cache_path();
        let metadata = MatrixMetadata {
            source_dir: self.source_dir.display().to_string(),
            tournament_id: self.tournament.tournament_id.clone(),
            players: self.players(),
            rounds: self.rounds(),
            repetitions: self.arena.sims_per_round(),
            created_timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            completed_timestamp: None,
        };
        if !path.exists() {
            return Ok(MatrixCache {
                metadata,
                matrices: BTreeMap::new(),
            });
        }
        let cache: MatrixCache = read_json(&path)?;
        if cache.metadata.tournament_id != metadata.tournament_id {
            bail!(
                "{} belongs to tournament {}",
                path.display(),
                cache.metadata.tournament_id
            );
        }
        if cache.metadata.repetitions != metadata.repetitions {
            bail!(
                "{} was computed with {} simulations per cell, not {}",
                path.display(),
                cache.metadata.repetitions,
                metadata.repetitions
            );
        }
        Ok(cache)
    }

    /// Evaluate every cell missing from the cache.
    pub fn run(&self) -> anyhow::Result<MatrixReport> {
        self.logger.in_scope(|| self.evaluate())
    }

    #[instrument(skip_all, fields(tournament = %self.tournament.tournament_id))]
    fn evaluate(&self) -> anyhow::Result<MatrixReport> {
        let mut cache = self.load_cache()?;
        let cells = plan_cells(&self.players(), self.rounds(), &self.options);
        let (cached, pending): (Vec<Cell>, Vec<Cell>) = cells
            .into_iter()
            .partition(|c| cache.get(&c.matrix, c.row, c.col).is_some());
        let mut report = MatrixReport {
            skipped: cached.len(),
            ..Default::default()
        };
        info!("{} cells cached, {} to evaluate", cached.len(), pending.len());

        if !pending.is_empty() {
            // snapshots and arena sandboxes are released when this block ends
            let mut guard = SandboxGuard::new(self.configuration.keep_sandboxes);
            let snapshots = self.materialize(&pending, &mut guard)?;
            let workers = self
                .options
                .workers
                .unwrap_or(self.constraints.matrix_workers())
                .clamp(1, pending.len());
            let mut slots = Vec::with_capacity(workers);
            for i in 0..workers {
                slots.push(guard.track(self.factory.create(&format!("matrix_arena_{i}"))?));
            }
            let mut pool = ResourcePool::new(slots);

            let cache_path = self.cache_path();
            let shared = Mutex::new(cache);
            let results = pool.run(pending.clone(), |arena_sandbox: &mut Arc<dyn Sandbox>, cell: Cell| {
                let stats = self.play_cell(arena_sandbox.as_ref(), &snapshots, &cell)?;
                let mut cache = shared
                    .lock()
                    .map_err(|_| anyhow!("matrix cache lock poisoned"))?;
                cache.insert(&cell.matrix, cell.row, cell.col, stats);
                write_json_atomic(&cache_path, &*cache)
            });
            cache = shared
                .into_inner()
                .map_err(|_| anyhow!("matrix cache lock poisoned"))?;

            for (cell, result) in pending.iter().zip(results) {
                match result {
                    Ok(()) => report.evaluated += 1,
                    Err(reason) => report.failed.push(format!(
                        "{} [{}][{}]: {reason}",
                        cell.matrix, cell.row, cell.col
                    )),
                }
            }
            debug!("Releasing {} sandboxes", guard.len());
        }

        if report.failed.is_empty() {
            cache.metadata.completed_timestamp = Some(OffsetDateTime::now_utc().unix_timestamp());
        }
        write_json_atomic(&self.cache_path(), &cache)?;
        info!(
            "Matrix evaluation done: {} evaluated, {} cached, {} failed",
            report.evaluated,
            report.skipped,
            report.failed.len()
        );
        if report.failed.is_empty() {
            if let Some(sync) = &self.remote_sync {
                sync.sync(&self.output_dir)?;
            }
        }
        Ok(report)
    }

    /// One sandbox per snapshot the pending cells need, reset to that snapshot.
    fn materialize(
        &self,
        pending: &[Cell],
        guard: &mut SandboxGuard,
    ) -> anyhow::Result<HashMap<SnapshotKey, Arc<dyn Sandbox>>> {
        let needed: BTreeSet<SnapshotKey> = pending
            .iter()
            .flat_map(|c| [(c.row_player.clone(), c.row), (c.col_player.clone(), c.col)])
            .collect();
        let mut snapshots = HashMap::with_capacity(needed.len());
        for (player, round) in needed {
            let record = self
                .tournament
                .agents
                .iter()
                .find(|a| a.name == player)
                .with_context(|| format!("no record for {player}"))?;
            let patch = record
                .diff
                .get(&round)
                .with_context(|| format!("no diff recorded for {player} in round {round}"))?;
            let sandbox = guard.track(self.factory.create(&format!("{player}_r{round}"))?);
            let mut store = GitSnapshotStore::new(Arc::clone(&sandbox), &format!("matrix-{player}"));
            store.initialize(&record.branch_name, record.config.branch_init.as_deref())?;
            store
                .reset_and_apply(patch, None)
                .with_context(|| format!("could not rebuild {player} at round {round}"))?;
            debug!("Materialized {player} at round {round}");
            snapshots.insert((player, round), sandbox);
        }
        Ok(snapshots)
    }

    fn play_cell(
        &self,
        arena_sandbox: &dyn Sandbox,
        snapshots: &HashMap<SnapshotKey, Arc<dyn Sandbox>>,
        cell: &Cell,
    ) -> anyhow::Result<RoundStats> {
        let lookup = |player: &str, round: usize| {
            snapshots
                .get(&(player.to_string(), round))
                .with_context(|| format!("{player} at round {round} was not materialized"))
        };
        let row = lookup(&cell.row_player, cell.row)?;
        let col = lookup(&cell.col_player, cell.col)?;
        let codebases = [
            Codebase {
                name: &cell.row_name,
                sandbox: row.as_ref(),
            },
            Codebase {
                name: &cell.col_name,
                sandbox: col.as_ref(),
            },
        ];
        let log_dir = self
            .output_dir
            .join("rounds")
            .join(Uuid::new_v4().to_string())
            .join("logs");
        let executor = RoundExecutor::new(self.arena.as_ref(), arena_sandbox, &self.constraints);
        let stats = executor.run_round(cell.row, &codebases, &log_dir)?;
        info!(
            "{} [{}][{}]: winner {}",
            cell.matrix, cell.row, cell.col, stats.winner
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn self_play_covers_the_strict_lower_triangle() {
        let options = MatrixOptions {
            cross_play: false,
            ..Default::default()
        };
        let cells = plan_cells(&names(&["a"]), 3, &options);
        assert_eq!(cells.len(), 6);
        assert!(cells.iter().all(|c| c.row > c.col));
        assert!(cells.iter().all(|c| c.row_name == "a_1" && c.col_name == "a_2"));
        assert!(cells.iter().all(|c| c.matrix == "a_vs_a"));
    }

    #[test]
    fn cross_play_covers_every_pair_and_round() {
        let options = MatrixOptions {
            self_play: false,
            ..Default::default()
        };
        let cells = plan_cells(&names(&["a", "b", "c"]), 1, &options);
        assert_eq!(cells.len(), 3 * 4);
        let ids: BTreeSet<&str> = cells.iter().map(|c| c.matrix.as_str()).collect();
        assert_eq!(ids, BTreeSet::from(["a_vs_b", "a_vs_c", "b_vs_c"]));
    }

    #[test]
    fn cache_counts_cells() {
        let mut cache = MatrixCache {
            metadata: MatrixMetadata {
                source_dir: "/t".into(),
                tournament_id: "t".into(),
                players: names(&["a", "b"]),
                rounds: 1,
                repetitions: 3,
                created_timestamp: 0,
                completed_timestamp: None,
            },
            matrices: BTreeMap::new(),
        };
        assert!(cache.is_empty());
        cache.insert("a_vs_b", 1, 0, RoundStats::new(1, &["a", "b"]));
        cache.insert("a_vs_b", 1, 1, RoundStats::new(1, &["a", "b"]));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a_vs_b", 1, 0).is_some());
        assert!(cache.get("a_vs_b", 0, 1).is_none());

        let json = serde_json::to_string(&cache).unwrap();
        let back: MatrixCache = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cache);
    }
}
