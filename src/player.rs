//! A competitor: one sandbox, one agent and the snapshot history of its codebase.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    agent::{Agent, AgentContext, AgentOutcome, STATUS_ERROR, STATUS_PANICKED},
    configuration::PlayerConfig,
    persistence::write_json_atomic,
    sandbox::{quote, Sandbox, LOG_DIR, WORKDIR},
    snapshot::{filter_binary_sections, modified_code_paths, GitSnapshotStore, SnapshotStore},
};

/// Persisted state of a player, stored in the tournament metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    /// Player name.
    pub name: String,
    /// Identifier that is unique across tournaments, used for snapshot tags.
    pub player_unique_id: String,
    /// Unix time of creation.
    pub created_timestamp: i64,
    /// How the player was configured.
    pub config: PlayerConfig,
    /// First commit of the codebase.
    pub initial_commit_hash: String,
    /// Branch holding the player's history.
    pub branch_name: String,
    /// Snapshot tag of each round.
    #[serde(default)]
    pub round_tags: BTreeMap<usize, String>,
    /// Diff from round 0 to each round.
    #[serde(default)]
    pub diff: BTreeMap<usize, String>,
    /// Diff from the previous round to each round.
    #[serde(default)]
    pub incremental_diff: BTreeMap<usize, String>,
    /// Agent outcome of each edit phase.
    #[serde(default)]
    pub agent_stats: BTreeMap<usize, AgentOutcome>,
}

/// Everything a player needs from the tournament besides its own configuration.
#[derive(Debug, Clone)]
pub struct PlayerSetup {
    /// Context template; player and round fields are filled in by the player.
    pub context: AgentContext,
    /// Host directory receiving `changes_r<round>.json` files.
    pub changes_dir: Option<PathBuf>,
    /// Remote URL template, `{token}` being replaced by `GITHUB_TOKEN`. `None` disables pushing.
    pub push_remote: Option<String>,
}

#[derive(Serialize)]
struct ChangesFile<'a> {
    round: usize,
    full_diff: &'a str,
    incremental_diff: &'a str,
    modified_files: BTreeMap<String, String>,
    timestamp: i64,
}

/// One competitor.
pub struct Player {
    record: PlayerRecord,
    sandbox: Arc<dyn Sandbox>,
    store: Box<dyn SnapshotStore>,
    agent: Box<dyn Agent>,
    context: AgentContext,
    changes_dir: Option<PathBuf>,
    push_remote: Option<String>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("name", &self.record.name)
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

fn resolve_remote(template: Option<&str>) -> anyhow::Result<Option<String>> {
    let Some(template) = template else {
        return Ok(None);
    };
    if !template.contains("{token}") {
        return Ok(Some(template.to_string()));
    }
    let token = match std::env::var("GITHUB_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => bail!("GITHUB_TOKEN environment variable is required to push"),
    };
    Ok(Some(template.replace("{token}", &token)))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Player {
    /// Take ownership of `sandbox`, start the player's branch and snapshot round 0.
    #[instrument(skip_all, fields(player = %config.name))]
    pub fn create(
        config: PlayerConfig,
        sandbox: Arc<dyn Sandbox>,
        agent: Box<dyn Agent>,
        setup: PlayerSetup,
    ) -> anyhow::Result<Player> {
        let unique_id = Uuid::new_v4().to_string();
        let branch_name = format!("{}.{}", setup.context.tournament_id, config.name);
        let push_remote = resolve_remote(setup.push_remote.as_deref())?;
        let mut store = GitSnapshotStore::new(Arc::clone(&sandbox), &unique_id);
        let initial_commit_hash = store
            .initialize(&branch_name, config.branch_init.as_deref())
            .context("could not initialize codebase history")?;
        let tag = store.tag_round(0)?;

        let record = PlayerRecord {
            name: config.name.clone(),
            player_unique_id: unique_id,
            created_timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            config,
            initial_commit_hash,
            branch_name,
            round_tags: BTreeMap::from([(0, tag)]),
            diff: BTreeMap::from([(0, String::new())]),
            incremental_diff: BTreeMap::from([(0, String::new())]),
            agent_stats: BTreeMap::new(),
        };
        info!("Created player on branch {}", record.branch_name);
        Ok(Self::assemble(record, sandbox, Box::new(store), agent, setup, push_remote))
    }

    /// Rebuild a player from its persisted record, in a fresh sandbox, at the end of
    /// `last_round`.
    #[instrument(skip_all, fields(player = %record.name, round = last_round))]
    pub fn restore(
        mut record: PlayerRecord,
        last_round: usize,
        sandbox: Arc<dyn Sandbox>,
        agent: Box<dyn Agent>,
        setup: PlayerSetup,
    ) -> anyhow::Result<Player> {
        let push_remote = resolve_remote(setup.push_remote.as_deref())?;
        let mut store = GitSnapshotStore::new(Arc::clone(&sandbox), &record.player_unique_id);
        record.initial_commit_hash = store
            .initialize(&record.branch_name, record.config.branch_init.as_deref())
            .context("could not initialize codebase history")?;
        store.tag_round(0)?;
        if last_round > 0 {
            let patch = record
                .diff
                .get(&last_round)
                .with_context(|| format!("no diff recorded for round {last_round}"))?
                .clone();
            store.reset_and_apply(&patch, None)?;
            store.commit(&format!("Round {last_round} Update"))?;
            store.tag_round(last_round)?;
        }
        // rounds after the crash point are replayed
        record.diff.retain(|round, _| *round <= last_round);
        record.incremental_diff.retain(|round, _| *round <= last_round);
        record.agent_stats.retain(|round, _| *round <= last_round);
        record.round_tags.retain(|round, _| *round <= last_round);
        info!("Restored player at round {last_round}");
        Ok(Self::assemble(record, sandbox, Box::new(store), agent, setup, push_remote))
    }

    fn assemble(
        record: PlayerRecord,
        sandbox: Arc<dyn Sandbox>,
        store: Box<dyn SnapshotStore>,
        agent: Box<dyn Agent>,
        setup: PlayerSetup,
        push_remote: Option<String>,
    ) -> Player {
        let mut context = setup.context;
        context.player = record.name.clone();
        context.working_dir = sandbox.resolve(WORKDIR);
        context.log_dir = sandbox.resolve(LOG_DIR);
        Player {
            record,
            sandbox,
            store,
            agent,
            context,
            changes_dir: setup.changes_dir,
            push_remote,
        }
    }

    /// Player name.
    pub fn name(&self) -> &str {
        &self.record.name
    }

    /// Persisted state.
    pub fn record(&self) -> &PlayerRecord {
        &self.record
    }

    /// Replace the agent used by later edit phases.
    pub fn set_agent(&mut self, agent: Box<dyn Agent>) {
        self.agent = agent;
    }

    /// The sandbox holding the codebase.
    pub fn codebase(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Advance to `round`. Before round 1 the baseline is guaranteed to be tagged.
    pub fn pre_run_hook(&mut self, round: usize) -> anyhow::Result<()> {
        if round == 1 && !self.store.has_round(0) {
            let tag = self.store.tag_round(0)?;
            self.record.round_tags.insert(0, tag);
        }
        self.context.round = round;
        Ok(())
    }

    /// Let the agent edit the codebase. Its failures are recorded, never returned.
    pub fn run(&mut self, recap: &str) -> AgentOutcome {
        self.context.recap = recap.to_string();
        let round = self.context.round;
        let (agent, context, sandbox) = (&mut self.agent, &self.context, self.sandbox.as_ref());
        let outcome = match catch_unwind(AssertUnwindSafe(|| agent.run(context, sandbox))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => AgentOutcome::failure(STATUS_ERROR, format!("{e:#}")),
            Err(payload) => AgentOutcome::failure(STATUS_PANICKED, panic_message(payload.as_ref())),
        };
        if outcome.failed() {
            warn!(
                "Agent of {} failed in round {round} ({}): {}",
                self.record.name, outcome.exit_status, outcome.result
            );
        }
        self.record.agent_stats.insert(round, outcome.clone());
        outcome
    }

    /// Snapshot the codebase as it was left by the agent and record the round's diffs.
    #[instrument(skip(self), fields(player = %self.record.name))]
    pub fn post_run_hook(&mut self, round: usize) -> anyhow::Result<()> {
        if round == 0 {
            bail!("round 0 is the baseline and is never edited");
        }
        self.store.commit(&format!("Round {round} Update"))?;
        let tag = self.store.tag_round(round)?;
        self.record.round_tags.insert(round, tag);
        let full = self.store.diff(0, round)?;
        let incremental = self.store.diff(round - 1, round)?;
        self.write_changes(round, &full, &incremental)?;
        self.record.diff.insert(round, full);
        self.record.incremental_diff.insert(round, incremental);
        info!("Committed changes for round {round}");
        if self.push_remote.is_some() {
            self.push()?;
        }
        Ok(())
    }

    fn write_changes(&self, round: usize, full: &str, incremental: &str) -> anyhow::Result<()> {
        let Some(dir) = &self.changes_dir else {
            return Ok(());
        };
        let mut modified_files = BTreeMap::new();
        for path in modified_code_paths(&filter_binary_sections(full)) {
            let out = self.sandbox.execute(&format!("cat {}", quote(&path)), None, None)?;
            let content = if out.success() {
                out.output
            } else {
                warn!("File '{path}' not found; recording empty content");
                String::new()
            };
            modified_files.insert(path, content);
        }
        let changes = ChangesFile {
            round,
            full_diff: full,
            incremental_diff: incremental,
            modified_files,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        };
        std::fs::create_dir_all(dir)?;
        write_json_atomic(&dir.join(format!("changes_r{round}.json")), &changes)
    }

    /// Reset to `base` (or the current head) and apply `patch` after removing binary sections.
    pub fn reset_and_apply_patch(&mut self, patch: &str, base: Option<&str>) -> anyhow::Result<()> {
        self.store.reset_and_apply(patch, base)
    }

    /// Publish the player's branch and tags.
    pub fn push(&self) -> anyhow::Result<()> {
        let Some(remote) = &self.push_remote else {
            bail!("no remote configured for {}", self.record.name);
        };
        self.store.publish(remote, &self.record.branch_name)?;
        info!("Pushed history of {} (branch {})", self.record.name, self.record.branch_name);
        Ok(())
    }

    /// Copy a host directory into the sandbox log area under `rounds/<round>`.
    pub fn share_round_logs(&self, host_dir: &std::path::Path, round: usize) -> anyhow::Result<()> {
        self.sandbox
            .copy_in(host_dir, &format!("{LOG_DIR}/rounds/{round}"))
            .with_context(|| format!("could not share round {round} logs with {}", self.name()))
    }

    /// Destroy the sandbox unless `keep` is set.
    pub fn release(&self, keep: bool) -> anyhow::Result<()> {
        if keep {
            info!("Keeping sandbox of {}", self.record.name);
            return Ok(());
        }
        self.sandbox.destroy()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_without_placeholder_needs_no_token() {
        assert_eq!(resolve_remote(None).unwrap(), None);
        assert_eq!(
            resolve_remote(Some("/tmp/remote.git")).unwrap().as_deref(),
            Some("/tmp/remote.git")
        );
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload = catch_unwind(|| panic!("agent exploded")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "agent exploded");
        let payload = catch_unwind(|| panic!("{} exploded", "agent")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "agent exploded");
    }
}
