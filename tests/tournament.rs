mod common;

use std::{fs, sync::Arc};

use code_tournament::{
    agent::{STATUS_ERROR, STATUS_SUBMITTED},
    configuration::{
        AgentConfig, ArenaConfig, PlayerConfig, TournamentConfig, TournamentMode, MIRROR_PLAYER,
    },
    persistence::{read_json, write_json_atomic},
    round_stats::RESULT_TIE,
    sandbox::{Sandbox, SandboxFactory},
    tournament::{round_dir, Tournament, TournamentMetadata, METADATA_FILE},
};
use common::{configuration, constraints, has_git, Script, ScriptedArena, Workspace};

const SIMS: usize = 3;

fn command(command: &str) -> AgentConfig {
    AgentConfig::Command {
        command: command.to_string(),
        timeout_secs: None,
    }
}

fn config(mode: TournamentMode, rounds: usize, players: Vec<PlayerConfig>) -> TournamentConfig {
    TournamentConfig {
        mode,
        rounds,
        transparent: false,
        push_remote: None,
        arena: ArenaConfig {
            name: "Scripted".to_string(),
            sims_per_round: SIMS,
            args: Default::default(),
        },
        players,
    }
}

fn start(ws: &Workspace, config: TournamentConfig) -> Tournament {
    Tournament::new_with_arena(
        config,
        ScriptedArena::boxed(SIMS, Script::Strongest),
        &ws.factory(),
        &ws.output(),
        configuration(),
        constraints(),
    )
    .unwrap()
}

fn record<'a>(metadata: &'a TournamentMetadata, name: &str) -> &'a code_tournament::player::PlayerRecord {
    metadata.agents.iter().find(|a| a.name == name).unwrap()
}

fn pvp_config() -> TournamentConfig {
    config(
        TournamentMode::Pvp,
        2,
        vec![
            PlayerConfig::new("alice", command("echo 5 > bot.txt")),
            PlayerConfig::new("bob", AgentConfig::Idle),
        ],
    )
}

#[test]
fn pvp_tournament_persists_every_round() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let metadata = start(&ws, pvp_config()).run().unwrap();

    assert_eq!(metadata.round_stats.len(), 3);
    assert_eq!(metadata.round_stats[&0].winner, RESULT_TIE);
    assert_eq!(metadata.round_stats[&1].winner, "alice");
    assert_eq!(metadata.round_stats[&1].scores["alice"], SIMS as f64);
    assert_eq!(metadata.round_stats[&2].winner, "alice");
    assert!(metadata.completed_timestamp.is_some());

    let alice = record(&metadata, "alice");
    assert!(alice.diff[&1].contains("+5"));
    assert_eq!(alice.incremental_diff[&2], "");
    assert_eq!(alice.agent_stats[&1].exit_status, STATUS_SUBMITTED);
    assert_eq!(alice.round_tags.len(), 3);
    assert_eq!(record(&metadata, "bob").diff[&1], "");

    let output = ws.output();
    for round in 0..=2 {
        let dir = round_dir(&output, round);
        assert!(dir.join("results.json").is_file());
        assert!(dir.join("logs.tar.gz").is_file());
        assert!(!dir.join("logs").exists());
    }
    let changes = fs::read_to_string(output.join("players/alice/changes_r1.json")).unwrap();
    assert!(changes.contains("full_diff"));
    assert!(output.join("tournament.log").is_file());

    let persisted: TournamentMetadata = read_json(&output.join(METADATA_FILE)).unwrap();
    assert_eq!(persisted, metadata);
}

#[test]
fn existing_output_is_not_overwritten() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    start(&ws, pvp_config()).run().unwrap();
    let again = Tournament::new_with_arena(
        pvp_config(),
        ScriptedArena::boxed(SIMS, Script::Strongest),
        &ws.factory(),
        &ws.output(),
        configuration(),
        constraints(),
    );
    assert!(again.is_err());
}

#[test]
fn resume_replays_rounds_after_the_last_completed_one() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let output = ws.output();
    start(&ws, pvp_config()).run().unwrap();

    // pretend the run crashed during round 2
    let path = output.join(METADATA_FILE);
    let mut metadata: TournamentMetadata = read_json(&path).unwrap();
    metadata.round_stats.remove(&2);
    metadata.completed_timestamp = None;
    write_json_atomic(&path, &metadata).unwrap();

    let tournament = Tournament::resume_with_arena(
        &output,
        ScriptedArena::boxed(SIMS, Script::Strongest),
        &ws.factory(),
        configuration(),
        constraints(),
    )
    .unwrap();
    assert_eq!(tournament.next_round(), 2);
    assert!(!round_dir(&output, 2).exists());

    let metadata = tournament.run().unwrap();
    assert_eq!(metadata.round_stats.len(), 3);
    assert_eq!(metadata.round_stats[&2].winner, "alice");
    assert!(metadata.completed_timestamp.is_some());
    assert!(round_dir(&output, 2).join("results.json").is_file());
}

#[test]
fn completed_tournaments_cannot_be_resumed() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    start(&ws, pvp_config()).run().unwrap();
    let resumed = Tournament::resume_with_arena(
        &ws.output(),
        ScriptedArena::boxed(SIMS, Script::Strongest),
        &ws.factory(),
        configuration(),
        constraints(),
    );
    assert!(resumed.is_err());
}

#[test]
fn single_player_faces_its_previous_round() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let config = config(
        TournamentMode::SinglePlayer,
        2,
        vec![PlayerConfig::new(
            "alice",
            command("n=$(cat bot.txt); echo $((n + 1)) > bot.txt"),
        )],
    );
    let metadata = start(&ws, config).run().unwrap();

    assert_eq!(metadata.round_stats[&0].winner, RESULT_TIE);
    for round in 1..=2 {
        let stats = &metadata.round_stats[&round];
        assert_eq!(stats.winner, "alice");
        assert!(stats.scores.contains_key(MIRROR_PLAYER));
        assert_eq!(stats.scores[MIRROR_PLAYER], 0.0);
    }
    assert_eq!(metadata.agents.len(), 1);
}

#[test]
fn transparent_players_see_their_opponents() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let mut config = config(
        TournamentMode::Pvp,
        2,
        vec![
            PlayerConfig::new("alice", command("echo 7 > bot.txt")),
            PlayerConfig::new("bob", command("cp ../opponents/alice/bot.txt bot.txt")),
        ],
    );
    config.transparent = true;
    let metadata = start(&ws, config).run().unwrap();

    // bob copies what alice had before the edit phase
    assert_eq!(metadata.round_stats[&1].winner, "alice");
    assert_eq!(metadata.round_stats[&2].winner, RESULT_TIE);
    assert!(record(&metadata, "bob").diff[&2].contains("+7"));
}

#[test]
fn failing_agents_do_not_stop_the_tournament() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let config = config(
        TournamentMode::Pvp,
        1,
        vec![
            PlayerConfig::new("alice", command("echo broken; exit 3")),
            PlayerConfig::new("bob", AgentConfig::Idle),
        ],
    );
    let metadata = start(&ws, config).run().unwrap();

    let outcome = &record(&metadata, "alice").agent_stats[&1];
    assert_eq!(outcome.exit_status, STATUS_ERROR);
    assert!(outcome.result.contains("exit code 3"));
    assert_eq!(metadata.round_stats[&1].winner, RESULT_TIE);
    assert!(metadata.completed_timestamp.is_some());
}

/// Refuses to create the sandbox of one player.
struct RefusingFactory<F> {
    inner: F,
    refused: &'static str,
}

impl<F: SandboxFactory> SandboxFactory for RefusingFactory<F> {
    fn create(&self, name: &str) -> anyhow::Result<Arc<dyn Sandbox>> {
        if name == self.refused {
            anyhow::bail!("no room for {name}");
        }
        self.inner.create(name)
    }
}

#[test]
fn failed_setup_releases_created_sandboxes() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let factory = RefusingFactory {
        inner: ws.factory(),
        refused: "bob",
    };
    let err = Tournament::new_with_arena(
        pvp_config(),
        ScriptedArena::boxed(SIMS, Script::Strongest),
        &factory,
        &ws.output(),
        configuration(),
        constraints(),
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("no room for bob"));
    assert_eq!(common::files_in(&ws.dir.path().join("sandboxes")), Vec::<String>::new());
    assert!(!ws.output().join(METADATA_FILE).exists());
}
