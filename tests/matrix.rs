mod common;

use code_tournament::{
    configuration::{AgentConfig, ArenaConfig, PlayerConfig, TournamentConfig, TournamentMode},
    matrix::{MatrixCache, MatrixEvaluator, MatrixOptions},
    persistence::{read_json, write_json_atomic},
    round_stats::RESULT_TIE,
    tournament::{Tournament, TournamentMetadata, METADATA_FILE},
};
use common::{configuration, constraints, has_git, Script, ScriptedArena, Workspace};

fn play_tournament(ws: &Workspace) {
    let config = TournamentConfig {
        mode: TournamentMode::Pvp,
        rounds: 1,
        transparent: false,
        push_remote: None,
        arena: ArenaConfig {
            name: "Scripted".to_string(),
            sims_per_round: 2,
            args: Default::default(),
        },
        players: vec![
            PlayerConfig::new(
                "alice",
                AgentConfig::Command {
                    command: "echo 5 > bot.txt".to_string(),
                    timeout_secs: None,
                },
            ),
            PlayerConfig::new("bob", AgentConfig::Idle),
        ],
    };
    Tournament::new_with_arena(
        config,
        ScriptedArena::boxed(2, Script::Strongest),
        &ws.factory(),
        &ws.output(),
        configuration(),
        constraints(),
    )
    .unwrap()
    .run()
    .unwrap();
}

fn evaluator<'a>(ws: &Workspace, factory: &'a dyn code_tournament::sandbox::SandboxFactory) -> MatrixEvaluator<'a> {
    MatrixEvaluator::open_with_arena(
        &ws.output(),
        ScriptedArena::boxed(2, Script::Strongest),
        factory,
        configuration(),
        constraints(),
        MatrixOptions::default(),
    )
    .unwrap()
}

#[test]
fn matrix_is_evaluated_once_and_cached() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    play_tournament(&ws);
    let factory = ws.factory();

    let first = evaluator(&ws, &factory);
    let report = first.run().unwrap();
    assert_eq!(report.evaluated, 6);
    assert_eq!(report.skipped, 0);
    assert!(report.failed.is_empty());

    let cache: MatrixCache = read_json(&first.cache_path()).unwrap();
    assert_eq!(cache.len(), 6);
    assert!(cache.metadata.completed_timestamp.is_some());
    assert_eq!(cache.get("alice_vs_bob", 1, 0).unwrap().winner, "alice");
    assert_eq!(cache.get("alice_vs_bob", 0, 0).unwrap().winner, RESULT_TIE);
    assert_eq!(cache.get("alice_vs_bob", 0, 1).unwrap().winner, RESULT_TIE);
    assert_eq!(cache.get("alice_vs_alice", 1, 0).unwrap().winner, "alice_1");
    assert_eq!(cache.get("bob_vs_bob", 1, 0).unwrap().winner, RESULT_TIE);
    assert!(cache.get("alice_vs_alice", 0, 1).is_none());

    let second = evaluator(&ws, &factory);
    let report = second.run().unwrap();
    assert_eq!(report.evaluated, 0);
    assert_eq!(report.skipped, 6);
    let again: MatrixCache = read_json(&second.cache_path()).unwrap();
    assert_eq!(again.matrices, cache.matrices);
}

#[test]
fn cache_from_another_repetition_count_is_refused() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    play_tournament(&ws);
    let factory = ws.factory();
    let options = MatrixOptions {
        cross_play: false,
        ..Default::default()
    };
    MatrixEvaluator::open_with_arena(
        &ws.output(),
        ScriptedArena::boxed(2, Script::Strongest),
        &factory,
        configuration(),
        constraints(),
        options.clone(),
    )
    .unwrap()
    .run()
    .unwrap();

    let other = MatrixEvaluator::open_with_arena(
        &ws.output(),
        ScriptedArena::boxed(4, Script::Strongest),
        &factory,
        configuration(),
        constraints(),
        options,
    )
    .unwrap();
    assert!(other.run().is_err());
}

#[test]
fn failed_materialization_releases_every_sandbox() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    play_tournament(&ws);
    let sandboxes = ws.dir.path().join("sandboxes");
    assert_eq!(common::files_in(&sandboxes).len(), 0);

    // alice at round 0 is rebuilt first, then her round 1 diff cannot be applied
    let path = ws.output().join(METADATA_FILE);
    let mut metadata: TournamentMetadata = read_json(&path).unwrap();
    let alice = metadata.agents.iter_mut().find(|a| a.name == "alice").unwrap();
    alice.diff.insert(1, "not a patch\n".to_string());
    write_json_atomic(&path, &metadata).unwrap();

    let factory = ws.factory();
    let err = evaluator(&ws, &factory).run().unwrap_err();
    assert!(format!("{err:#}").contains("could not rebuild alice at round 1"));
    assert_eq!(common::files_in(&sandboxes), Vec::<String>::new());
}
