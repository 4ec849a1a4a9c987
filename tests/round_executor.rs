mod common;

use code_tournament::{
    arena::{Arena, Codebase},
    round_executor::{RoundExecutor, NO_REASON},
    round_stats::RESULT_TIE,
    sandbox::{Sandbox, SandboxFactory},
};
use common::{constraints, files_in, Script, ScriptedArena, Workspace};

fn alice_six_of_ten(index: usize) -> &'static str {
    if index < 6 {
        "alice"
    } else {
        "bob"
    }
}

fn alice_always(_: usize) -> &'static str {
    "alice"
}

struct Setup {
    ws: Workspace,
    arena_sandbox: std::sync::Arc<dyn Sandbox>,
    alice: std::sync::Arc<dyn Sandbox>,
    bob: std::sync::Arc<dyn Sandbox>,
}

fn setup() -> Setup {
    let ws = Workspace::new(1);
    let factory = ws.factory();
    Setup {
        arena_sandbox: factory.create("arena").unwrap(),
        alice: factory.create("alice").unwrap(),
        bob: factory.create("bob").unwrap(),
        ws,
    }
}

impl Setup {
    fn play(&self, arena: &dyn Arena) -> anyhow::Result<code_tournament::round_stats::RoundStats> {
        let constraints = constraints();
        let codebases = [
            Codebase { name: "alice", sandbox: self.alice.as_ref() },
            Codebase { name: "bob", sandbox: self.bob.as_ref() },
        ];
        RoundExecutor::new(arena, self.arena_sandbox.as_ref(), &constraints).run_round(
            1,
            &codebases,
            &self.ws.output().join("logs"),
        )
    }
}

#[test]
fn scores_follow_simulation_wins() {
    let setup = setup();
    let arena = ScriptedArena::new(10, Script::ByIndex(alice_six_of_ten));
    let stats = setup.play(&arena).unwrap();

    assert_eq!(stats.winner, "alice");
    assert_eq!(stats.scores["alice"], 6.0);
    assert_eq!(stats.scores["bob"], 4.0);
    assert!(stats.player_stats["alice"].valid_submit);
    assert!(stats.player_stats["bob"].valid_submit);
    assert_eq!(files_in(&setup.ws.output().join("logs")).len(), 10);
}

#[test]
fn a_lone_valid_submission_takes_the_pool() {
    let setup = setup();
    setup.bob.execute_checked("rm bot.txt", None, None).unwrap();
    let arena = ScriptedArena::new(10, Script::ByIndex(alice_six_of_ten));
    let stats = setup.play(&arena).unwrap();

    assert_eq!(stats.winner, "alice");
    assert_eq!(stats.scores["alice"], 10.0);
    assert_eq!(stats.scores["bob"], 0.0);
    assert!(!stats.player_stats["bob"].valid_submit);
    assert!(stats.player_stats["bob"].invalid_reason.contains("bot.txt"));
}

#[test]
fn no_valid_submission_is_an_even_tie() {
    let setup = setup();
    setup.alice.execute_checked("rm bot.txt", None, None).unwrap();
    setup.bob.execute_checked("rm bot.txt", None, None).unwrap();
    let arena = ScriptedArena::new(10, Script::ByIndex(alice_always));
    let stats = setup.play(&arena).unwrap();

    assert_eq!(stats.winner, RESULT_TIE);
    assert_eq!(stats.scores["alice"], 5.0);
    assert_eq!(stats.scores["bob"], 5.0);
}

#[test]
fn hanging_validation_rejects_the_submission() {
    let setup = setup();
    setup.bob.execute_checked("echo slow > bot.txt", None, None).unwrap();
    let arena = ScriptedArena::new(4, Script::ByIndex(alice_always));
    let stats = setup.play(&arena).unwrap();

    assert_eq!(stats.winner, "alice");
    assert!(!stats.player_stats["bob"].valid_submit);
    assert!(stats.player_stats["bob"].invalid_reason.contains("timed out"));
}

#[test]
fn rejections_always_carry_a_reason() {
    let setup = setup();
    setup.bob.execute_checked("echo mute > bot.txt", None, None).unwrap();
    let arena = ScriptedArena::new(4, Script::ByIndex(alice_always));
    let stats = setup.play(&arena).unwrap();

    assert_eq!(stats.winner, "alice");
    assert!(!stats.player_stats["bob"].valid_submit);
    assert_eq!(stats.player_stats["bob"].invalid_reason, NO_REASON);
}

#[test]
fn timed_out_simulations_award_nothing() {
    fn sleepy(index: usize) -> &'static str {
        match index {
            0 | 1 => "SLEEP",
            2 => "bob",
            _ => "alice",
        }
    }
    let setup = setup();
    let arena = ScriptedArena::new(5, Script::ByIndex(sleepy));
    let stats = setup.play(&arena).unwrap();

    assert_eq!(stats.scores["alice"], 2.0);
    assert_eq!(stats.scores["bob"], 1.0);
    assert_eq!(stats.winner, "alice");
    assert!(stats.details.iter().any(|d| d.contains("timed out")));
}

#[test]
fn duplicate_names_are_rejected() {
    let setup = setup();
    let constraints = constraints();
    let arena = ScriptedArena::new(2, Script::ByIndex(alice_always));
    let codebases = [
        Codebase { name: "alice", sandbox: setup.alice.as_ref() },
        Codebase { name: "alice", sandbox: setup.bob.as_ref() },
    ];
    let result = RoundExecutor::new(&arena, setup.arena_sandbox.as_ref(), &constraints).run_round(
        0,
        &codebases,
        &setup.ws.output().join("logs"),
    );
    assert!(result.is_err());
}
