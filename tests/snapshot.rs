mod common;

use std::sync::Arc;

use code_tournament::{
    sandbox::SandboxFactory,
    snapshot::{GitSnapshotStore, SnapshotStore},
};
use common::{has_git, Workspace};

#[test]
fn diffs_rebuild_a_codebase_without_binaries() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let factory = ws.factory();

    let source = factory.create("source").unwrap();
    let mut store = GitSnapshotStore::new(Arc::clone(&source), "source");
    let initial = store.initialize("history", None).unwrap();
    store.tag_round(0).unwrap();
    source
        .execute_checked("echo 9 > bot.txt && mkdir -p src && echo 'fn main() {}' > src/main.rs", None, None)
        .unwrap();
    source.execute_checked("printf '\\000\\001\\002' > blob.bin", None, None).unwrap();
    store.commit("Round 1 Update").unwrap();
    store.tag_round(1).unwrap();
    assert!(store.has_round(1));
    assert_ne!(store.head().unwrap(), initial);

    let diff = store.diff(0, 1).unwrap();
    assert!(diff.contains("+9"));
    assert!(diff.contains("blob.bin"));
    assert_eq!(store.diff(1, 1).unwrap(), "");

    let target = factory.create("target").unwrap();
    let mut rebuilt = GitSnapshotStore::new(Arc::clone(&target), "target");
    rebuilt.initialize("history", None).unwrap();
    rebuilt.reset_and_apply(&diff, None).unwrap();

    assert_eq!(target.execute_checked("cat bot.txt", None, None).unwrap().output, "9\n");
    assert!(target.execute("test -f src/main.rs", None, None).unwrap().success());
    assert!(!target.execute("test -e blob.bin", None, None).unwrap().success());
}

#[test]
fn reset_discards_uncommitted_work() {
    if !has_git() {
        return;
    }
    let ws = Workspace::new(1);
    let sandbox = ws.factory().create("codebase").unwrap();
    let mut store = GitSnapshotStore::new(Arc::clone(&sandbox), "codebase");
    let initial = store.initialize("history", None).unwrap();
    sandbox
        .execute_checked("echo 3 > bot.txt && touch stray.txt", None, None)
        .unwrap();

    store.reset_and_apply("", Some(&initial)).unwrap();

    assert_eq!(sandbox.execute_checked("cat bot.txt", None, None).unwrap().output, "1\n");
    assert!(!sandbox.execute("test -e stray.txt", None, None).unwrap().success());
}
