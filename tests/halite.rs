mod common;

use std::{fs, os::unix::fs::PermissionsExt, thread, time::Duration};

use code_tournament::{
    arena::{Arena, Codebase, Halite, HaliteSettings, Validation},
    constraints::{Constraints, ConstraintsBuilder},
    sandbox::{local::LocalSandboxFactory, SandboxFactory},
};
use common::configuration;

/// Engine stand-in that takes a while and needs the submission to still be there at the end.
const ENGINE: &str = "#!/bin/sh\nsleep 1\ntest -f submission/main.py\n";

fn constraints() -> Constraints {
    ConstraintsBuilder::new()
        .with_command_timeout(Duration::from_secs(30))
        .with_validation_timeout(Duration::from_secs(20))
        .build()
        .unwrap()
}

fn halite_image(dir: &std::path::Path) -> std::path::PathBuf {
    let image = dir.join("image");
    fs::create_dir_all(image.join("submission")).unwrap();
    fs::create_dir_all(image.join("environment")).unwrap();
    fs::write(image.join("submission/main.py"), "print('bot')\n").unwrap();
    let engine = image.join("environment/halite");
    fs::write(&engine, ENGINE).unwrap();
    fs::set_permissions(&engine, fs::Permissions::from_mode(0o755)).unwrap();
    image
}

#[test]
fn one_snapshot_validates_from_several_threads() {
    let dir = tempfile::tempdir().unwrap();
    let constraints = constraints();
    let factory = LocalSandboxFactory::new(
        halite_image(dir.path()),
        dir.path().join("sandboxes"),
        &constraints,
        &configuration(),
    );
    let sandbox = factory.create("alice").unwrap();
    let halite = Halite::new(1, HaliteSettings::default());
    let codebase = Codebase {
        name: "alice",
        sandbox: sandbox.as_ref(),
    };

    assert_eq!(halite.validate(&codebase, &constraints).unwrap(), Validation::Valid);

    let verdicts: Vec<Validation> = thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let (halite, codebase, constraints) = (&halite, &codebase, &constraints);
                s.spawn(move || {
                    thread::sleep(Duration::from_millis(300 * i));
                    halite.validate(codebase, constraints).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(verdicts, vec![Validation::Valid, Validation::Valid]);

    let root = fs::read_dir(dir.path().join("sandboxes"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();
    let leftovers: Vec<String> = fs::read_dir(&root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("halite_validation"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}
