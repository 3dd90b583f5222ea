mod common;

use common::{open_arbiter, sequence_manifest, write_manifest};
use padpilot::arbiter::SourceKind;
use padpilot::command::{CommandEnv, CommandKind};
use padpilot::lifecycle::{CommandLifecycle, LifecycleSettings, RunOutcome};
use padpilot::registry::{CommandRegistries, CommandRegistry, PluginLibrary};
use padpilot::transport::mock::MemoryPort;
use std::time::Duration;
use tokio::sync::oneshot;

fn scripted(dir: &std::path::Path) -> CommandRegistry {
    CommandRegistry::new(CommandKind::Scripted, dir, PluginLibrary::with_builtins())
}

#[tokio::test]
async fn invalid_candidate_is_skipped_and_order_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), "a.toml", &sequence_manifest("A"));
    write_manifest(dir.path(), "b.toml", "name = \"B\"\n[params]\nrepeat = 1\n");
    write_manifest(dir.path(), "c.toml", &sequence_manifest("C"));

    let catalog = scripted(dir.path()).load().await;
    assert_eq!(catalog.names(), vec!["A", "C"]);
    assert_eq!(catalog.kind(), CommandKind::Scripted);
}

#[tokio::test]
async fn catalog_holds_exactly_the_qualifying_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let write = |file: &str, content: &str| write_manifest(dir.path(), file, content);

    write("01-valid.toml", &sequence_manifest("Valid"));
    write("02-broken.toml", "name = [unterminated");
    write("03-unknown.toml", "name = \"Unknown\"\nentry = \"lua\"\n");
    write(
        "04-wrong-kind.toml",
        "name = \"Firmware\"\nentry = \"mcu_sync\"\n[params]\nsync_name = \"Hatch\"\n",
    );
    write(
        "05-declared-hardware.toml",
        &format!("kind = \"hardware\"\n{}", sequence_manifest("Declared")),
    );
    write("06-bad-params.toml", "name = \"NoSteps\"\nentry = \"sequence\"\n[params]\nsteps = []\n");
    write("07-duplicate.toml", &sequence_manifest("Valid"));
    write(
        "08-camera.toml",
        &format!("requires = [\"camera\"]\n{}", sequence_manifest("Camera")),
    );
    write("09-notes.txt", &sequence_manifest("Ignored"));
    std::fs::create_dir(dir.path().join("10-dir.toml")).unwrap();

    let catalog = scripted(dir.path()).load().await;
    assert_eq!(catalog.names(), vec!["Valid", "Camera"]);

    let camera = catalog.find("Camera").unwrap();
    assert_eq!(camera.requires(), &[padpilot::command::Capability::Camera]);
    assert!(camera.source().unwrap().ends_with("08-camera.toml"));
}

#[tokio::test]
async fn hardware_registry_refuses_camera_commands() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "hatch.toml",
        "name = \"Hatch\"\nentry = \"mcu_sync\"\n[params]\nsync_name = \"Hatch\"\n",
    );
    write_manifest(
        dir.path(),
        "spy.toml",
        "name = \"Spy\"\nentry = \"mcu_sync\"\nrequires = [\"camera\"]\n[params]\nsync_name = \"Spy\"\n",
    );
    write_manifest(dir.path(), "script.toml", &sequence_manifest("Script"));

    let registry = CommandRegistry::new(CommandKind::Hardware, dir.path(), PluginLibrary::with_builtins());
    let catalog = registry.load().await;
    assert_eq!(catalog.names(), vec!["Hatch"]);
}

#[tokio::test]
async fn repeated_loads_are_stable_and_generations_increase() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["zeta", "alpha", "mid"] {
        write_manifest(dir.path(), &format!("{}.toml", name), &sequence_manifest(name));
    }

    let registry = scripted(dir.path());
    let mut updates = registry.subscribe();

    let first = registry.load().await;
    assert!(updates.has_changed().unwrap());
    updates.borrow_and_update();

    let second = registry.reload().await;
    assert!(updates.has_changed().unwrap());

    assert_eq!(first.names(), vec!["alpha", "mid", "zeta"]);
    assert_eq!(first.names(), second.names());
    assert!(second.generation() > first.generation());
    assert_eq!(registry.current().generation(), second.generation());
    assert_eq!(second.find("mid").unwrap().generation(), second.generation());
}

#[tokio::test]
async fn instance_from_an_old_generation_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(
        dir.path(),
        "loop.toml",
        "name = \"Loop\"\nentry = \"sequence\"\n[params]\nrepeat = 0\n[[params.steps]]\nbuttons = [\"b\"]\nhold_ms = 1\nwait_ms = 1\n",
    );

    let port = MemoryPort::new();
    let arbiter = open_arbiter(&port);
    let lifecycle = CommandLifecycle::new(
        CommandEnv::new(arbiter.submitter(SourceKind::Command)),
        LifecycleSettings::default(),
    );

    let registry = scripted(dir.path());
    let old = registry.load().await;
    let descriptor = old.find("Loop").unwrap().clone();

    let (tx, rx) = oneshot::channel();
    lifecycle
        .start(&descriptor, move |report| {
            let _ = tx.send(report);
        })
        .unwrap();

    std::fs::remove_file(dir.path().join("loop.toml")).unwrap();
    let new = registry.reload().await;
    assert!(new.is_empty());
    assert_eq!(old.names(), vec!["Loop"]);

    // The old instance keeps writing after the new generation exists.
    let written = port.lines().len();
    tokio::time::timeout(Duration::from_secs(2), async {
        while port.lines().len() < written + 4 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    // And the old descriptor can still build new instances.
    lifecycle.stop().await;
    let report = rx.await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Stopped));
    assert_eq!(descriptor.generation(), old.generation());

    let (tx, rx) = oneshot::channel();
    lifecycle
        .start(&descriptor, move |report| {
            let _ = tx.send(report);
        })
        .unwrap();
    lifecycle.stop().await;
    assert!(matches!(rx.await.unwrap().outcome, RunOutcome::Stopped));

    arbiter.close().await.unwrap();
}

#[tokio::test]
async fn both_registries_load_from_their_own_directories() {
    let scripted_dir = tempfile::tempdir().unwrap();
    let hardware_dir = tempfile::tempdir().unwrap();
    write_manifest(scripted_dir.path(), "a.toml", &sequence_manifest("Script"));
    write_manifest(
        hardware_dir.path(),
        "h.toml",
        "name = \"Firmware\"\nentry = \"mcu_sync\"\n[params]\nsync_name = \"Firmware\"\n",
    );

    let registries = CommandRegistries::new(
        scripted_dir.path(),
        hardware_dir.path(),
        PluginLibrary::with_builtins(),
    );
    let (scripted, hardware) = registries.load_all().await;
    assert_eq!(scripted.names(), vec!["Script"]);
    assert_eq!(hardware.names(), vec!["Firmware"]);

    let (scripted_again, _) = registries.reload_all().await;
    assert!(scripted_again.generation() > scripted.generation());
    assert_eq!(
        registries.get(CommandKind::Hardware).current().names(),
        vec!["Firmware"]
    );
}
