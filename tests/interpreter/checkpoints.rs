//! Checkpoint caching across runs, resume targets, and forking

use std::path::Path;
use std::rc::Rc;

use pretty_assertions::assert_eq;

use mlld::checkpoint::{CheckpointManager, ResumeTarget};
use mlld::platform::FileSystem;

use super::{js_runner, Harness};

const SCRIPT: &str = "/exe @llm(prompt) = js { return call(prompt); }\n/var @a = @llm(\"aa\")\n/var @b = @llm(\"bb\")\n/var @c = @llm(\"cc\")\n/show `@a @b @c`\n";

fn harness() -> Harness {
    Harness::new().runner(js_runner(vec![("return call(prompt)", "answer")]))
}

fn manager_for(harness: &Harness) -> CheckpointManager {
    CheckpointManager::open(
        Rc::clone(&harness.fs) as Rc<dyn FileSystem>,
        Path::new("/cache"),
        "script",
    )
}

fn run_with_checkpoint(harness: &Harness, manager: CheckpointManager) -> String {
    let mut interp = harness.interpreter();
    interp.set_checkpoint(manager);
    interp
        .run_source(SCRIPT, Some(Path::new("/doc.mld")))
        .unwrap()
}

#[test]
fn first_run_executes_and_caches_every_call() {
    let harness = harness();
    let out = run_with_checkpoint(&harness, manager_for(&harness));
    assert_eq!(out, "answer answer answer\n");
    assert_eq!(harness.runner.calls(), 3);
    // Entries landed on disk, one file per key
    let files = harness
        .fs
        .glob(Path::new("/cache/script"), "*.json")
        .unwrap();
    assert_eq!(files.len(), 3);
}

#[test]
fn second_run_hits_the_cache() {
    let harness = harness();
    run_with_checkpoint(&harness, manager_for(&harness));
    assert_eq!(harness.runner.calls(), 3);
    run_with_checkpoint(&harness, manager_for(&harness));
    assert_eq!(harness.runner.calls(), 3);
}

#[test]
fn fuzzy_resume_invalidates_from_the_first_match_onward() {
    // --resume '@llm("bb")' keeps aa cached, re-runs bb and cc
    let harness = harness();
    run_with_checkpoint(&harness, manager_for(&harness));
    assert_eq!(harness.runner.calls(), 3);

    let mut manager = manager_for(&harness);
    let target = ResumeTarget::parse("@llm(\"bb\")").unwrap();
    manager.invalidate(&target).unwrap();
    run_with_checkpoint(&harness, manager);
    assert_eq!(harness.runner.calls(), 5);
}

#[test]
fn resume_all_sites_re_executes_everything() {
    let harness = harness();
    run_with_checkpoint(&harness, manager_for(&harness));
    let mut manager = manager_for(&harness);
    manager
        .invalidate(&ResumeTarget::parse("@llm").unwrap())
        .unwrap();
    run_with_checkpoint(&harness, manager);
    assert_eq!(harness.runner.calls(), 6);
}

#[test]
fn fork_seeds_reads_without_writing_back() {
    let harness = harness();
    run_with_checkpoint(&harness, manager_for(&harness));
    assert_eq!(harness.runner.calls(), 3);

    let mut forked = CheckpointManager::open(
        Rc::clone(&harness.fs) as Rc<dyn FileSystem>,
        Path::new("/cache"),
        "other-script",
    );
    forked.fork_from(Path::new("/cache"), "script");
    run_with_checkpoint(&harness, forked);
    // Every call was served from the forked cache
    assert_eq!(harness.runner.calls(), 3);
    assert!(harness
        .fs
        .glob(Path::new("/cache/other-script"), "*.json")
        .unwrap()
        .is_empty());
}

#[test]
fn checkpoint_directive_names_the_latest_entry() {
    let harness = harness();
    let script = "/exe @llm(prompt) = js { return call(prompt); }\n/var @a = @llm(\"aa\")\n/checkpoint \"phase-one\"\n/var @b = @llm(\"bb\")\n";
    let mut interp = harness.interpreter();
    interp.set_checkpoint(manager_for(&harness));
    interp
        .run_source(script, Some(Path::new("/doc.mld")))
        .unwrap();

    let mut manager = manager_for(&harness);
    let removed = manager
        .invalidate(&ResumeTarget::parse("\"phase-one\"").unwrap())
        .unwrap();
    assert_eq!(removed, 1);
    assert!(manager.lookup("llm", "[\"bb\"]").is_some());
    assert!(manager.lookup("llm", "[\"aa\"]").is_none());
}

#[test]
fn template_bodies_are_never_cached() {
    let harness = Harness::new();
    let mut interp = harness.interpreter();
    interp.set_checkpoint(manager_for(&harness));
    interp
        .run_source(
            "/exe @t(x) = `t:@x`\n/var @a = @t(\"one\")\n/show @a\n",
            Some(Path::new("/doc.mld")),
        )
        .unwrap();
    assert!(harness
        .fs
        .glob(Path::new("/cache/script"), "*.json")
        .unwrap()
        .is_empty());
}
