use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use keel_core::HashCode;
use keel_engine::{ChangeReason, EngineConfig, StateEngine};
use keel_fingerprint::{ChangeKind, CompareStrategy, FileCollection, PathNormalization};
use keel_history::{ImplementationSnapshot, TaskExecution};
use pretty_assertions::assert_eq;

const TASK: &str = ":compile";

struct Workspace {
    _dir: tempfile::TempDir,
    config: EngineConfig,
    sources: PathBuf,
    outputs: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sources = dir.path().join("src");
        let outputs = dir.path().join("out");
        std::fs::create_dir_all(&sources).unwrap();
        std::fs::write(sources.join("Main.java"), "class Main {}").unwrap();
        let config = EngineConfig {
            cache_dir: dir.path().join(".keel"),
            ..EngineConfig::default()
        };
        Self {
            _dir: dir,
            config,
            sources,
            outputs,
        }
    }

    fn engine(&self) -> StateEngine {
        StateEngine::open(self.config.clone()).unwrap()
    }

    fn declared_outputs(&self) -> BTreeSet<String> {
        [self.outputs.to_string_lossy().into_owned()].into_iter().collect()
    }
}

fn fingerprint_dir(
    engine: &StateEngine,
    path: &Path,
) -> keel_fingerprint::FileCollectionFingerprint {
    engine
        .fingerprint(
            &FileCollection::new([path]),
            PathNormalization::Relative,
            CompareStrategy::Unordered,
        )
        .unwrap()
}

/// What the scheduler knows before running the task.
fn current_execution(workspace: &Workspace, engine: &StateEngine, release: u32) -> TaskExecution {
    let mut execution = TaskExecution::new(
        "build",
        ImplementationSnapshot::new("JavaCompile", HashCode::from_bytes("compiler-plugin")),
    );
    execution.add_input_property("release", &release).unwrap();
    execution
        .input_files
        .insert("sources".into(), fingerprint_dir(engine, &workspace.sources));
    execution
        .output_files
        .insert("classes".into(), fingerprint_dir(engine, &workspace.outputs));
    execution.declared_outputs = workspace.declared_outputs();
    execution
}

/// Runs the "compiler" and records the execution, the way a scheduler would.
fn run_build(workspace: &Workspace, release: u32) {
    let engine = workspace.engine();
    engine.build_started();
    let mut execution = current_execution(workspace, &engine, release);

    engine.before_output_change();
    std::fs::create_dir_all(&workspace.outputs).unwrap();
    std::fs::write(workspace.outputs.join("Main.class"), format!("bytes for {release}")).unwrap();

    execution
        .output_files
        .insert("classes".into(), fingerprint_dir(&engine, &workspace.outputs));
    engine.record_execution(TASK, &execution).unwrap();
    engine.build_finished().unwrap();
}

fn reasons_for_next_build(workspace: &Workspace, release: u32) -> Vec<ChangeReason> {
    let engine = workspace.engine();
    engine.build_started();
    let current = current_execution(workspace, &engine, release);
    let previous = engine
        .best_previous_execution(TASK, &current.declared_outputs)
        .expect("previous execution");
    let reasons = engine.changes_since(&previous, &current, 10).unwrap();
    engine.build_finished().unwrap();
    reasons
}

#[test]
fn unchanged_task_is_up_to_date_in_the_next_process() {
    let workspace = Workspace::new();
    run_build(&workspace, 17);
    assert_eq!(reasons_for_next_build(&workspace, 17), Vec::new());
}

#[test]
fn edited_source_is_reported() {
    let workspace = Workspace::new();
    run_build(&workspace, 17);
    std::fs::write(workspace.sources.join("Main.java"), "class Main { int x; }").unwrap();

    let reasons = reasons_for_next_build(&workspace, 17);
    assert_eq!(reasons.len(), 1);
    match &reasons[0] {
        ChangeReason::InputFile(change) => {
            assert_eq!(change.kind, ChangeKind::Modified);
            assert!(change.path.ends_with("Main.java"));
            assert_eq!(
                reasons[0].to_string(),
                format!("Input property 'sources' file {} has changed.", change.path)
            );
        }
        other => panic!("unexpected reason: {other}"),
    }
}

#[test]
fn changed_property_and_deleted_output_are_reported() {
    let workspace = Workspace::new();
    run_build(&workspace, 17);
    std::fs::remove_file(workspace.outputs.join("Main.class")).unwrap();

    let reasons = reasons_for_next_build(&workspace, 21);
    assert_eq!(reasons.len(), 2);
    assert_eq!(
        reasons[0],
        ChangeReason::InputPropertyChanged {
            name: "release".into()
        }
    );
    match &reasons[1] {
        ChangeReason::OutputFile(change) => assert_eq!(change.kind, ChangeKind::Removed),
        other => panic!("unexpected reason: {other}"),
    }
}

#[test]
fn dropped_and_renamed_file_properties_are_reported() {
    let workspace = Workspace::new();
    run_build(&workspace, 17);

    let engine = workspace.engine();
    let mut current = current_execution(&workspace, &engine, 17);
    current.input_files.clear();
    let classes = current.output_files.remove("classes").unwrap();
    current.output_files.insert("compiled".into(), classes);
    let previous = engine
        .best_previous_execution(TASK, &current.declared_outputs)
        .unwrap();

    let reasons = engine.changes_since(&previous, &current, 10).unwrap();
    assert_eq!(
        reasons,
        vec![
            ChangeReason::FilePropertyRemoved {
                kind: "Output",
                name: "classes".into()
            },
            ChangeReason::FilePropertyAdded {
                kind: "Output",
                name: "compiled".into()
            },
            ChangeReason::FilePropertyRemoved {
                kind: "Input",
                name: "sources".into()
            },
        ]
    );
    assert_eq!(
        reasons[2].to_string(),
        "Input file property 'sources' has been removed."
    );
}

#[test]
fn reasons_are_capped() {
    let workspace = Workspace::new();
    run_build(&workspace, 17);
    std::fs::write(workspace.sources.join("Other.java"), "class Other {}").unwrap();

    let engine = workspace.engine();
    let mut current = current_execution(&workspace, &engine, 21);
    current.task_implementation =
        ImplementationSnapshot::new("JavaCompile", HashCode::from_bytes("upgraded-plugin"));
    let previous = engine
        .best_previous_execution(TASK, &current.declared_outputs)
        .unwrap();
    let reasons = engine.changes_since(&previous, &current, 1).unwrap();
    assert_eq!(reasons.len(), 1);
    assert!(matches!(reasons[0], ChangeReason::TaskImplementation { .. }));
}

#[test]
fn stale_files_in_a_shared_output_directory_are_not_recorded() {
    let workspace = Workspace::new();
    std::fs::create_dir_all(&workspace.outputs).unwrap();
    std::fs::write(workspace.outputs.join("Stale.class"), "left by someone else").unwrap();

    let engine = workspace.engine();
    engine.build_started();
    let before: BTreeMap<_, _> = [(
        "classes".to_owned(),
        fingerprint_dir(&engine, &workspace.outputs),
    )]
    .into_iter()
    .collect();
    let previous = engine.best_previous_execution(TASK, &workspace.declared_outputs());
    assert!(previous.is_none());

    let overlapping = engine
        .detect_overlapping_outputs(previous.as_ref(), &before)
        .unwrap()
        .expect("stale file overlaps");
    // Without a previous execution everything already there overlaps,
    // starting with the output directory itself.
    assert_eq!(overlapping.property_name, "classes");
    assert_eq!(overlapping.path, workspace.outputs.to_string_lossy());

    engine.before_output_change();
    std::fs::write(workspace.outputs.join("Main.class"), "compiled").unwrap();
    let after: BTreeMap<_, _> = [(
        "classes".to_owned(),
        fingerprint_dir(&engine, &workspace.outputs),
    )]
    .into_iter()
    .collect();

    let recorded = engine
        .outputs_to_record(previous.as_ref(), Some(&overlapping), &before, after)
        .unwrap();
    let paths: Vec<_> = recorded["classes"]
        .entries()
        .keys()
        .map(|path| path.to_string())
        .collect();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].ends_with("Main.class"));
    engine.build_finished().unwrap();
}

#[test]
fn discovered_inputs_are_fingerprinted_by_absolute_path() {
    let workspace = Workspace::new();
    let engine = workspace.engine();
    assert!(engine
        .fingerprint_discovered_inputs(Vec::<PathBuf>::new())
        .unwrap()
        .is_empty());

    let header = workspace.sources.join("Main.java");
    let discovered = engine.fingerprint_discovered_inputs([&header]).unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(
        discovered.entries().values().next().unwrap().normalized_path(),
        header.to_string_lossy()
    );
}

#[test]
fn classpath_hashers_share_the_resource_cache() {
    let workspace = Workspace::new();
    let engine = workspace.engine();
    let hasher = engine.runtime_classpath_hasher().unwrap();
    let classpath = FileCollection::new([&workspace.sources]);

    let first = engine.fingerprint_classpath(&classpath, &hasher).unwrap();
    assert_eq!(engine.statistics().resource_hashes.misses, 1);
    let second = engine.fingerprint_classpath(&classpath, &hasher).unwrap();
    assert_eq!(first, second);
    let resource_hashes = engine.statistics().resource_hashes;
    assert_eq!(resource_hashes.misses, 1);
    assert_eq!(resource_hashes.memory_hits + resource_hashes.store_hits, 1);
    assert!(engine.diff(&second, &first, "classpath").is_empty());
    assert!(engine.statistics().snapshotter.files_hashed >= 1);
}
