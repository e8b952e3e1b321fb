//! End-to-end tests driving the `workflow-core` binary, exercising the CLI
//! subcommands and the invariants that span the planner/arbiter/engine/
//! ledger/checkpoint stack together rather than in isolation. A handful of
//! scenarios (cancellation mid-flight, interrupted-process recovery) drive
//! the library directly instead of the compiled binary, since they need a
//! cancellation handle or a simulated crash that a separate CLI process
//! can't reach.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;
use workflow_core::arbiter::ResourceArbiter;
use workflow_core::checkpoint::CheckpointManager;
use workflow_core::config::{CoreConfig, CoreToml};
use workflow_core::demos::SleepStage;
use workflow_core::engine::{Engine, ExecutionControl};
use workflow_core::ledger::ArtifactLedger;
use workflow_core::model::{FailurePolicy, StageDef, StageStatus, WorkflowDef};
use workflow_core::store::ProjectStore;

fn workflow_core() -> Command {
    Command::cargo_bin("workflow-core").unwrap()
}

struct Env {
    _dir: TempDir,
    projects_root: std::path::PathBuf,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let projects_root = dir.path().join("projects");
        Self { _dir: dir, projects_root }
    }

    fn cmd(&self) -> Command {
        let mut cmd = workflow_core();
        cmd.arg("--projects-root").arg(&self.projects_root);
        cmd
    }

    fn write_workflow(&self, name: &str, json: &str) -> std::path::PathBuf {
        let path = self.projects_root.join(format!("{name}.json"));
        std::fs::create_dir_all(&self.projects_root).unwrap();
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(json.as_bytes()).unwrap();
        path
    }
}

const LINEAR_WORKFLOW: &str = r#"{
    "name": "linear",
    "stages": [
        {"name": "a", "dependencies": [], "priority": 0, "timeout": 5,
         "required_resources": [], "estimated_duration": 0, "retry_count": 1,
         "failure_policy": "fail_workflow"},
        {"name": "b", "dependencies": ["a"], "priority": 0, "timeout": 5,
         "required_resources": [], "estimated_duration": 0, "retry_count": 1,
         "failure_policy": "fail_workflow"}
    ]
}"#;

const SKIP_DEPENDENTS_WORKFLOW: &str = r#"{
    "name": "with-skip",
    "stages": [
        {"name": "flaky:fail", "dependencies": [], "priority": 0, "timeout": 5,
         "required_resources": [], "estimated_duration": 0, "retry_count": 0,
         "failure_policy": "skip_dependents"},
        {"name": "downstream", "dependencies": ["flaky:fail"], "priority": 0, "timeout": 5,
         "required_resources": [], "estimated_duration": 0, "retry_count": 0,
         "failure_policy": "fail_workflow"}
    ]
}"#;

const CYCLE_WORKFLOW: &str = r#"{
    "name": "cyclic",
    "stages": [
        {"name": "a", "dependencies": ["b"], "priority": 0, "timeout": 5,
         "required_resources": [], "estimated_duration": 0, "retry_count": 0,
         "failure_policy": "fail_workflow"},
        {"name": "b", "dependencies": ["a"], "priority": 0, "timeout": 5,
         "required_resources": [], "estimated_duration": 0, "retry_count": 0,
         "failure_policy": "fail_workflow"}
    ]
}"#;

#[test]
fn help_and_version_succeed() {
    workflow_core().arg("--help").assert().success();
    workflow_core().arg("--version").assert().success();
}

#[test]
fn init_project_creates_the_project_directory_tree() {
    let env = Env::new();
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created project p1"));

    assert!(env.projects_root.join("p1/files/audio").exists());
    assert!(env.projects_root.join("p1/checkpoints").exists());
}

#[test]
fn init_project_is_idempotent() {
    let env = Env::new();
    for _ in 0..2 {
        env.cmd()
            .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
            .assert()
            .success();
    }
}

#[test]
fn a_linear_workflow_runs_to_completion_and_status_reports_it() {
    let env = Env::new();
    let workflow = env.write_workflow("linear", LINEAR_WORKFLOW);
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success();

    env.cmd()
        .args(["run", "--project", "p1", "--workflow"])
        .arg(&workflow)
        .assert()
        .success();

    env.cmd()
        .args(["status", "--project", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Completed"));
}

#[test]
fn a_failing_stage_with_skip_dependents_leaves_downstream_stages_skipped() {
    let env = Env::new();
    let workflow = env.write_workflow("skip", SKIP_DEPENDENTS_WORKFLOW);
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success();

    // exit code 1: the overall run did not finish all stages successfully
    env.cmd()
        .args(["run", "--project", "p1", "--workflow"])
        .arg(&workflow)
        .assert()
        .code(1);

    env.cmd()
        .args(["status", "--project", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Skipped"));
}

#[test]
fn a_cyclic_workflow_is_rejected_with_the_misconfiguration_exit_code() {
    let env = Env::new();
    let workflow = env.write_workflow("cyclic", CYCLE_WORKFLOW);
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success();

    env.cmd()
        .args(["run", "--project", "p1", "--workflow"])
        .arg(&workflow)
        .assert()
        .code(2);
}

#[test]
fn running_a_completed_project_a_second_time_is_idempotent() {
    let env = Env::new();
    let workflow = env.write_workflow("linear", LINEAR_WORKFLOW);
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success();

    env.cmd().args(["run", "--project", "p1", "--workflow"]).arg(&workflow).assert().success();
    // a second run against an already-completed project must not error out
    // trying to illegally re-transition a Completed stage to Running.
    env.cmd().args(["run", "--project", "p1", "--workflow"]).arg(&workflow).assert().success();
}

#[test]
fn reconcile_reports_no_drift_for_a_freshly_run_project() {
    let env = Env::new();
    let workflow_json = r#"{
        "name": "with-artifact",
        "stages": [
            {"name": "artifact:report", "dependencies": [], "priority": 0, "timeout": 5,
             "required_resources": [], "estimated_duration": 0, "retry_count": 0,
             "failure_policy": "fail_workflow"}
        ]
    }"#;
    let workflow = env.write_workflow("with-artifact", workflow_json);
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success();
    env.cmd().args(["run", "--project", "p1", "--workflow"]).arg(&workflow).assert().success();

    env.cmd()
        .args(["reconcile", "--project", "p1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("orphans: 0"))
        .stdout(predicate::str::contains("missing: 0"));
}

#[test]
fn list_projects_shows_every_created_project() {
    let env = Env::new();
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "one", "--theme", "t"])
        .assert()
        .success();
    env.cmd()
        .args(["init-project", "--id", "p2", "--name", "two", "--theme", "t"])
        .assert()
        .success();

    env.cmd()
        .arg("list-projects")
        .assert()
        .success()
        .stdout(predicate::str::contains("p1"))
        .stdout(predicate::str::contains("p2"));
}

#[test]
fn status_on_an_unknown_project_fails() {
    let env = Env::new();
    env.cmd().args(["status", "--project", "ghost"]).assert().failure();
}

fn three_independent_sleeps_workflow(seconds: u64) -> String {
    format!(
        r#"{{
            "name": "fan-out",
            "stages": [
                {{"name": "sleep:{seconds}:a", "dependencies": [], "priority": 0, "timeout": 30,
                 "required_resources": [], "estimated_duration": 0, "retry_count": 0,
                 "failure_policy": "fail_workflow"}},
                {{"name": "sleep:{seconds}:b", "dependencies": [], "priority": 0, "timeout": 30,
                 "required_resources": [], "estimated_duration": 0, "retry_count": 0,
                 "failure_policy": "fail_workflow"}},
                {{"name": "sleep:{seconds}:c", "dependencies": [], "priority": 0, "timeout": 30,
                 "required_resources": [], "estimated_duration": 0, "retry_count": 0,
                 "failure_policy": "fail_workflow"}}
            ]
        }}"#
    )
}

#[test]
fn independent_stages_in_a_phase_run_concurrently_not_serially() {
    let env = Env::new();
    let workflow = env.write_workflow("fan-out", &three_independent_sleeps_workflow(1));
    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success();

    let start = std::time::Instant::now();
    env.cmd().args(["run", "--project", "p1", "--workflow"]).arg(&workflow).assert().success();
    let elapsed = start.elapsed();

    // three 1s stages run one phase at a time: serial would be ~3s, but
    // with no resource contention they all run concurrently and the whole
    // run should finish in well under that.
    assert!(elapsed < std::time::Duration::from_millis(2500), "took {elapsed:?}, expected concurrent fan-out");
}

#[test]
fn a_single_unit_resource_pool_serializes_stages_that_compete_for_it() {
    let env = Env::new();
    let workflow_json = three_independent_sleeps_workflow(1).replace(
        "\"required_resources\": [],",
        "\"required_resources\": [\"gpu\"],",
    );
    let workflow = env.write_workflow("gpu-bound", &workflow_json);

    std::fs::create_dir_all(&env.projects_root).unwrap();
    let config_path = env.projects_root.join("config.toml");
    std::fs::write(&config_path, "[resource_pool]\ngpu = 1\n").unwrap();

    env.cmd()
        .args(["init-project", "--id", "p1", "--name", "demo", "--theme", "space"])
        .assert()
        .success();

    let start = std::time::Instant::now();
    env.cmd()
        .arg("--config")
        .arg(&config_path)
        .args(["run", "--project", "p1", "--workflow"])
        .arg(&workflow)
        .assert()
        .success();
    let elapsed = start.elapsed();

    // all three stages are in the same phase but share a single `gpu`
    // permit, so the arbiter must serialize them: total time should be
    // close to the serial sum rather than the concurrent one.
    assert!(elapsed >= std::time::Duration::from_millis(2500), "took {elapsed:?}, expected serialized access to a single-unit resource");
}

fn test_engine(
    dir: &std::path::Path,
    checkpoint_interval_seconds: Option<u64>,
) -> (Arc<ProjectStore>, Arc<ArtifactLedger>, Engine) {
    let store = Arc::new(ProjectStore::open_in_memory().unwrap());
    let ledger = Arc::new(ArtifactLedger::new(dir.to_path_buf(), None));
    let arbiter = Arc::new(ResourceArbiter::new(std::collections::HashMap::new()));
    let file = CoreToml { checkpoint_interval_seconds, ..Default::default() };
    let config = CoreConfig::resolve(dir.join("projects"), Some(file)).unwrap();
    let engine = Engine::new(store.clone(), ledger.clone(), arbiter, config);
    (store, ledger, engine)
}

fn sleep_stage_def(name: &str, seconds: u64) -> StageDef {
    StageDef {
        name: name.to_string(),
        dependencies: vec![],
        priority: 0,
        timeout: std::time::Duration::from_secs(30),
        required_resources: vec![],
        estimated_duration: std::time::Duration::from_secs(seconds),
        retry_count: 0,
        failure_policy: FailurePolicy::FailWorkflow,
    }
}

#[tokio::test]
async fn cancelling_mid_flight_stops_the_stage_and_a_fresh_run_resumes_it() {
    let dir = tempfile::tempdir().unwrap();
    let (store, ledger, mut engine) = test_engine(dir.path(), None);
    store.create_project("p1", "demo", "theme", &serde_json::json!({}), 1).unwrap();
    ledger.init_project_dirs("p1").unwrap();
    engine.register("slow", Arc::new(SleepStage { duration: std::time::Duration::from_secs(5) }));
    let workflow = Arc::new(WorkflowDef { name: "w".into(), stages: vec![sleep_stage_def("slow", 5)] });

    let control = ExecutionControl::new();
    let engine = Arc::new(engine);
    let handle = tokio::spawn({
        let engine = engine.clone();
        let workflow = workflow.clone();
        let control = control.clone();
        async move { engine.run(&workflow, "p1", control, None).await }
    });

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    control.cancel();
    handle.await.unwrap().unwrap();

    let record = store.get_stage("p1", "slow").unwrap().unwrap();
    assert_eq!(record.status, StageStatus::Cancelled);

    // a fresh run against the same project retries the cancelled stage
    // rather than treating it as already done.
    let fresh_control = ExecutionControl::new();
    engine.run(&workflow, "p1", fresh_control, None).await.unwrap();
    let record = store.get_stage("p1", "slow").unwrap().unwrap();
    assert_eq!(record.status, StageStatus::Completed);
}

#[tokio::test]
async fn an_interrupted_run_is_found_and_recovered_via_find_interrupted_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let (store, ledger, mut engine) = test_engine(dir.path(), Some(1));
    let checkpoint_manager = CheckpointManager::new(10);
    store.create_project("p1", "demo", "theme", &serde_json::json!({}), 1).unwrap();
    ledger.init_project_dirs("p1").unwrap();
    engine.register("slow", Arc::new(SleepStage { duration: std::time::Duration::from_secs(10) }));
    let workflow = WorkflowDef { name: "w".into(), stages: vec![sleep_stage_def("slow", 10)] };

    let engine = Arc::new(engine);
    let control = ExecutionControl::new();
    let handle = tokio::spawn({
        let engine = engine.clone();
        let workflow = workflow.clone();
        async move { engine.run(&workflow, "p1", control, None).await }
    });

    // give the periodic checkpoint task time to snapshot the stage while
    // it's still running, then kill the run outright to simulate a crash
    // (no graceful cancellation, no terminal status ever recorded).
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
    handle.abort();
    let _ = handle.await;

    let interrupted = checkpoint_manager.find_interrupted(&ledger).unwrap();
    assert_eq!(interrupted, vec!["p1".to_string()]);

    let recovered = checkpoint_manager.resume(&store, "p1").unwrap();
    assert_eq!(recovered, vec!["slow".to_string()]);
    let record = store.get_stage("p1", "slow").unwrap().unwrap();
    assert_eq!(record.status, StageStatus::Failed);

    // re-running from here completes normally: the interrupted stage was
    // normalized to a terminal state a fresh run can retry.
    let workflow = WorkflowDef {
        name: "w".into(),
        stages: vec![sleep_stage_def("slow", 10)],
    };
    let mut engine2 = Engine::new(
        store.clone(),
        ledger.clone(),
        Arc::new(ResourceArbiter::new(std::collections::HashMap::new())),
        CoreConfig::resolve(dir.path().join("projects"), None).unwrap(),
    );
    engine2.register("slow", Arc::new(SleepStage { duration: std::time::Duration::from_millis(1) }));
    engine2.run(&workflow, "p1", ExecutionControl::new(), None).await.unwrap();
    let record = store.get_stage("p1", "slow").unwrap().unwrap();
    assert_eq!(record.status, StageStatus::Completed);
}
