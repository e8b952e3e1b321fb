//! C5 — Scheduler/Engine: drives an [`ExecutionPlan`] to completion.
//!
//! Grounded on the teacher's `dag/executor.rs` main loop: a
//! `Semaphore`-bounded pool of spawned tasks reporting back over an
//! `mpsc` channel, one wave (here: phase) at a time. Generalized with
//! per-stage resource acquisition via the [`crate::arbiter::ResourceArbiter`],
//! per-stage timeouts, retry with exponential backoff, and cooperative
//! pause/cancel instead of the teacher's fail-fast-only abort.

pub mod context;
pub mod state;

use crate::arbiter::ResourceArbiter;
use crate::audit::{AuditEntry, AuditTrail};
use crate::checkpoint::CheckpointManager;
use crate::config::CoreConfig;
use crate::error::EngineError;
use crate::ledger::ArtifactLedger;
use crate::model::{DataMap, FailurePolicy, StageDef, StageStatus, WorkflowDef};
use crate::planner::DependencyPlanner;
use crate::store::ProjectStore;
use context::{StageContext, StageOutcome, StageProcessor};
use state::{ExecutionSummary, ExecutionTimer, ProgressEmitter, ProgressEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Cooperative pause/cancel switch shared with whoever is driving the
/// engine from outside (a CLI signal handler, a UI button).
#[derive(Default)]
pub struct ExecutionControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl ExecutionControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Blocks between phases while paused, polling every 50ms, until
    /// resumed or cancelled.
    async fn wait_if_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

pub struct Engine {
    store: Arc<ProjectStore>,
    ledger: Arc<ArtifactLedger>,
    arbiter: Arc<ResourceArbiter>,
    config: CoreConfig,
    processors: HashMap<String, Arc<dyn StageProcessor>>,
    checkpoint_manager: CheckpointManager,
    audit: Arc<AuditTrail>,
}

impl Engine {
    pub fn new(
        store: Arc<ProjectStore>,
        ledger: Arc<ArtifactLedger>,
        arbiter: Arc<ResourceArbiter>,
        config: CoreConfig,
    ) -> Self {
        let checkpoint_manager = CheckpointManager::new(config.checkpoint_retention_count);
        let audit = Arc::new(AuditTrail::new(config.projects_root.clone()));
        Self {
            store,
            ledger,
            arbiter,
            config,
            processors: HashMap::new(),
            checkpoint_manager,
            audit,
        }
    }

    pub fn register(&mut self, stage_name: impl Into<String>, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(stage_name.into(), processor);
    }

    /// Run `workflow` against `project_id` to completion, resuming any
    /// stages left over from an earlier, interrupted run (§4.5 "Resume").
    pub async fn run(
        &self,
        workflow: &WorkflowDef,
        project_id: &str,
        control: Arc<ExecutionControl>,
        events: Option<tokio::sync::mpsc::Sender<ProgressEvent>>,
    ) -> Result<ExecutionSummary, EngineError> {
        let timer = ExecutionTimer::start();
        let emitter = ProgressEmitter::new(events);
        let plan = DependencyPlanner::plan(workflow)?;

        let stage_rows: Vec<(String, i64, serde_json::Value)> = workflow
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i as i64, serde_json::json!({})))
            .collect();
        self.store.create_stage_records(project_id, &stage_rows)?;

        if self
            .store
            .get_project(project_id)?
            .is_some_and(|p| p.status == crate::model::ProjectStatus::Initialized)
        {
            self.store
                .update_project_status(project_id, crate::model::ProjectStatus::Processing)?;
        }

        let by_name: HashMap<&str, &StageDef> =
            workflow.stages.iter().map(|s| (s.name.as_str(), s)).collect();
        let dependents = dependents_map(workflow);

        let mut results: HashMap<String, DataMap> = HashMap::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut workflow_failed = false;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_stages));

        // §4.6 "Schedule": save a checkpoint every `checkpoint_interval`
        // regardless of stage boundaries, so a long-running phase isn't
        // left without a recent snapshot.
        let periodic_checkpoint = self.config.checkpoint_interval.map(|interval| {
            let store = self.store.clone();
            let ledger = self.ledger.clone();
            let checkpoint_manager = self.checkpoint_manager.clone();
            let project_id_owned = project_id.to_string();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    checkpoint_manager.save(&store, &ledger, &project_id_owned).ok();
                }
            })
        });

        'phases: for (phase_idx, phase) in plan.phases.iter().enumerate() {
            if control.is_paused() {
                self.checkpoint_manager.save(&self.store, &self.ledger, project_id).ok();
            }
            control.wait_if_paused().await;
            if control.is_cancelled() {
                break 'phases;
            }

            emitter
                .emit(
                    ProgressEvent::PhaseStarted {
                        phase: phase_idx,
                        stages: phase.stages.clone(),
                    },
                    false,
                )
                .await;

            let mut handles: Vec<JoinHandle<(String, StageOutcome)>> = Vec::new();

            for name in &phase.stages {
                if skipped.contains(name) {
                    continue;
                }
                let current = self.store.get_stage(project_id, name)?;
                if let Some(record) = &current
                    && matches!(record.status, StageStatus::Completed | StageStatus::Skipped)
                {
                    continue; // idempotent resume: already done
                }
                let Some(stage_def) = by_name.get(name.as_str()) else {
                    continue;
                };
                let Some(processor) = self.processors.get(name).cloned() else {
                    return Err(EngineError::NoProcessor(name.clone()));
                };

                // §5 ordering guarantee (a): the stage must see the
                // outputSummary of every transitively-depended completed
                // stage, keyed by stage name, not a flat merge of direct
                // dependencies' output maps.
                let input: DataMap = transitive_dependencies(stage_def, &by_name)
                    .into_iter()
                    .filter_map(|dep| {
                        results
                            .get(&dep)
                            .map(|data| (dep, serde_json::to_value(data).unwrap_or_default()))
                    })
                    .collect();

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
                let stage_name = name.clone();
                let stage_def = (*stage_def).clone();
                let store = self.store.clone();
                let ledger = self.ledger.clone();
                let arbiter = self.arbiter.clone();
                let project_id_owned = project_id.to_string();
                let control = control.clone();
                let checkpoint_manager = self.checkpoint_manager.clone();
                let audit = self.audit.clone();

                emitter
                    .emit(ProgressEvent::StageStarted { stage: stage_name.clone(), attempt: 0 }, true)
                    .await;

                let retry_base_delay = self.config.retry_base_delay;
                let retry_exponential_backoff = self.config.retry_exponential_backoff;
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    let outcome = run_stage_with_retries(
                        &stage_def,
                        &project_id_owned,
                        input,
                        processor,
                        store,
                        ledger,
                        arbiter,
                        control,
                        checkpoint_manager,
                        audit,
                        retry_base_delay,
                        retry_exponential_backoff,
                    )
                    .await;
                    (stage_name, outcome)
                });
                handles.push(handle);
            }

            let mut phase_completed = 0;
            let mut phase_failed = 0;
            for handle in handles {
                let (stage_name, outcome) = handle.await.map_err(|e| {
                    EngineError::Cancelled { reason: format!("stage task panicked: {e}") }
                })?;
                let status = match outcome {
                    StageOutcome::Success(data) => {
                        phase_completed += 1;
                        results.insert(stage_name.clone(), data);
                        StageStatus::Completed
                    }
                    StageOutcome::Cancelled => StageStatus::Cancelled,
                    StageOutcome::Failure(reason) => {
                        phase_failed += 1;
                        let policy = by_name
                            .get(stage_name.as_str())
                            .map(|s| s.failure_policy)
                            .unwrap_or_default();
                        match policy {
                            FailurePolicy::FailWorkflow => {
                                workflow_failed = true;
                                tracing::error!(stage = %stage_name, %reason, "stage failed, failing workflow");
                            }
                            FailurePolicy::SkipDependents => {
                                tracing::warn!(stage = %stage_name, %reason, "stage failed, skipping dependents");
                                mark_transitive_skipped(&stage_name, &dependents, &self.processors, &mut skipped);
                                for dep in &skipped {
                                    if self
                                        .store
                                        .get_stage(project_id, dep)?
                                        .is_some_and(|r| r.status == StageStatus::Pending)
                                    {
                                        self.store.update_stage_status(
                                            project_id,
                                            dep,
                                            StageStatus::Skipped,
                                            None,
                                            None,
                                            None,
                                            None,
                                        )?;
                                        self.checkpoint_manager
                                            .save(&self.store, &self.ledger, project_id)
                                            .ok();
                                        self.audit
                                            .record(&AuditEntry {
                                                timestamp: chrono::Utc::now(),
                                                project_id: project_id.to_string(),
                                                stage_name: dep.clone(),
                                                status: StageStatus::Skipped,
                                                attempt: 0,
                                                detail: Some(format!(
                                                    "skipped: upstream stage '{stage_name}' failed"
                                                )),
                                            })
                                            .ok();
                                    }
                                }
                            }
                        }
                        StageStatus::Failed
                    }
                };
                emitter
                    .emit(ProgressEvent::StageCompleted { stage: stage_name, status }, true)
                    .await;
            }

            emitter
                .emit(
                    ProgressEvent::PhaseCompleted {
                        phase: phase_idx,
                        completed: phase_completed,
                        failed: phase_failed,
                    },
                    false,
                )
                .await;
            self.emit_progress(&emitter, workflow, project_id).await?;

            if workflow_failed || control.is_cancelled() {
                break 'phases;
            }
        }

        if let Some(handle) = periodic_checkpoint {
            handle.abort();
        }

        let final_status = if control.is_cancelled() {
            crate::model::ProjectStatus::Cancelled
        } else if workflow_failed {
            crate::model::ProjectStatus::Failed
        } else {
            crate::model::ProjectStatus::Completed
        };
        if self
            .store
            .get_project(project_id)?
            .is_some_and(|p| p.status.can_transition_to(final_status))
        {
            self.store.update_project_status(project_id, final_status)?;
        }
        let elapsed = timer.elapsed();
        self.store
            .set_project_actual_duration(project_id, elapsed.as_secs() as i64)?;

        let stage_statuses = self
            .store
            .list_stages(project_id)?
            .into_iter()
            .map(|s| (s.step_name, s.status))
            .collect();

        emitter
            .emit(ProgressEvent::ExecutionCompleted { success: !workflow_failed }, false)
            .await;

        self.checkpoint_manager.save(&self.store, &self.ledger, project_id).ok();

        Ok(ExecutionSummary { stage_statuses, duration: elapsed })
    }

    /// Computes and emits a counts-by-status progress snapshot (§4.5
    /// "progress events"): how many stages are pending/running/terminal,
    /// how far along the workflow is, and how much estimated work remains.
    async fn emit_progress(
        &self,
        emitter: &ProgressEmitter,
        workflow: &WorkflowDef,
        project_id: &str,
    ) -> Result<(), EngineError> {
        let stages = self.store.list_stages(project_id)?;
        let total = stages.len();
        let (mut pending, mut running, mut completed, mut failed, mut skipped) = (0, 0, 0, 0, 0);
        for s in &stages {
            match s.status {
                StageStatus::Pending => pending += 1,
                StageStatus::Running => running += 1,
                StageStatus::Completed => completed += 1,
                StageStatus::Failed | StageStatus::Cancelled => failed += 1,
                StageStatus::Skipped => skipped += 1,
            }
        }
        let terminal = completed + failed + skipped;
        let percent_complete = if total == 0 { 100.0 } else { (terminal as f64 / total as f64) * 100.0 };
        let estimated_remaining: std::time::Duration = workflow
            .stages
            .iter()
            .filter(|def| {
                stages
                    .iter()
                    .find(|r| r.step_name == def.name)
                    .map(|r| !matches!(r.status, StageStatus::Completed | StageStatus::Skipped))
                    .unwrap_or(true)
            })
            .map(|def| {
                self.processors
                    .get(&def.name)
                    .and_then(|p| p.estimate_duration())
                    .unwrap_or(def.estimated_duration)
            })
            .sum();

        emitter
            .emit(
                ProgressEvent::Progress {
                    pending,
                    running,
                    completed,
                    failed,
                    skipped,
                    total,
                    percent_complete,
                    estimated_remaining_secs: estimated_remaining.as_secs_f64(),
                },
                true,
            )
            .await;
        Ok(())
    }
}

/// Saves a checkpoint and appends an audit entry together: every terminal
/// stage transition goes through here so the two records never drift apart.
#[allow(clippy::too_many_arguments)]
fn record_terminal(
    store: &ProjectStore,
    ledger: &ArtifactLedger,
    checkpoint_manager: &CheckpointManager,
    audit: &AuditTrail,
    project_id: &str,
    stage_name: &str,
    status: StageStatus,
    attempt: u32,
    detail: Option<String>,
) {
    checkpoint_manager.save(store, ledger, project_id).ok();
    audit
        .record(&AuditEntry {
            timestamp: chrono::Utc::now(),
            project_id: project_id.to_string(),
            stage_name: stage_name.to_string(),
            status,
            attempt,
            detail,
        })
        .ok();
}

#[allow(clippy::too_many_arguments)]
async fn run_stage_with_retries(
    stage: &StageDef,
    project_id: &str,
    input: DataMap,
    processor: Arc<dyn StageProcessor>,
    store: Arc<ProjectStore>,
    ledger: Arc<ArtifactLedger>,
    arbiter: Arc<ResourceArbiter>,
    control: Arc<ExecutionControl>,
    checkpoint_manager: CheckpointManager,
    audit: Arc<AuditTrail>,
    retry_base_delay: std::time::Duration,
    retry_exponential_backoff: bool,
) -> StageOutcome {
    store
        .update_stage_status(project_id, &stage.name, StageStatus::Running, None, None, None, None)
        .ok();

    let requests: Vec<(&str, usize)> = stage.required_resources.iter().map(|r| (r.as_str(), 1)).collect();
    let _grant = if requests.is_empty() {
        None
    } else {
        match arbiter.acquire_all(&requests).await {
            Ok(grant) => Some(grant),
            Err(e) => {
                store
                    .update_stage_status(
                        project_id,
                        &stage.name,
                        StageStatus::Failed,
                        Some(&e.to_string()),
                        None,
                        None,
                        None,
                    )
                    .ok();
                record_terminal(
                    &store,
                    &ledger,
                    &checkpoint_manager,
                    &audit,
                    project_id,
                    &stage.name,
                    StageStatus::Failed,
                    0,
                    Some(e.to_string()),
                );
                return StageOutcome::Failure(e.to_string());
            }
        }
    };

    let mut last_error = String::new();
    for attempt in 0..=stage.retry_count {
        if control.is_cancelled() {
            store
                .update_stage_status(project_id, &stage.name, StageStatus::Cancelled, None, None, None, None)
                .ok();
            record_terminal(
                &store,
                &ledger,
                &checkpoint_manager,
                &audit,
                project_id,
                &stage.name,
                StageStatus::Cancelled,
                attempt,
                Some("execution cancelled before stage started".to_string()),
            );
            return StageOutcome::Cancelled;
        }

        let ctx = StageContext {
            project_id: project_id.to_string(),
            stage_name: stage.name.clone(),
            attempt,
            input: input.clone(),
            store: store.clone(),
            ledger: ledger.clone(),
            control: control.clone(),
        };

        let start = std::time::Instant::now();
        let outcome = tokio::time::timeout(stage.timeout, processor.process(&ctx)).await;
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(StageOutcome::Success(data)) => {
                store
                    .update_stage_status(
                        project_id,
                        &stage.name,
                        StageStatus::Completed,
                        None,
                        Some(attempt),
                        Some(&serde_json::to_value(&data).unwrap_or_default()),
                        Some(elapsed),
                    )
                    .ok();
                record_terminal(
                    &store,
                    &ledger,
                    &checkpoint_manager,
                    &audit,
                    project_id,
                    &stage.name,
                    StageStatus::Completed,
                    attempt,
                    None,
                );
                return StageOutcome::Success(data);
            }
            Ok(StageOutcome::Cancelled) => {
                store
                    .update_stage_status(
                        project_id,
                        &stage.name,
                        StageStatus::Cancelled,
                        None,
                        Some(attempt),
                        None,
                        Some(elapsed),
                    )
                    .ok();
                record_terminal(
                    &store,
                    &ledger,
                    &checkpoint_manager,
                    &audit,
                    project_id,
                    &stage.name,
                    StageStatus::Cancelled,
                    attempt,
                    Some("stage observed cancellation signal mid-flight".to_string()),
                );
                return StageOutcome::Cancelled;
            }
            Ok(StageOutcome::Failure(reason)) => last_error = reason,
            Err(_) => last_error = format!("stage timed out after {}s", stage.timeout.as_secs()),
        }

        if attempt < stage.retry_count {
            let backoff = if retry_exponential_backoff {
                retry_base_delay.mul_f64(2f64.powi(attempt as i32))
            } else {
                retry_base_delay
            };
            tokio::time::sleep(backoff).await;
        }
    }

    store
        .update_stage_status(
            project_id,
            &stage.name,
            StageStatus::Failed,
            Some(&last_error),
            Some(stage.retry_count),
            None,
            None,
        )
        .ok();
    record_terminal(
        &store,
        &ledger,
        &checkpoint_manager,
        &audit,
        project_id,
        &stage.name,
        StageStatus::Failed,
        stage.retry_count,
        Some(last_error.clone()),
    );
    StageOutcome::Failure(last_error)
}

fn dependents_map(workflow: &WorkflowDef) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for stage in &workflow.stages {
        for dep in &stage.dependencies {
            map.entry(dep.clone()).or_default().push(stage.name.clone());
        }
    }
    map
}

/// Walks every ancestor of `stage`, not just its direct dependencies, so a
/// join stage three levels deep still sees the root of its dependency tree.
fn transitive_dependencies(stage: &StageDef, by_name: &HashMap<&str, &StageDef>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<String> = stage.dependencies.clone();
    while let Some(dep) = stack.pop() {
        if seen.insert(dep.clone())
            && let Some(def) = by_name.get(dep.as_str())
        {
            stack.extend(def.dependencies.clone());
        }
    }
    seen
}

/// Marks every downstream stage reachable from `failed` as skipped, except
/// ones whose registered processor opts out via `can_skip() == false` — a
/// stage that refuses to skip stops the skip propagation through it rather
/// than running with missing upstream input by surprise.
fn mark_transitive_skipped(
    failed: &str,
    dependents: &HashMap<String, Vec<String>>,
    processors: &HashMap<String, Arc<dyn StageProcessor>>,
    skipped: &mut HashSet<String>,
) {
    let mut stack = vec![failed.to_string()];
    while let Some(name) = stack.pop() {
        if let Some(deps) = dependents.get(&name) {
            for dep in deps {
                let can_skip = processors.get(dep).map(|p| p.can_skip()).unwrap_or(true);
                if can_skip && skipped.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }
    }
}
