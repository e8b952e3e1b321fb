//! Stage execution context and the [`StageProcessor`] seam.
//!
//! Grounded on the teacher's `ClaudeRunner`/`Phase` split in
//! `dag/executor.rs`: a plain data struct carrying everything a unit of
//! work needs, handed to an async trait object chosen by name. Here the
//! trait is `async_trait` because object-safe native async traits aren't
//! stable yet, matching the teacher's own use of `async_trait` at
//! `orchestrator/mod.rs`.

use crate::engine::ExecutionControl;
use crate::ledger::ArtifactLedger;
use crate::model::DataMap;
use crate::store::ProjectStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a [`StageProcessor`] needs to do its work.
pub struct StageContext {
    pub project_id: String,
    pub stage_name: String,
    pub attempt: u32,
    pub input: DataMap,
    pub store: Arc<ProjectStore>,
    pub ledger: Arc<ArtifactLedger>,
    /// The engine's pause/cancel switch. A long-running stage must poll
    /// [`ExecutionControl::is_cancelled`] rather than run to completion
    /// regardless of the caller asking it to stop.
    pub control: Arc<ExecutionControl>,
}

impl StageContext {
    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

/// What a stage produced.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Success(DataMap),
    Failure(String),
    /// The stage observed the cancellation signal mid-flight and stopped
    /// cooperatively rather than failing or completing.
    Cancelled,
}

/// The seam stage implementations plug into (§4.4 "StageProcessor").
#[async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(&self, ctx: &StageContext) -> StageOutcome;

    /// Whether this stage may be skipped outright when an upstream
    /// dependency fails under `FailurePolicy::SkipDependents`. Most demo
    /// stages are happy to be skipped; a stage that always has to run
    /// (e.g. a cleanup step) can override this to `false`.
    fn can_skip(&self) -> bool {
        true
    }

    /// Optional estimate of how long this stage will take, used to
    /// refine progress reporting beyond the workflow definition's static
    /// `estimated_duration`. Defaults to no override.
    fn estimate_duration(&self) -> Option<std::time::Duration> {
        None
    }
}
