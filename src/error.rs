//! Typed error hierarchy for the workflow orchestration core.
//!
//! One enum per subsystem, matching the taxonomy of the design doc's error
//! handling section — `StoreError`, `LedgerError`, `PlannerError`,
//! `ArbiterError`, `EngineError`, `CheckpointError` — all foldable into the
//! crate-wide [`CoreError`]. Library code never returns `anyhow::Error`;
//! that's reserved for the CLI boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("project {0} already exists")]
    ProjectExists(String),

    #[error("project {0} not found")]
    ProjectNotFound(String),

    #[error("stage {stage} not found in project {project}")]
    StageNotFound { project: String, stage: String },

    #[error("illegal project status transition {from:?} -> {to:?}")]
    IllegalProjectTransition {
        from: crate::model::ProjectStatus,
        to: crate::model::ProjectStatus,
    },

    #[error("illegal stage status transition {from:?} -> {to:?} for stage {stage}")]
    IllegalStageTransition {
        stage: String,
        from: crate::model::StageStatus,
        to: crate::model::StageStatus,
    },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("store migration would downgrade from version {current} to {requested}")]
    MigrationDowngrade { current: i64, requested: i64 },

    #[error("store I/O error: {0}")]
    Io(#[source] rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Io(e)
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("path '{0}' escapes the project root")]
    PathTraversal(String),

    #[error("artifact would exceed the project byte quota ({limit} bytes)")]
    Quota { limit: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("filesystem error: {0}")]
    Filesystem(#[source] std::io::Error),
}

impl From<std::io::Error> for LedgerError {
    fn from(e: std::io::Error) -> Self {
        LedgerError::Filesystem(e)
    }
}

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("duplicate stage name '{0}' in workflow")]
    DuplicateStage(String),

    #[error("dependency cycle detected, smallest unresolved component: {members:?}")]
    Cycle { members: Vec<String> },
}

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("unknown resource '{0}'")]
    UnknownResource(String),

    #[error("request for {requested} units of '{resource}' exceeds pool capacity {capacity}")]
    Infeasible {
        resource: String,
        requested: usize,
        capacity: usize,
    },

    #[error("acquiring {0:?} would create a resource wait-for cycle")]
    Deadlock(Vec<String>),

    #[error("acquisition cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("no stage processor registered for stage '{0}'")]
    NoProcessor(String),

    #[error("stage '{stage}' timed out after {elapsed_secs}s")]
    Timeout { stage: String, elapsed_secs: u64 },

    #[error("execution was cancelled: {reason}")]
    Cancelled { reason: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    #[error("unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Crate-wide error, folding every subsystem error into one type.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Arbiter(#[from] ArbiterError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid input: {0}")]
    Validation(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProjectStatus, StageStatus};

    #[test]
    fn store_error_illegal_transition_is_matchable() {
        let err = StoreError::IllegalProjectTransition {
            from: ProjectStatus::Completed,
            to: ProjectStatus::Processing,
        };
        assert!(matches!(err, StoreError::IllegalProjectTransition { .. }));
    }

    #[test]
    fn core_error_converts_from_store_error() {
        let inner = StoreError::ProjectNotFound("p1".into());
        let core: CoreError = inner.into();
        match core {
            CoreError::Store(StoreError::ProjectNotFound(id)) => assert_eq!(id, "p1"),
            _ => panic!("expected CoreError::Store"),
        }
    }

    #[test]
    fn engine_error_converts_from_planner_error() {
        let inner = PlannerError::UnknownDependency {
            stage: "b".into(),
            dependency: "z".into(),
        };
        let engine: EngineError = inner.into();
        assert!(matches!(engine, EngineError::Planner(_)));
    }

    #[test]
    fn arbiter_error_deadlock_carries_cycle_members() {
        let err = ArbiterError::Deadlock(vec!["a".into(), "b".into()]);
        assert!(err.to_string().contains("a"));
    }

    #[test]
    fn stage_status_illegal_transition_message() {
        let err = StoreError::IllegalStageTransition {
            stage: "encode".into(),
            from: StageStatus::Completed,
            to: StageStatus::Running,
        };
        assert!(err.to_string().contains("encode"));
    }
}
