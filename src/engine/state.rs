//! Execution snapshots and progress events, grounded on the teacher's
//! `dag/state.rs` (`DagState`, `DagSummary`, `ExecutionTimer`): a small
//! timer type plus a tagged event enum, generalized from per-phase
//! iteration counts to per-stage durations and a named-stage summary.

use crate::model::StageStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Rate-limited event emitted during execution (§4.6 "Progress events",
/// capped at one emission per 100ms per the engine's emitter).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseStarted { phase: usize, stages: Vec<String> },
    StageStarted { stage: String, attempt: u32 },
    StageCompleted { stage: String, status: StageStatus },
    PhaseCompleted { phase: usize, completed: usize, failed: usize },
    /// Counts-by-status snapshot plus a time estimate (§4.5 "progress
    /// events"), emitted alongside phase boundaries.
    Progress {
        pending: usize,
        running: usize,
        completed: usize,
        failed: usize,
        skipped: usize,
        total: usize,
        percent_complete: f64,
        estimated_remaining_secs: f64,
    },
    ExecutionCompleted { success: bool },
}

/// Emits [`ProgressEvent`]s to a channel, dropping events faster than
/// once per 100ms rather than letting a slow consumer stall the engine.
pub struct ProgressEmitter {
    tx: Option<tokio::sync::mpsc::Sender<ProgressEvent>>,
    last_emit: std::sync::Mutex<Option<Instant>>,
}

impl ProgressEmitter {
    pub fn new(tx: Option<tokio::sync::mpsc::Sender<ProgressEvent>>) -> Self {
        Self {
            tx,
            last_emit: std::sync::Mutex::new(None),
        }
    }

    /// Phase/execution boundaries always emit; per-stage chatter is
    /// throttled to avoid flooding a slow UI consumer.
    pub async fn emit(&self, event: ProgressEvent, throttle: bool) {
        let Some(tx) = &self.tx else { return };
        if throttle {
            let mut last = self.last_emit.lock().unwrap();
            let now = Instant::now();
            if let Some(prev) = *last
                && now.duration_since(prev) < Duration::from_millis(100)
            {
                return;
            }
            *last = Some(now);
        }
        let _ = tx.send(event).await;
    }
}

/// Summary produced once an execution finishes (success, partial, or
/// cancelled).
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    pub stage_statuses: HashMap<String, StageStatus>,
    pub duration: Duration,
}

impl ExecutionSummary {
    pub fn all_terminal_successful(&self) -> bool {
        !self.stage_statuses.is_empty()
            && self
                .stage_statuses
                .values()
                .all(|s| matches!(s, StageStatus::Completed | StageStatus::Skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn throttled_events_are_dropped_within_the_window() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        let emitter = ProgressEmitter::new(Some(tx));
        emitter
            .emit(ProgressEvent::StageStarted { stage: "a".into(), attempt: 1 }, true)
            .await;
        emitter
            .emit(ProgressEvent::StageStarted { stage: "b".into(), attempt: 1 }, true)
            .await;
        drop(emitter);
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unthrottled_events_always_emit() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(10);
        let emitter = ProgressEmitter::new(Some(tx));
        emitter
            .emit(ProgressEvent::PhaseStarted { phase: 0, stages: vec!["a".into()] }, false)
            .await;
        emitter
            .emit(ProgressEvent::PhaseCompleted { phase: 0, completed: 1, failed: 0 }, false)
            .await;
        drop(emitter);
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn summary_requires_nonempty_all_terminal_success() {
        let mut summary = ExecutionSummary::default();
        assert!(!summary.all_terminal_successful());
        summary.stage_statuses.insert("a".into(), StageStatus::Completed);
        assert!(summary.all_terminal_successful());
        summary.stage_statuses.insert("b".into(), StageStatus::Failed);
        assert!(!summary.all_terminal_successful());
    }
}
