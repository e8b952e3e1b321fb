//! Demo stage processors (§14): minimal [`StageProcessor`] implementations
//! standing in for the real media-generation stages (script writing,
//! text-to-speech, rendering, ...) that are out of scope here. Used by
//! integration tests and the CLI's `init-project --demo` workflow.

use crate::engine::context::{StageContext, StageOutcome, StageProcessor};
use crate::ledger::WriteOptions;
use crate::model::{ArtifactCategory, ArtifactType, DataMap};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

/// Copies its input to its output unchanged.
pub struct EchoStage;

#[async_trait]
impl StageProcessor for EchoStage {
    async fn process(&self, ctx: &StageContext) -> StageOutcome {
        StageOutcome::Success(ctx.input.clone())
    }
}

/// Fails its first `fail_times` invocations, then succeeds. Useful for
/// exercising the engine's retry/backoff path.
pub struct FlakyStage {
    remaining_failures: AtomicU32,
}

impl FlakyStage {
    pub fn new(fail_times: u32) -> Self {
        Self { remaining_failures: AtomicU32::new(fail_times) }
    }
}

#[async_trait]
impl StageProcessor for FlakyStage {
    async fn process(&self, _ctx: &StageContext) -> StageOutcome {
        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            StageOutcome::Failure(format!("flaky: {remaining} failures remaining"))
        } else {
            StageOutcome::Success(DataMap::new())
        }
    }
}

/// Sleeps for a fixed duration before succeeding, for exercising
/// concurrency limits and timeouts. Polls its context's cancellation
/// signal every 50ms rather than sleeping the whole duration in one shot,
/// so it can observe a mid-flight cancellation instead of only ever
/// ending via completion or timeout.
pub struct SleepStage {
    pub duration: std::time::Duration,
}

const CANCEL_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);

#[async_trait]
impl StageProcessor for SleepStage {
    async fn process(&self, ctx: &StageContext) -> StageOutcome {
        let mut remaining = self.duration;
        while !remaining.is_zero() {
            if ctx.is_cancelled() {
                return StageOutcome::Cancelled;
            }
            let step = remaining.min(CANCEL_POLL_INTERVAL);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        StageOutcome::Success(DataMap::new())
    }
}

/// Writes a small text artifact through the ledger, for exercising
/// artifact registration and reconciliation end to end.
pub struct ArtifactWritingStage {
    pub file_name: String,
    pub contents: String,
}

#[async_trait]
impl StageProcessor for ArtifactWritingStage {
    async fn process(&self, ctx: &StageContext) -> StageOutcome {
        let rel_path = format!("files/metadata/{}", self.file_name);
        let result = ctx
            .ledger
            .write_file(
                &ctx.store,
                &ctx.project_id,
                Some(&ctx.stage_name),
                &rel_path,
                self.contents.as_bytes(),
                WriteOptions {
                    category: ArtifactCategory::Output,
                    file_type: ArtifactType::Metadata,
                    is_temporary: false,
                    metadata: serde_json::json!({}),
                },
            )
            .await;
        match result {
            Ok(_) => StageOutcome::Success(
                [("written_path".to_string(), serde_json::json!(rel_path))].into(),
            ),
            Err(e) => StageOutcome::Failure(e.to_string()),
        }
    }
}
