//! C6 — Checkpoint & Recovery.
//!
//! Periodic JSON snapshots of a project's stage/artifact state under
//! `{project}/checkpoints/NNN.json`, integrity-checked with a sha256
//! checksum and written atomically (write-to-tmp-then-rename), mirroring
//! the teacher's `AuditLogger::save_current` persistence style but keyed
//! by sequence number instead of a single current-run file, with a
//! retention policy that prunes older snapshots.

use crate::config::ReconcileMode;
use crate::error::CheckpointError;
use crate::ledger::ArtifactLedger;
use crate::model::{ArtifactRef, StageRecord, StageStatus};
use crate::store::ProjectStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub sequence: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub project_id: String,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<ArtifactRef>,
    pub checksum: String,
}

impl Checkpoint {
    fn compute_checksum(
        project_id: &str,
        sequence: u64,
        stages: &[StageRecord],
        artifacts: &[ArtifactRef],
    ) -> Result<String, CheckpointError> {
        let mut hasher = Sha256::new();
        hasher.update(project_id.as_bytes());
        hasher.update(sequence.to_le_bytes());
        hasher.update(serde_json::to_vec(stages)?);
        hasher.update(serde_json::to_vec(artifacts)?);
        Ok(hex::encode(hasher.finalize()))
    }

    fn verify_checksum(&self) -> Result<(), CheckpointError> {
        let expected =
            Self::compute_checksum(&self.project_id, self.sequence, &self.stages, &self.artifacts)?;
        if expected != self.checksum {
            return Err(CheckpointError::ChecksumMismatch {
                expected,
                computed: self.checksum.clone(),
            });
        }
        Ok(())
    }
}

/// Cloned freely: `locks` is reference-counted so every clone shares the
/// same per-project lock table rather than each call site racing its own.
#[derive(Clone)]
pub struct CheckpointManager {
    retention_count: usize,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CheckpointManager {
    pub fn new(retention_count: usize) -> Self {
        Self { retention_count, locks: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn checkpoint_dir(&self, ledger: &ArtifactLedger, project_id: &str) -> PathBuf {
        ledger.project_root(project_id).join("checkpoints")
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(project_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Snapshot the project's current state to a new checkpoint file,
    /// pruning older ones beyond the retention window.
    ///
    /// `Engine` calls this from multiple concurrently-spawned stage tasks
    /// (one per terminal transition) and from a periodic background task,
    /// all for the same project; without serializing those calls two of
    /// them could compute the same next sequence number and one save
    /// would silently clobber the other's checkpoint file on rename.
    pub fn save(
        &self,
        store: &ProjectStore,
        ledger: &ArtifactLedger,
        project_id: &str,
    ) -> Result<PathBuf, CheckpointError> {
        let lock = self.project_lock(project_id);
        let _guard = lock.lock().unwrap();

        let dir = self.checkpoint_dir(ledger, project_id);
        std::fs::create_dir_all(&dir)?;

        let sequence = self.next_sequence(&dir)?;
        let stages = store.list_stages(project_id)?;
        let artifacts = store.all_artifacts(project_id)?;
        let checksum = Checkpoint::compute_checksum(project_id, sequence, &stages, &artifacts)?;

        let checkpoint = Checkpoint {
            format_version: FORMAT_VERSION,
            sequence,
            timestamp: chrono::Utc::now(),
            project_id: project_id.to_string(),
            stages,
            artifacts,
            checksum,
        };

        let path = dir.join(format!("{sequence:09}.json"));
        let tmp_path = dir.join(format!("{sequence:09}.json.tmp"));
        let content = serde_json::to_vec_pretty(&checkpoint)?;
        std::fs::write(&tmp_path, &content)?;
        std::fs::rename(&tmp_path, &path)?;

        self.prune(&dir)?;
        Ok(path)
    }

    fn next_sequence(&self, dir: &Path) -> Result<u64, CheckpointError> {
        Ok(self.list_checkpoints(dir)?.last().map(|(seq, _)| seq + 1).unwrap_or(0))
    }

    fn list_checkpoints(&self, dir: &Path) -> Result<Vec<(u64, PathBuf)>, CheckpointError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| {
                p.file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|seq| (seq, p))
            })
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        Ok(out)
    }

    fn prune(&self, dir: &Path) -> Result<(), CheckpointError> {
        let checkpoints = self.list_checkpoints(dir)?;
        if checkpoints.len() <= self.retention_count {
            return Ok(());
        }
        let excess = checkpoints.len() - self.retention_count;
        for (_, path) in checkpoints.into_iter().take(excess) {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Load and checksum-verify the most recent checkpoint, if any.
    pub fn load_latest(
        &self,
        ledger: &ArtifactLedger,
        project_id: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let dir = self.checkpoint_dir(ledger, project_id);
        let Some((_, path)) = self.list_checkpoints(&dir)?.pop() else {
            return Ok(None);
        };
        self.load(&path).map(Some)
    }

    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        let content = std::fs::read_to_string(path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content)?;
        if checkpoint.format_version != FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(checkpoint.format_version));
        }
        checkpoint.verify_checksum()?;
        Ok(checkpoint)
    }

    /// Find projects whose store state shows a `Running` stage with no
    /// terminal status — evidence of an interruption mid-execution — and
    /// normalize it to `Failed` so a fresh run can retry it cleanly.
    pub fn resume(&self, store: &ProjectStore, project_id: &str) -> Result<Vec<String>, CheckpointError> {
        let mut interrupted = Vec::new();
        for stage in store.list_stages(project_id)? {
            if stage.status == StageStatus::Running {
                store.update_stage_status(
                    project_id,
                    &stage.step_name,
                    StageStatus::Failed,
                    Some("interrupted: process exited while stage was running"),
                    None,
                    None,
                    None,
                )?;
                interrupted.push(stage.step_name);
            }
        }
        Ok(interrupted)
    }

    /// List every project directory under `ledger`'s `projects_root` whose
    /// latest checkpoint shows a stage still `Running` — evidence that the
    /// process was interrupted mid-execution (§4.6 "FindInterrupted").
    /// Projects with no checkpoint yet, or whose latest checkpoint has no
    /// `Running` stage, are not reported.
    pub fn find_interrupted(&self, ledger: &ArtifactLedger) -> Result<Vec<String>, CheckpointError> {
        let root = ledger.projects_root();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut interrupted = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let project_id = entry.file_name().to_string_lossy().into_owned();
            let Some(checkpoint) = self.load_latest(ledger, &project_id)? else {
                continue;
            };
            if checkpoint.stages.iter().any(|s| s.status == StageStatus::Running) {
                interrupted.push(project_id);
            }
        }
        interrupted.sort();
        Ok(interrupted)
    }

    /// Cross-check a checkpoint's artifact list against the live ledger and
    /// filesystem via [`ArtifactLedger::reconcile`] in report-only mode.
    pub async fn verify(
        &self,
        store: &ProjectStore,
        ledger: &ArtifactLedger,
        project_id: &str,
    ) -> Result<crate::ledger::ReconcileReport, CheckpointError> {
        ledger
            .reconcile(store, project_id, ReconcileMode::ReportOnly)
            .await
            .map_err(|e| CheckpointError::Store(crate::error::StoreError::Integrity(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(dir: &Path) -> (ProjectStore, ArtifactLedger) {
        let store = ProjectStore::open_in_memory().unwrap();
        store
            .create_project("p1", "demo", "theme", &serde_json::json!({}), 1)
            .unwrap();
        store
            .create_stage_records("p1", &[("a".to_string(), 0, serde_json::json!({}))])
            .unwrap();
        let ledger = ArtifactLedger::new(dir.to_path_buf(), None);
        ledger.init_project_dirs("p1").unwrap();
        (store, ledger)
    }

    #[test]
    fn save_then_load_latest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger) = setup(dir.path());
        let manager = CheckpointManager::new(10);
        manager.save(&store, &ledger, "p1").unwrap();
        let loaded = manager.load_latest(&ledger, "p1").unwrap().unwrap();
        assert_eq!(loaded.sequence, 0);
        assert_eq!(loaded.project_id, "p1");
    }

    #[test]
    fn tampered_checkpoint_fails_checksum_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger) = setup(dir.path());
        let manager = CheckpointManager::new(10);
        let path = manager.save(&store, &ledger, "p1").unwrap();
        let mut content: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        content["project_id"] = serde_json::json!("tampered");
        std::fs::write(&path, serde_json::to_string_pretty(&content).unwrap()).unwrap();
        let err = manager.load(&path).unwrap_err();
        assert!(matches!(err, CheckpointError::ChecksumMismatch { .. }));
    }

    #[test]
    fn retention_prunes_oldest_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger) = setup(dir.path());
        let manager = CheckpointManager::new(2);
        for _ in 0..5 {
            manager.save(&store, &ledger, "p1").unwrap();
        }
        let remaining = manager
            .list_checkpoints(&manager.checkpoint_dir(&ledger, "p1"))
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining.last().unwrap().0, 4);
    }

    #[test]
    fn find_interrupted_lists_only_projects_with_a_running_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (store, ledger) = setup(dir.path());
        let manager = CheckpointManager::new(10);

        store
            .create_project("p2", "demo", "theme", &serde_json::json!({}), 1)
            .unwrap();
        store
            .create_stage_records("p2", &[("b".to_string(), 0, serde_json::json!({}))])
            .unwrap();
        ledger.init_project_dirs("p2").unwrap();

        // p1 completes cleanly, p2 is interrupted mid-stage.
        manager.save(&store, &ledger, "p1").unwrap();
        store
            .update_stage_status("p2", "b", StageStatus::Running, None, None, None, None)
            .unwrap();
        manager.save(&store, &ledger, "p2").unwrap();

        let interrupted = manager.find_interrupted(&ledger).unwrap();
        assert_eq!(interrupted, vec!["p2".to_string()]);
    }

    #[test]
    fn resume_normalizes_running_stages_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _ledger) = setup(dir.path());
        store
            .update_stage_status("p1", "a", StageStatus::Running, None, None, None, None)
            .unwrap();
        let manager = CheckpointManager::new(10);
        let interrupted = manager.resume(&store, "p1").unwrap();
        assert_eq!(interrupted, vec!["a".to_string()]);
        let stage = store.get_stage("p1", "a").unwrap().unwrap();
        assert_eq!(stage.status, StageStatus::Failed);
    }
}
